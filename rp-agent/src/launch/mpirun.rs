//! MPIRUN / MPIEXEC / PRTE: generic MPI-runtime launchers addressed by a
//! host file. All three share the same shape and differ only in binary
//! name and the rank variable their runtime exposes.

use rp_core::error::Result;
use rp_core::model::{Slots, Task};

use super::{Capabilities, LaunchCommand, LaunchMethod};

fn host_file(slots: &Slots) -> String {
    slots
        .placements
        .iter()
        .map(|p| format!("{} slots={}", p.node_id, p.core_ids.len().max(1)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn mpi_command(
    binary: &str,
    task: &Task,
    slots: &Slots,
    exec_script: &str,
) -> LaunchCommand {
    let argv = vec![
        binary.to_string(),
        "-np".to_string(),
        task.description.ranks.to_string(),
        "--hostfile".to_string(),
        "hostfile".to_string(),
        exec_script.to_string(),
    ];
    LaunchCommand { argv, aux_files: vec![("hostfile".to_string(), host_file(slots))] }
}

macro_rules! mpi_launch_method {
    ($struct_name:ident, $method_name:literal, $binary:literal, $rank_var:literal) => {
        pub struct $struct_name {
            mpi_available: bool,
        }

        impl $struct_name {
            pub fn new(mpi_available: bool) -> Self {
                Self { mpi_available }
            }
        }

        impl LaunchMethod for $struct_name {
            fn name(&self) -> &'static str {
                $method_name
            }

            fn capabilities(&self) -> Capabilities {
                Capabilities {
                    supports_mpi: true,
                    needs_rank_file: true,
                    env_isolation_required: true,
                }
            }

            fn applicable(&self, task: &Task) -> bool {
                self.mpi_available && task.description.is_mpi()
            }

            fn command(
                &self,
                task: &Task,
                slots: &Slots,
                exec_script: &str,
            ) -> Result<LaunchCommand> {
                Ok(mpi_command($binary, task, slots, exec_script))
            }

            fn rank_id_variable(&self) -> &'static str {
                $rank_var
            }

            fn injected_env_prefixes(&self) -> &'static [&'static str] {
                &["OMPI_", "PMIX_", "MPICH_", "I_MPI_"]
            }
        }
    };
}

mpi_launch_method!(Mpirun, "MPIRUN", "mpirun", "OMPI_COMM_WORLD_RANK");
mpi_launch_method!(Mpiexec, "MPIEXEC", "mpiexec", "PMI_RANK");
mpi_launch_method!(Prte, "PRTE", "prterun", "PMIX_RANK");

#[cfg(test)]
mod tests {
    use super::*;
    use rp_core::model::{NodeSlots, Payload, TaskDescription, ThreadingType};
    use std::collections::HashMap;

    #[test]
    fn mpirun_writes_a_hostfile_matching_the_placement() {
        let desc = TaskDescription {
            payload: Payload::Executable { path: "a.out".into(), arguments: vec![] },
            environment: HashMap::new(),
            ranks: 6,
            cores_per_rank: 1,
            gpus_per_rank: 0,
            threading_type: ThreadingType::Mpi,
            mem_per_rank: 0,
            lfs_per_rank: 0,
            pre_exec: vec![],
            post_exec: vec![],
            pre_launch: vec![],
            post_launch: vec![],
            input_staging: vec![],
            output_staging: vec![],
            stdout: None,
            stderr: None,
            sandbox: None,
            named_env: None,
            tags: HashMap::new(),
        };
        let task = Task::new("t0", desc);
        let slots = Slots {
            placements: vec![
                NodeSlots { node_id: "n0".into(), core_ids: vec![0, 1, 2, 3], gpu_ids: vec![], lfs_size: 0, mem: 0 },
                NodeSlots { node_id: "n1".into(), core_ids: vec![0, 1], gpu_ids: vec![], lfs_size: 0, mem: 0 },
            ],
        };
        let mpirun = Mpirun::new(true);
        assert!(mpirun.applicable(&task));
        let cmd = mpirun.command(&task, &slots, "/sbx/t0.exec.sh").unwrap();
        assert!(cmd.argv.contains(&"mpirun".to_string()));
        let (_, hostfile) = &cmd.aux_files[0];
        assert_eq!(hostfile, "n0 slots=4\nn1 slots=2");
    }
}
