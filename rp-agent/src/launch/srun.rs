//! SRUN launch method: SLURM's native job step launcher. Requires a SLURM
//! resource manager.

use rp_core::error::Result;
use rp_core::model::{Slots, Task};

use super::{Capabilities, LaunchCommand, LaunchMethod};

pub struct Srun {
    slurm_available: bool,
}

impl Srun {
    pub fn new(slurm_available: bool) -> Self {
        Self { slurm_available }
    }
}

impl LaunchMethod for Srun {
    fn name(&self) -> &'static str {
        "SRUN"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { supports_mpi: true, needs_rank_file: false, env_isolation_required: true }
    }

    fn applicable(&self, _task: &Task) -> bool {
        self.slurm_available
    }

    fn command(&self, task: &Task, slots: &Slots, exec_script: &str) -> Result<LaunchCommand> {
        let nodelist = slots
            .placements
            .iter()
            .map(|p| p.node_id.clone())
            .collect::<Vec<_>>()
            .join(",");
        let mut argv = vec![
            "srun".to_string(),
            "--nodelist".to_string(),
            nodelist,
            "--ntasks".to_string(),
            task.description.ranks.to_string(),
            "--cpus-per-task".to_string(),
            task.description.cores_per_rank.max(1).to_string(),
        ];
        if task.description.gpus_per_rank > 0 {
            argv.push("--gpus-per-task".to_string());
            argv.push(task.description.gpus_per_rank.to_string());
        }
        argv.push(exec_script.to_string());
        Ok(LaunchCommand { argv, aux_files: vec![] })
    }

    fn rank_id_variable(&self) -> &'static str {
        "SLURM_PROCID"
    }

    fn injected_env_prefixes(&self) -> &'static [&'static str] {
        &["SLURM_", "PMIX_", "PMI_"]
    }
}
