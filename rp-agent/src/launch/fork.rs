//! FORK launch method: spawns ranks directly with no external launcher
//! binary. Always applicable to non-MPI tasks; the fallback of last resort
//! when no batch-system launcher is configured.

use rp_core::error::Result;
use rp_core::model::{Slots, Task};

use super::{Capabilities, LaunchCommand, LaunchMethod};

pub struct Fork;

impl Fork {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Fork {
    fn default() -> Self {
        Self::new()
    }
}

impl LaunchMethod for Fork {
    fn name(&self) -> &'static str {
        "FORK"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { supports_mpi: false, needs_rank_file: false, env_isolation_required: false }
    }

    fn applicable(&self, task: &Task) -> bool {
        !task.description.is_mpi()
    }

    fn command(&self, task: &Task, _slots: &Slots, exec_script: &str) -> Result<LaunchCommand> {
        let ranks = task.description.ranks.max(1);
        // No launcher binary: loop over ranks in a tiny wrapper, exporting
        // the rank id FORK's rank variable exposes.
        let loop_body = format!(
            "for r in $(seq 0 {}); do {}=$r {}; done",
            ranks - 1,
            self.rank_id_variable(),
            exec_script
        );
        Ok(LaunchCommand { argv: vec!["bash".into(), "-c".into(), loop_body], aux_files: vec![] })
    }

    fn rank_id_variable(&self) -> &'static str {
        "RP_RANK"
    }

    fn injected_env_prefixes(&self) -> &'static [&'static str] {
        &[]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_core::model::{Payload, Slots, TaskDescription, ThreadingType};
    use std::collections::HashMap;

    #[test]
    fn fork_is_applicable_only_to_non_mpi_tasks() {
        let fork = Fork::new();
        let mut desc = TaskDescription {
            payload: Payload::Executable { path: "date".into(), arguments: vec![] },
            environment: HashMap::new(),
            ranks: 1,
            cores_per_rank: 1,
            gpus_per_rank: 0,
            threading_type: ThreadingType::None,
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
        let task = Task::new("t0", desc.clone());
        assert!(fork.applicable(&task));
        desc.threading_type = ThreadingType::Mpi;
        let task = Task::new("t0", desc);
        assert!(!fork.applicable(&task));
    }

    #[test]
    fn fork_command_loops_over_ranks() {
        let fork = Fork::new();
        let desc = TaskDescription {
            payload: Payload::Executable { path: "date".into(), arguments: vec![] },
            environment: HashMap::new(),
            ranks: 3,
            cores_per_rank: 1,
            gpus_per_rank: 0,
            threading_type: ThreadingType::None,
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
        let cmd = fork.command(&task, &Slots::default(), "/sandbox/t0.exec.sh").unwrap();
        assert!(cmd.argv.iter().any(|a| a.contains("seq 0 2")));
    }
}
