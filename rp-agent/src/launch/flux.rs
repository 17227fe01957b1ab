//! FLUX launch method: Flux Framework's `flux run`, addressed by its own
//! resource broker rather than a host/rank file.

use rp_core::error::Result;
use rp_core::model::{Slots, Task};

use super::{Capabilities, LaunchCommand, LaunchMethod};

pub struct Flux {
    flux_available: bool,
}

impl Flux {
    pub fn new(flux_available: bool) -> Self {
        Self { flux_available }
    }
}

impl LaunchMethod for Flux {
    fn name(&self) -> &'static str {
        "FLUX"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { supports_mpi: true, needs_rank_file: false, env_isolation_required: true }
    }

    fn applicable(&self, _task: &Task) -> bool {
        self.flux_available
    }

    fn command(&self, task: &Task, slots: &Slots, exec_script: &str) -> Result<LaunchCommand> {
        let argv = vec![
            "flux".to_string(),
            "run".to_string(),
            "-N".to_string(),
            slots.placements.len().max(1).to_string(),
            "-n".to_string(),
            task.description.ranks.to_string(),
            "-c".to_string(),
            task.description.cores_per_rank.max(1).to_string(),
            exec_script.to_string(),
        ];
        Ok(LaunchCommand { argv, aux_files: vec![] })
    }

    fn rank_id_variable(&self) -> &'static str {
        "FLUX_TASK_RANK"
    }

    fn injected_env_prefixes(&self) -> &'static [&'static str] {
        &["FLUX_"]
    }
}
