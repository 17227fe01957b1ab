//! APRUN launch method: Cray ALPS launcher.

use rp_core::error::Result;
use rp_core::model::{Slots, Task};

use super::{Capabilities, LaunchCommand, LaunchMethod};

pub struct Aprun {
    alps_available: bool,
}

impl Aprun {
    pub fn new(alps_available: bool) -> Self {
        Self { alps_available }
    }
}

impl LaunchMethod for Aprun {
    fn name(&self) -> &'static str {
        "APRUN"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { supports_mpi: true, needs_rank_file: false, env_isolation_required: true }
    }

    fn applicable(&self, _task: &Task) -> bool {
        self.alps_available
    }

    fn command(&self, task: &Task, slots: &Slots, exec_script: &str) -> Result<LaunchCommand> {
        let num_nodes = slots.placements.len().max(1);
        let argv = vec![
            "aprun".to_string(),
            "-n".to_string(),
            task.description.ranks.to_string(),
            "-N".to_string(),
            (task.description.ranks as usize / num_nodes).max(1).to_string(),
            "-d".to_string(),
            task.description.cores_per_rank.max(1).to_string(),
            exec_script.to_string(),
        ];
        Ok(LaunchCommand { argv, aux_files: vec![] })
    }

    fn rank_id_variable(&self) -> &'static str {
        "ALPS_APP_PE"
    }

    fn injected_env_prefixes(&self) -> &'static [&'static str] {
        &["ALPS_", "CRAY_"]
    }
}
