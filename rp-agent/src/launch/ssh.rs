//! SSH launch method: places each rank via an `ssh <host> <exec>` call,
//! used on platforms without a batch-system launcher but with passwordless
//! SSH between the first node and the rest of the allocation.

use rp_core::error::Result;
use rp_core::model::{Slots, Task};

use super::{Capabilities, LaunchCommand, LaunchMethod};

pub struct Ssh {
    available: bool,
}

impl Ssh {
    pub fn new(available: bool) -> Self {
        Self { available }
    }
}

impl LaunchMethod for Ssh {
    fn name(&self) -> &'static str {
        "SSH"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { supports_mpi: false, needs_rank_file: false, env_isolation_required: true }
    }

    fn applicable(&self, task: &Task) -> bool {
        self.available && !task.description.is_mpi()
    }

    fn command(&self, _task: &Task, slots: &Slots, exec_script: &str) -> Result<LaunchCommand> {
        let mut argv = vec!["bash".to_string(), "-c".to_string()];
        let per_host: Vec<String> = slots
            .placements
            .iter()
            .map(|p| format!("ssh {} {}", p.node_id, exec_script))
            .collect();
        argv.push(per_host.join(" && "));
        Ok(LaunchCommand { argv, aux_files: vec![] })
    }

    fn rank_id_variable(&self) -> &'static str {
        "RP_RANK"
    }

    fn injected_env_prefixes(&self) -> &'static [&'static str] {
        &["SSH_"]
    }
}
