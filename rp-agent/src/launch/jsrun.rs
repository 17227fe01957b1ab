//! JSRUN launch method: IBM's LSF-integrated resource-set launcher (Summit
//! and similar systems). Requires a rank/resource-set file.

use rp_core::error::Result;
use rp_core::model::{Slots, Task};

use super::{Capabilities, LaunchCommand, LaunchMethod};

pub struct Jsrun {
    lsf_available: bool,
}

impl Jsrun {
    pub fn new(lsf_available: bool) -> Self {
        Self { lsf_available }
    }
}

impl LaunchMethod for Jsrun {
    fn name(&self) -> &'static str {
        "JSRUN"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { supports_mpi: true, needs_rank_file: true, env_isolation_required: true }
    }

    fn applicable(&self, _task: &Task) -> bool {
        self.lsf_available
    }

    fn command(&self, task: &Task, slots: &Slots, exec_script: &str) -> Result<LaunchCommand> {
        let rank_file = slots
            .placements
            .iter()
            .flat_map(|p| p.core_ids.iter().map(move |c| format!("rank: host={} core={}", p.node_id, c)))
            .collect::<Vec<_>>()
            .join("\n");
        let argv = vec![
            "jsrun".to_string(),
            "--erf_input".to_string(),
            "rank_file".to_string(),
            "--tasks_per_rs".to_string(),
            "1".to_string(),
            "--cpu_per_rs".to_string(),
            task.description.cores_per_rank.max(1).to_string(),
            exec_script.to_string(),
        ];
        Ok(LaunchCommand { argv, aux_files: vec![("rank_file".to_string(), rank_file)] })
    }

    fn rank_id_variable(&self) -> &'static str {
        "OMPI_COMM_WORLD_RANK"
    }

    fn injected_env_prefixes(&self) -> &'static [&'static str] {
        &["LSF_", "JSM_", "OMPI_"]
    }
}
