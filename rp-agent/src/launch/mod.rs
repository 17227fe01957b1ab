//! Launch-Method registry (spec §4.4). Each method translates a task plus
//! a slot assignment into a launcher invocation; the registry selects the
//! first applicable method per `launch_methods.order`.

mod aprun;
mod flux;
mod fork;
mod jsrun;
mod mpirun;
mod ssh;
mod srun;

pub use aprun::Aprun;
pub use flux::Flux;
pub use fork::Fork;
pub use jsrun::Jsrun;
pub use mpirun::{Mpiexec, Mpirun, Prte};
pub use ssh::Ssh;
pub use srun::Srun;

use rp_core::error::{Error, Result};
use rp_core::model::{Slots, Task};

/// Capabilities a launch method declares about itself (spec §4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub supports_mpi: bool,
    pub needs_rank_file: bool,
    pub env_isolation_required: bool,
}

/// A launcher invocation plus any auxiliary files (e.g. a rank/host file)
/// that must be written alongside `<uid>.launch.sh`.
pub struct LaunchCommand {
    pub argv: Vec<String>,
    pub aux_files: Vec<(String, String)>,
}

/// Stateless registered launch method (spec §4.4).
pub trait LaunchMethod: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Whether this method can run the given task on this platform.
    fn applicable(&self, task: &Task) -> bool;

    /// Build the `argv` and any auxiliary files needed to invoke the
    /// launcher for `task` given its `slots`. `exec_script` is the path to
    /// the per-rank `<uid>.exec.sh` the launcher must invoke once per rank.
    fn command(&self, task: &Task, slots: &Slots, exec_script: &str) -> Result<LaunchCommand>;

    /// Environment variable exposing the MPI/launcher rank to a spawned
    /// process (spec §4.4: `SLURM_PROCID`, `PMIX_RANK`,
    /// `OMPI_COMM_WORLD_RANK`, ...).
    fn rank_id_variable(&self) -> &'static str;

    /// Launcher-injected environment variable *prefixes* that must never
    /// leak into a `pre_exec` subshell (spec §4.3 environment isolation
    /// contract, testable property 6).
    fn injected_env_prefixes(&self) -> &'static [&'static str];

    /// Idempotent environment prep, run once per agent lifetime the first
    /// time this method is selected (spec §4.4 `pre_exec_cached`).
    fn pre_exec_cached(&self) -> &[String] {
        &[]
    }
}

/// Holds the configured set of launch methods and picks the first
/// applicable one in `order`.
pub struct LaunchMethodRegistry {
    methods: Vec<Box<dyn LaunchMethod>>,
    order: Vec<String>,
}

impl LaunchMethodRegistry {
    pub fn new(methods: Vec<Box<dyn LaunchMethod>>, order: Vec<String>) -> Self {
        Self { methods, order }
    }

    /// Build a registry covering every method spec §4.4 requires, probing
    /// each launcher binary's availability with `which` (spec §4.4
    /// `applicable` is platform detection, not just configuration).
    pub fn detect(order: Vec<String>) -> Self {
        let has = |bin: &str| which::which(bin).is_ok();
        let methods: Vec<Box<dyn LaunchMethod>> = vec![
            Box::new(Srun::new(has("srun"))),
            Box::new(Mpirun::new(has("mpirun"))),
            Box::new(Mpiexec::new(has("mpiexec"))),
            Box::new(Jsrun::new(has("jsrun"))),
            Box::new(Aprun::new(has("aprun"))),
            Box::new(Prte::new(has("prterun"))),
            Box::new(Ssh::new(has("ssh"))),
            Box::new(Fork::new()),
            Box::new(Flux::new(has("flux"))),
        ];
        Self { methods, order }
    }

    /// Resolve the launch method for a task: first entry in `order` whose
    /// `applicable(task)` is true (spec §4.3 step 1).
    pub fn resolve(&self, task: &Task) -> Result<&dyn LaunchMethod> {
        for name in &self.order {
            if let Some(method) = self.methods.iter().find(|m| m.name() == name) {
                if method.applicable(task) {
                    return Ok(method.as_ref());
                }
            }
        }
        Err(Error::LMUnavailable {
            method: self.order.join(","),
            reason: "no configured launch method is applicable to this task".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_core::model::{Payload, TaskDescription, ThreadingType};
    use std::collections::HashMap;

    fn desc(mpi: bool) -> TaskDescription {
        TaskDescription {
            payload: Payload::Executable { path: "date".into(), arguments: vec![] },
            environment: HashMap::new(),
            ranks: 1,
            cores_per_rank: 1,
            gpus_per_rank: 0,
            threading_type: if mpi { ThreadingType::Mpi } else { ThreadingType::None },
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
        }
    }

    #[test]
    fn registry_picks_first_applicable_in_order() {
        let methods: Vec<Box<dyn LaunchMethod>> =
            vec![Box::new(Srun::new(false)), Box::new(Fork::new())];
        let registry = LaunchMethodRegistry::new(methods, vec!["SRUN".into(), "FORK".into()]);
        let task = Task::new("t0", desc(false));
        let resolved = registry.resolve(&task).unwrap();
        assert_eq!(resolved.name(), "FORK");
    }

    #[test]
    fn registry_errors_when_nothing_applies() {
        let methods: Vec<Box<dyn LaunchMethod>> = vec![Box::new(Srun::new(false))];
        let registry = LaunchMethodRegistry::new(methods, vec!["SRUN".into()]);
        let task = Task::new("t0", desc(true));
        assert!(registry.resolve(&task).is_err());
    }
}
