//! Staging-Input and Staging-Output (spec §4.5): mirror components run
//! before scheduling and after execution respectively. Both walk a task's
//! staging directives and apply `TRANSFER` / `LINK` / `COPY` against the
//! client/session/pilot/task sandboxes.

use std::path::{Path, PathBuf};

use rp_core::error::{Error, Result};
use rp_core::model::{StagingAction, StagingDirective, Task, TaskState};
use tracing::{debug, info};

/// The sandbox roots a staging URL may reference (spec §4.5), resolved
/// from environment variables set at agent boot.
#[derive(Debug, Clone)]
pub struct SandboxRoots {
    pub client: PathBuf,
    pub session: PathBuf,
    pub pilot: PathBuf,
}

impl SandboxRoots {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            client: env_path("RP_CLIENT_SANDBOX")?,
            session: env_path("RP_SESSION_SANDBOX")?,
            pilot: env_path("RP_PILOT_SANDBOX")?,
        })
    }

    pub fn new(client: impl Into<PathBuf>, session: impl Into<PathBuf>, pilot: impl Into<PathBuf>) -> Self {
        Self { client: client.into(), session: session.into(), pilot: pilot.into() }
    }

    /// Resolve a `scheme:///path` staging URL against the known sandbox
    /// roots; `task:///...` resolves relative to the task's own sandbox,
    /// and bare `file:///...` paths pass through unchanged.
    pub fn resolve(&self, url: &str, task_sandbox: &Path) -> Result<PathBuf> {
        let (scheme, rest) = split_scheme(url)?;
        if scheme == "file" {
            return Ok(PathBuf::from(rest));
        }
        let root = match scheme {
            "client" => &self.client,
            "session" => &self.session,
            "pilot" => &self.pilot,
            "task" => task_sandbox,
            other => {
                return Err(Error::Staging {
                    directive: url.to_string(),
                    reason: format!("unknown sandbox scheme '{other}'"),
                })
            }
        };
        Ok(root.join(rest.trim_start_matches('/')))
    }
}

fn env_path(name: &str) -> Result<PathBuf> {
    std::env::var(name)
        .map(PathBuf::from)
        .map_err(|_| Error::Configuration(format!("{name} not set at agent boot")))
}

fn split_scheme(url: &str) -> Result<(&str, &str)> {
    url.split_once(":///")
        .ok_or_else(|| Error::Staging {
            directive: url.to_string(),
            reason: "missing scheme, expected scheme:///path".into(),
        })
}

pub struct Staging {
    roots: SandboxRoots,
    bulk_mkdir_threshold: usize,
}

impl Staging {
    pub fn new(roots: SandboxRoots, bulk_mkdir_threshold: usize) -> Self {
        Self { roots, bulk_mkdir_threshold }
    }

    /// Run Staging-Input: materialize `input_staging` directives in the
    /// task sandbox before scheduling. On failure the task is marked
    /// FAILED; since this runs before the Scheduler ever sees the task, no
    /// slots are ever acquired for it (spec §4.3 failure-mode symmetry).
    pub fn stage_input(&self, mut task: Task, task_sandbox: &Path) -> Task {
        if task.state == TaskState::New {
            if let Err(e) = task.transition(TaskState::AgentStagingInputPending) {
                task.fail(e.to_string());
                return task;
            }
        }
        let directives = task.description.input_staging.clone();
        match self.apply(&directives, task_sandbox) {
            Ok(()) => {
                if let Err(e) = task.transition(TaskState::AgentStagingInput) {
                    task.fail(e.to_string());
                }
                task
            }
            Err(e) => {
                task.fail(e.to_string());
                task
            }
        }
    }

    /// Run Staging-Output: collect `output_staging` directives from the
    /// task sandbox after the Executor reaps the child.
    pub fn stage_output(&self, mut task: Task, task_sandbox: &Path) -> Task {
        if task.state == TaskState::New {
            for state in [
                TaskState::AgentStagingInputPending,
                TaskState::AgentStagingInput,
                TaskState::AgentSchedulingPending,
                TaskState::AgentScheduling,
                TaskState::AgentExecutingPending,
                TaskState::AgentExecuting,
                TaskState::AgentStagingOutputPending,
            ] {
                if let Err(e) = task.transition(state) {
                    task.fail(e.to_string());
                    return task;
                }
            }
        }
        let directives = task.description.output_staging.clone();
        match self.apply(&directives, task_sandbox) {
            Ok(()) => {
                if let Err(e) = task.transition(TaskState::AgentStagingOutput) {
                    task.fail(e.to_string());
                }
                task
            }
            Err(e) => {
                task.fail(e.to_string());
                task
            }
        }
    }

    fn apply(&self, directives: &[StagingDirective], task_sandbox: &Path) -> Result<()> {
        self.bulk_mkdir(directives, task_sandbox)?;
        for directive in directives {
            self.apply_one(directive, task_sandbox)?;
        }
        Ok(())
    }

    /// spec §4.5: "When bulk size >= task_bulk_mkdir_threshold, directory
    /// creation is batched into a single `mkdir -p` of many paths."
    fn bulk_mkdir(&self, directives: &[StagingDirective], task_sandbox: &Path) -> Result<()> {
        let mut parents = Vec::new();
        for d in directives {
            let target = self.roots.resolve(&d.target, task_sandbox)?;
            if let Some(parent) = target.parent() {
                if !parents.contains(&parent.to_path_buf()) {
                    parents.push(parent.to_path_buf());
                }
            }
        }
        if parents.len() >= self.bulk_mkdir_threshold && !parents.is_empty() {
            debug!(count = parents.len(), "batching directory creation into one mkdir -p");
            let status = std::process::Command::new("mkdir").arg("-p").args(&parents).status()?;
            if !status.success() {
                return Err(Error::Staging {
                    directive: "bulk mkdir".into(),
                    reason: format!("mkdir -p exited with {status}"),
                });
            }
        } else {
            for parent in &parents {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn apply_one(&self, directive: &StagingDirective, task_sandbox: &Path) -> Result<()> {
        let source = self.roots.resolve(&directive.source, task_sandbox)?;
        let target = self.roots.resolve(&directive.target, task_sandbox)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let result = match directive.action {
            StagingAction::Transfer | StagingAction::Copy => std::fs::copy(&source, &target).map(|_| ()),
            StagingAction::Link => {
                #[cfg(unix)]
                {
                    std::os::unix::fs::symlink(&source, &target)
                }
                #[cfg(not(unix))]
                {
                    std::fs::copy(&source, &target).map(|_| ())
                }
            }
        };

        result.map_err(|e| Error::Staging {
            directive: format!("{:?} {} -> {}", directive.action, directive.source, directive.target),
            reason: e.to_string(),
        })?;
        info!(source = %source.display(), target = %target.display(), "staged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_core::model::{Payload, TaskDescription, ThreadingType};
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn desc(input: Vec<StagingDirective>, output: Vec<StagingDirective>) -> TaskDescription {
        TaskDescription {
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
            input_staging: input,
            output_staging: output,
            stdout: None,
            stderr: None,
            sandbox: None,
            named_env: None,
            tags: HashMap::new(),
        }
    }

    #[test]
    fn resolve_maps_each_scheme_to_its_root() {
        let roots = SandboxRoots::new("/client", "/session", "/pilot");
        let task_sbx = Path::new("/pilot/t0");
        assert_eq!(roots.resolve("client:///a.txt", task_sbx).unwrap(), PathBuf::from("/client/a.txt"));
        assert_eq!(roots.resolve("session:///b.txt", task_sbx).unwrap(), PathBuf::from("/session/b.txt"));
        assert_eq!(roots.resolve("task:///c.txt", task_sbx).unwrap(), PathBuf::from("/pilot/t0/c.txt"));
    }

    #[test]
    fn resolve_rejects_unknown_scheme() {
        let roots = SandboxRoots::new("/client", "/session", "/pilot");
        assert!(roots.resolve("ftp:///x", Path::new("/pilot/t0")).is_err());
    }

    #[test]
    fn stage_input_copies_file_into_task_sandbox() {
        let client = tempdir().unwrap();
        let pilot = tempdir().unwrap();
        std::fs::write(client.path().join("input.dat"), b"hello").unwrap();

        let roots = SandboxRoots::new(client.path(), tempdir().unwrap().path(), pilot.path());
        let staging = Staging::new(roots, 64);
        let task_sandbox = pilot.path().join("t0");
        std::fs::create_dir_all(&task_sandbox).unwrap();

        let directive = StagingDirective {
            action: StagingAction::Copy,
            source: "client:///input.dat".into(),
            target: "task:///input.dat".into(),
        };
        let task = Task::new("t0", desc(vec![directive], vec![]));
        let task = staging.stage_input(task, &task_sandbox);

        assert_eq!(task.state, TaskState::AgentStagingInput);
        assert_eq!(std::fs::read(task_sandbox.join("input.dat")).unwrap(), b"hello");
    }

    #[test]
    fn stage_input_fails_task_on_missing_source() {
        let client = tempdir().unwrap();
        let pilot = tempdir().unwrap();
        let roots = SandboxRoots::new(client.path(), tempdir().unwrap().path(), pilot.path());
        let staging = Staging::new(roots, 64);
        let task_sandbox = pilot.path().join("t0");
        std::fs::create_dir_all(&task_sandbox).unwrap();

        let directive = StagingDirective {
            action: StagingAction::Copy,
            source: "client:///missing.dat".into(),
            target: "task:///missing.dat".into(),
        };
        let task = Task::new("t0", desc(vec![directive], vec![]));
        let task = staging.stage_input(task, &task_sandbox);
        assert_eq!(task.state, TaskState::Failed);
    }

    #[test]
    fn stage_output_links_file_back_to_session_sandbox() {
        let pilot = tempdir().unwrap();
        let session = tempdir().unwrap();
        let roots = SandboxRoots::new(tempdir().unwrap().path(), session.path(), pilot.path());
        let staging = Staging::new(roots, 64);
        let task_sandbox = pilot.path().join("t0");
        std::fs::create_dir_all(&task_sandbox).unwrap();
        std::fs::write(task_sandbox.join("out.dat"), b"result").unwrap();

        let directive = StagingDirective {
            action: StagingAction::Link,
            source: "task:///out.dat".into(),
            target: "session:///out.dat".into(),
        };
        let task = Task::new("t0", desc(vec![], vec![directive]));
        let task = staging.stage_output(task, &task_sandbox);

        assert_eq!(task.state, TaskState::AgentStagingOutput);
        assert_eq!(std::fs::read_link(session.path().join("out.dat")).unwrap(), task_sandbox.join("out.dat"));
    }

    #[test]
    fn bulk_mkdir_batches_when_at_or_above_threshold() {
        let pilot = tempdir().unwrap();
        let roots = SandboxRoots::new(tempdir().unwrap().path(), tempdir().unwrap().path(), pilot.path());
        let staging = Staging::new(roots, 2);
        let task_sandbox = pilot.path().join("t0");
        std::fs::create_dir_all(&task_sandbox).unwrap();

        let directives: Vec<StagingDirective> = (0..3)
            .map(|i| StagingDirective {
                action: StagingAction::Copy,
                source: format!("task:///missing{i}.dat"),
                target: format!("task:///sub{i}/out{i}.dat"),
            })
            .collect();
        // bulk_mkdir runs before any copy is attempted, so every subdir
        // must exist even though every copy in `apply` will go on to fail.
        staging.bulk_mkdir(&directives, &task_sandbox).unwrap();
        for i in 0..3 {
            assert!(task_sandbox.join(format!("sub{i}")).is_dir());
        }
    }
}
