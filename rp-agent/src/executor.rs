//! Executor (spec §4.3): a POPEN-style spawner. Consumes
//! `AGENT_EXECUTING_PENDING` tasks, resolves a launch method, materializes
//! `<uid>.launch.sh` / `<uid>.exec.sh`, spawns the launch script as a child
//! in its own process group, and watches it to completion in the
//! background.

use std::collections::{HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rp_core::error::{Error, Result};
use rp_core::model::{Payload, Slots, Task, TaskState};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::launch::LaunchCommand;
use crate::launch::LaunchMethod;
use crate::launch::LaunchMethodRegistry;
use crate::sandbox::Sandbox;

/// Terminal outcome of a spawned task (spec §4.3 step 6). The pipeline
/// forwards these to Update (state message) and to the unschedule pubsub
/// (slot release); the Executor itself never touches the `ResourceMap`.
#[derive(Debug)]
pub enum ExecutorEvent {
    Exited { uid: String, exit_code: i32, slots: Slots },
    WaitFailed { uid: String, reason: String, slots: Slots },
}

struct RunningTask {
    pid: u32,
}

pub struct Executor {
    registry: LaunchMethodRegistry,
    sandbox_root: std::path::PathBuf,
    running: Arc<Mutex<HashMap<String, RunningTask>>>,
    cancel_grace: Duration,
    /// Per-method idempotent environment prep (spec §4.4 `pre_exec_cached`),
    /// keyed by method name, from `launch_methods.<METHOD>.pre_exec_cached`
    /// in the platform config. Run at most once per agent lifetime, the
    /// first time that method is resolved for a task.
    pre_exec_cached: HashMap<String, Vec<String>>,
    primed: Mutex<HashSet<String>>,
}

impl Executor {
    pub fn new(registry: LaunchMethodRegistry, sandbox_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            registry,
            sandbox_root: sandbox_root.into(),
            running: Arc::new(Mutex::new(HashMap::new())),
            cancel_grace: Duration::from_secs(5),
            pre_exec_cached: HashMap::new(),
            primed: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_pre_exec_cached(mut self, pre_exec_cached: HashMap<String, Vec<String>>) -> Self {
        self.pre_exec_cached = pre_exec_cached;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn is_running(&self, uid: &str) -> bool {
        self.running.lock().contains_key(uid)
    }

    /// uids with a live child, for `cancel_pilot`/`shutdown` fan-out.
    pub fn running_uids(&self) -> Vec<String> {
        self.running.lock().keys().cloned().collect()
    }

    /// Run `method`'s cached environment prep once per agent lifetime
    /// (spec §4.4 `pre_exec_cached`): the platform config's list for this
    /// method name if configured, else the method's own default. A no-op
    /// the second and later time a method is resolved.
    async fn prime_method(&self, method: &dyn LaunchMethod) {
        let name = method.name();
        if !self.primed.lock().insert(name.to_string()) {
            return;
        }
        let lines: Vec<String> = self
            .pre_exec_cached
            .get(name)
            .cloned()
            .unwrap_or_else(|| method.pre_exec_cached().to_vec());
        if lines.is_empty() {
            return;
        }
        let script = lines.join("\n");
        match Command::new("/bin/bash").arg("-c").arg(&script).status().await {
            Ok(status) if status.success() => debug!(method = name, "pre_exec_cached prep ran"),
            Ok(status) => warn!(method = name, ?status, "pre_exec_cached prep exited non-zero"),
            Err(e) => warn!(method = name, error = %e, "pre_exec_cached prep failed to spawn"),
        }
    }

    /// Consume one `AGENT_EXECUTING_PENDING` task. On any failure short of
    /// an internal invariant violation, the task is transitioned to
    /// `FAILED` in place and returned -- its `slots` are left intact so the
    /// caller can release them. On success the task comes back in
    /// `AGENT_EXECUTING`; its terminal outcome arrives later on `events`.
    pub async fn spawn(&self, mut task: Task, events: mpsc::UnboundedSender<ExecutorEvent>) -> Result<Task> {
        let slots = task.slots.clone().ok_or_else(|| Error::Runtime {
            uid: task.uid.clone(),
            reason: "executor received a task with no slot assignment".into(),
        })?;

        let method = match self.registry.resolve(&task) {
            Ok(m) => m,
            Err(e) => {
                task.fail(format!("launch method unavailable: {e}"));
                return Ok(task);
            }
        };

        self.prime_method(method).await;

        let sandbox = Sandbox::new(&self.sandbox_root, &task);
        if let Err(e) = sandbox.ensure() {
            task.fail(format!("sandbox creation failed: {e}"));
            return Ok(task);
        }
        let _ = sandbox.record_prof_event("sandbox_created");

        let exec_script = sandbox.exec_script();
        let launch_cmd = match method.command(&task, &slots, &exec_script.to_string_lossy()) {
            Ok(c) => c,
            Err(e) => {
                task.fail(format!("building launch command failed: {e}"));
                return Ok(task);
            }
        };

        if let Err(e) = materialize_scripts(
            &sandbox,
            &task,
            &launch_cmd,
            method.rank_id_variable(),
            method.injected_env_prefixes(),
        ) {
            task.fail(format!("writing launch scripts failed: {e}"));
            return Ok(task);
        }
        let _ = sandbox.record_prof_event("scripts_materialized");

        let mut cmd = Command::new("/bin/bash");
        cmd.arg(sandbox.launch_script());
        cmd.current_dir(sandbox.path());
        cmd.envs(task.description.environment.iter());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        // Run in its own session so cancellation can signal the whole
        // process group, not just the immediate bash.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                task.fail(format!("spawn failed: {e}"));
                return Ok(task);
            }
        };

        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                task.fail("child exited before a pid could be observed");
                return Ok(task);
            }
        };
        self.running.lock().insert(task.uid.clone(), RunningTask { pid });
        let _ = sandbox.record_prof_event("child_spawned");

        task.transition(TaskState::AgentExecuting)?;
        info!(uid = %task.uid, pid, "task executing");

        let uid = task.uid.clone();
        let running = Arc::clone(&self.running);
        let stdout_path = sandbox.stdout_path();
        let stderr_path = sandbox.stderr_path();
        let prof_sandbox = sandbox;

        tokio::spawn(async move {
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let (out, err, status) =
                tokio::join!(read_to_vec(stdout), read_to_vec(stderr), child.wait());
            let _ = tokio::fs::write(&stdout_path, &out).await;
            let _ = tokio::fs::write(&stderr_path, &err).await;
            running.lock().remove(&uid);
            let _ = prof_sandbox.record_prof_event("child_reaped");

            let event = match status {
                Ok(exit) => {
                    let code = exit.code().unwrap_or(-1);
                    debug!(uid = %uid, exit_code = code, "child exited");
                    ExecutorEvent::Exited { uid, exit_code: code, slots }
                }
                Err(e) => {
                    warn!(uid = %uid, error = %e, "child wait failed");
                    ExecutorEvent::WaitFailed { uid, reason: e.to_string(), slots }
                }
            };
            let _ = events.send(event);
        });

        Ok(task)
    }

    /// Cancellation (spec §4.3): SIGTERM the process group, then SIGKILL
    /// after `cancel_grace` if it hasn't exited. Idempotent: a uid with no
    /// running child is a no-op.
    pub async fn cancel(&self, uid: &str) {
        let pid = match self.running.lock().get(uid) {
            Some(r) => r.pid,
            None => return,
        };
        send_signal(pid, nix::sys::signal::Signal::SIGTERM);
        tokio::time::sleep(self.cancel_grace).await;
        if self.running.lock().contains_key(uid) {
            send_signal(pid, nix::sys::signal::Signal::SIGKILL);
        }
    }
}

fn send_signal(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::unistd::Pid;
    // Negative pid addresses the whole process group started by setsid.
    let _ = nix::sys::signal::kill(Pid::from_raw(-(pid as i32)), signal);
}

async fn read_to_vec<R: tokio::io::AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut s) = stream {
        let _ = tokio::io::AsyncReadExt::read_to_end(&mut s, &mut buf).await;
    }
    buf
}

fn materialize_scripts(
    sandbox: &Sandbox,
    task: &Task,
    launch_cmd: &LaunchCommand,
    rank_var: &str,
    injected_prefixes: &[&str],
) -> Result<()> {
    for (name, contents) in &launch_cmd.aux_files {
        std::fs::write(sandbox.path().join(name), contents)?;
    }
    write_executable(&sandbox.launch_script(), &launch_script_body(task, launch_cmd))?;
    write_executable(
        &sandbox.exec_script(),
        &exec_script_body(task, sandbox.path(), rank_var, injected_prefixes)?,
    )?;
    Ok(())
}

fn write_executable(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents)?;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

/// `<uid>.launch.sh`: exports environment, runs `pre_launch`, invokes the
/// launcher, then `post_launch` -- preserving the launcher's exit code
/// (spec §4.3 step 3).
fn launch_script_body(task: &Task, launch_cmd: &LaunchCommand) -> String {
    let mut s = String::from("#!/bin/bash\n");
    for (k, v) in &task.description.environment {
        s.push_str(&format!("export {k}={}\n", shq(v)));
    }
    for line in &task.description.pre_launch {
        s.push_str(line);
        s.push('\n');
    }
    let argv = launch_cmd.argv.iter().map(|a| shq(a)).collect::<Vec<_>>().join(" ");
    s.push_str(&argv);
    s.push('\n');
    s.push_str("__rp_rc=$?\n");
    for line in &task.description.post_launch {
        s.push_str(line);
        s.push('\n');
    }
    s.push_str("exit $__rp_rc\n");
    s
}

/// `<uid>.exec.sh`: run once per rank by the launcher. Sources the task's
/// named environment overlay (if any, supplement D.2), unsets
/// launcher-injected variables before running `pre_exec` on rank 0 behind a
/// filesystem barrier, runs the payload, then `post_exec` with the
/// payload's exit code preserved (spec §4.3 step 3, environment isolation
/// contract).
fn exec_script_body(
    task: &Task,
    sandbox: &Path,
    rank_var: &str,
    injected_prefixes: &[&str],
) -> Result<String> {
    let Payload::Executable { path, arguments } = &task.description.payload else {
        return Err(Error::Runtime {
            uid: task.uid.clone(),
            reason: "executor only runs Executable payloads; Function payloads are RAPTOR's".into(),
        });
    };

    let barrier = sandbox.join(format!(".{}.pre_exec_done", task.uid));
    let mut s = String::from("#!/bin/bash\nset -e\n");
    if let Some(name) = &task.description.named_env {
        let env_file = named_env_path(sandbox, name);
        s.push_str(&format!(
            "if [ -f {0} ]; then source {0}; fi\n",
            shq(&env_file.to_string_lossy())
        ));
    }
    s.push_str(&format!("RANK=\"${{{rank_var}:-0}}\"\n"));
    s.push_str(&format!("BARRIER={}\n", shq(&barrier.to_string_lossy())));
    s.push_str("if [ \"$RANK\" = \"0\" ]; then\n");
    s.push_str("  (\n");
    s.push_str("    :\n");
    if !injected_prefixes.is_empty() {
        s.push_str("    for __rp_v in $(env | cut -d= -f1); do\n");
        s.push_str("      case \"$__rp_v\" in\n");
        let pattern = injected_prefixes.iter().map(|p| format!("{p}*")).collect::<Vec<_>>().join("|");
        s.push_str(&format!("        {pattern}) unset \"$__rp_v\" ;;\n"));
        s.push_str("      esac\n");
        s.push_str("    done\n");
    }
    for line in &task.description.pre_exec {
        s.push_str("    ");
        s.push_str(line);
        s.push('\n');
    }
    s.push_str("  )\n");
    s.push_str("  touch \"$BARRIER\"\n");
    s.push_str("else\n");
    s.push_str("  while [ ! -f \"$BARRIER\" ]; do sleep 0.05; done\n");
    s.push_str("fi\n");
    let mut argv = vec![shq(path)];
    argv.extend(arguments.iter().map(|a| shq(a)));
    if task.description.post_exec.is_empty() {
        // No cleanup hook: `exec` replaces this shell with the payload so
        // its signal handling and exit code pass through untouched.
        s.push_str("exec ");
        s.push_str(&argv.join(" "));
        s.push('\n');
    } else {
        s.push_str("set +e\n");
        s.push_str(&argv.join(" "));
        s.push('\n');
        s.push_str("__rp_exec_rc=$?\n");
        s.push_str("set -e\n");
        for line in &task.description.post_exec {
            s.push_str(line);
            s.push('\n');
        }
        s.push_str("exit $__rp_exec_rc\n");
    }
    Ok(s)
}

/// Conventional location for a named environment's overlay script
/// (supplement D.2): `<named_envs>/<name>.sh`, sibling to the per-task
/// sandbox directory, sourced if present.
fn named_env_path(task_sandbox: &Path, name: &str) -> std::path::PathBuf {
    task_sandbox
        .parent()
        .unwrap_or(task_sandbox)
        .join("named_envs")
        .join(format!("{name}.sh"))
}

fn shq(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::Fork;
    use rp_core::model::{Node, NodeSlots, Slot, TaskDescription, ThreadingType};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn desc(payload: Payload) -> TaskDescription {
        TaskDescription {
            payload,
            environment: HashMap::new(),
            ranks: 1,
            cores_per_rank: 1,
            gpus_per_rank: 0,
            threading_type: ThreadingType::None,
            mem_per_rank: 0,
            lfs_per_rank: 0,
            pre_exec: vec!["echo pre_exec_ran > pre_exec.log".into()],
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

    fn single_slots() -> Slots {
        Slots { placements: vec![NodeSlots { node_id: "n0".into(), core_ids: vec![0], gpu_ids: vec![], lfs_size: 0, mem: 0 }] }
    }

    #[test]
    fn launch_script_preserves_exit_code_through_post_launch() {
        let mut task = Task::new("t0", desc(Payload::Executable { path: "/bin/true".into(), arguments: vec![] }));
        task.description.post_launch = vec!["echo post ran".into()];
        let cmd = LaunchCommand { argv: vec!["/bin/true".into()], aux_files: vec![] };
        let body = launch_script_body(&task, &cmd);
        assert!(body.contains("__rp_rc=$?"));
        assert!(body.contains("exit $__rp_rc"));
        assert!(body.contains("echo post ran"));
    }

    #[test]
    fn exec_script_unsets_injected_prefixes_before_pre_exec() {
        let task = Task::new("t0", desc(Payload::Executable { path: "date".into(), arguments: vec![] }));
        let body = exec_script_body(&task, Path::new("/sbx"), "PMIX_RANK", &["PMIX_", "OMPI_"]).unwrap();
        assert!(body.contains("PMIX_*|OMPI_*) unset"));
        assert!(body.contains("echo pre_exec_ran"));
        assert!(body.contains("exec 'date'"));
    }

    #[test]
    fn exec_script_rejects_function_payload() {
        let task = Task::new("t0", desc(Payload::Function { name: "f".into(), arguments_json: "{}".into() }));
        assert!(exec_script_body(&task, Path::new("/sbx"), "RANK", &[]).is_err());
    }

    #[test]
    fn exec_script_with_no_post_exec_uses_exec_for_signal_passthrough() {
        let mut d = desc(Payload::Executable { path: "date".into(), arguments: vec![] });
        d.pre_exec = vec![];
        let task = Task::new("t0", d);
        let body = exec_script_body(&task, Path::new("/sbx"), "RANK", &[]).unwrap();
        assert!(body.contains("exec 'date'"));
    }

    #[test]
    fn exec_script_with_post_exec_preserves_exit_code_instead_of_exec() {
        let mut d = desc(Payload::Executable { path: "date".into(), arguments: vec![] });
        d.pre_exec = vec![];
        d.post_exec = vec!["echo post_exec_ran > post_exec.log".into()];
        let task = Task::new("t0", d);
        let body = exec_script_body(&task, Path::new("/sbx"), "RANK", &[]).unwrap();
        assert!(!body.contains("exec 'date'"));
        assert!(body.contains("__rp_exec_rc=$?"));
        assert!(body.contains("echo post_exec_ran"));
        assert!(body.contains("exit $__rp_exec_rc"));
    }

    #[test]
    fn exec_script_sources_named_env_overlay_when_set() {
        let mut d = desc(Payload::Executable { path: "date".into(), arguments: vec![] });
        d.pre_exec = vec![];
        d.named_env = Some("myenv".into());
        let task = Task::new("t0", d);
        let body = exec_script_body(&task, Path::new("/sbx/t0"), "RANK", &[]).unwrap();
        assert!(body.contains("/sbx/named_envs/myenv.sh"));
    }

    #[tokio::test]
    async fn spawn_runs_task_to_completion_and_reports_exit_code() {
        let dir = tempdir().unwrap();
        let registry = LaunchMethodRegistry::new(vec![Box::new(Fork::new())], vec!["FORK".into()]);
        let executor = Executor::new(registry, dir.path());

        let mut task = Task::new("t0", desc(Payload::Executable { path: "/bin/true".into(), arguments: vec![] }));
        task.transition(TaskState::AgentStagingInputPending).unwrap();
        task.transition(TaskState::AgentStagingInput).unwrap();
        task.transition(TaskState::AgentSchedulingPending).unwrap();
        task.transition(TaskState::AgentScheduling).unwrap();
        task.transition(TaskState::AgentExecutingPending).unwrap();
        task.slots = Some(single_slots());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let spawned = executor.spawn(task, tx).await.unwrap();
        assert_eq!(spawned.state, TaskState::AgentExecuting);

        let event = rx.recv().await.unwrap();
        match event {
            ExecutorEvent::Exited { uid, exit_code, .. } => {
                assert_eq!(uid, "t0");
                assert_eq!(exit_code, 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_fails_task_without_losing_its_slots_when_no_launch_method_applies() {
        let dir = tempdir().unwrap();
        // SRUN only applies to MPI-ineligible platforms here it's simply
        // never applicable since `slurm_available` is false.
        let registry = LaunchMethodRegistry::new(
            vec![Box::new(crate::launch::Srun::new(false))],
            vec!["SRUN".into()],
        );
        let executor = Executor::new(registry, dir.path());

        let mut task = Task::new("t0", desc(Payload::Executable { path: "/bin/true".into(), arguments: vec![] }));
        task.transition(TaskState::AgentSchedulingPending).unwrap();
        task.transition(TaskState::AgentScheduling).unwrap();
        task.transition(TaskState::AgentExecutingPending).unwrap();
        task.slots = Some(single_slots());

        let (tx, _rx) = mpsc::unbounded_channel();
        let failed = executor.spawn(task, tx).await.unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert!(failed.slots.is_some());
    }

    #[tokio::test]
    async fn cancel_terminates_a_long_running_child() {
        let dir = tempdir().unwrap();
        let registry = LaunchMethodRegistry::new(vec![Box::new(Fork::new())], vec!["FORK".into()]);
        let executor = Executor::new(registry, dir.path()).with_cancel_grace(Duration::from_millis(50));

        let mut task = Task::new(
            "t0",
            desc(Payload::Executable { path: "/bin/sleep".into(), arguments: vec!["30".into()] }),
        );
        task.transition(TaskState::AgentSchedulingPending).unwrap();
        task.transition(TaskState::AgentScheduling).unwrap();
        task.transition(TaskState::AgentExecutingPending).unwrap();
        task.slots = Some(single_slots());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let spawned = executor.spawn(task, tx).await.unwrap();
        assert!(executor.is_running(&spawned.uid));

        executor.cancel(&spawned.uid).await;

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event, ExecutorEvent::Exited { .. }));
        assert!(!executor.is_running(&spawned.uid));
    }

    #[tokio::test]
    async fn pre_exec_cached_runs_once_per_method_lifetime() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("primed.marker");
        let registry = LaunchMethodRegistry::new(vec![Box::new(Fork::new())], vec!["FORK".into()]);
        let mut cached = HashMap::new();
        cached.insert("FORK".to_string(), vec![format!("echo -n x >> {}", marker.display())]);
        let executor = Executor::new(registry, dir.path()).with_pre_exec_cached(cached);

        for _ in 0..2 {
            let task = Task::new(
                uuid::Uuid::new_v4().to_string(),
                desc(Payload::Executable { path: "/bin/true".into(), arguments: vec![] }),
            );
            let mut task = task;
            task.transition(TaskState::AgentSchedulingPending).unwrap();
            task.transition(TaskState::AgentScheduling).unwrap();
            task.transition(TaskState::AgentExecutingPending).unwrap();
            task.slots = Some(single_slots());
            let (tx, mut rx) = mpsc::unbounded_channel();
            let spawned = executor.spawn(task, tx).await.unwrap();
            assert_eq!(spawned.state, TaskState::AgentExecuting);
            rx.recv().await.unwrap();
        }

        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "x");
    }

    #[allow(dead_code)]
    fn node(id: &str, cores: usize) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            cores: (0..cores as u32).map(Slot::free).collect(),
            gpus: vec![],
            lfs_path: PathBuf::from("/tmp"),
            lfs_size: 0,
            mem: 0,
        }
    }
}
