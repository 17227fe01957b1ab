//! Wires the pipeline components together (ambient addition, SPEC_FULL §B):
//! Staging-Input -> Scheduler -> Executor -> Staging-Output, with every
//! transition published on Update. Spec §5 models each stage as its own
//! process; this binary collapses them into one process's async tasks,
//! matching the teacher's single scheduler-process model while keeping the
//! components themselves free of any shared mutable state beyond the
//! `ResourceMap`, which only the Scheduler ever touches.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rp_core::config::PlatformConfig;
use rp_core::error::Result;
use rp_core::message::StateMessage;
use rp_core::model::{ResourceMap, Task, TaskState};
use tokio::sync::mpsc;
use tracing::warn;

use crate::control::Update;
use crate::executor::{Executor, ExecutorEvent};
use crate::launch::LaunchMethodRegistry;
use crate::resource_manager::{AllocationManifest, ResourceManager};
use crate::scheduler::Scheduler;
use crate::staging::{SandboxRoots, Staging};

pub struct Pipeline {
    scheduler: Arc<Mutex<Scheduler>>,
    executor: Arc<Executor>,
    staging: Arc<Staging>,
    update: Update,
    sandbox_root: PathBuf,
    /// Tasks between `Executor::spawn` and their terminal `ExecutorEvent`;
    /// the event only carries `uid`/`exit_code`/`slots`, so the full `Task`
    /// has to be recovered here when `handle_event` drives Staging-Output.
    in_flight: Mutex<HashMap<String, Task>>,
}

impl Pipeline {
    pub fn new(
        platform: PlatformConfig,
        manifest: &AllocationManifest,
        expected_nodes: usize,
        sandbox_root: impl Into<PathBuf>,
        launch_order: Vec<String>,
        sandbox_roots: SandboxRoots,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StateMessage>)> {
        let sandbox_root = sandbox_root.into();
        let bulk_mkdir_threshold = platform.task_bulk_mkdir_threshold;
        let pre_exec_cached = platform.launch_methods.pre_exec_cached.clone();
        let rm = ResourceManager::new(platform);
        let nodes = rm.nodes(manifest, expected_nodes)?;
        let map = ResourceMap::new(nodes);
        let scheduler = Arc::new(Mutex::new(Scheduler::new(map)));
        let registry = LaunchMethodRegistry::detect(launch_order);
        let executor =
            Arc::new(Executor::new(registry, sandbox_root.clone()).with_pre_exec_cached(pre_exec_cached));
        let staging = Arc::new(Staging::new(sandbox_roots, bulk_mkdir_threshold));
        let (update, update_rx) = Update::new();
        Ok((
            Self { scheduler, executor, staging, update, sandbox_root, in_flight: Mutex::new(HashMap::new()) },
            update_rx,
        ))
    }

    /// Run one task through Staging-Input -> Scheduler -> Executor to the
    /// point it's either running, parked pending, or failed; publishing a
    /// state message at each step (spec §4.6). A task parked pending is
    /// revisited by a later `retry_pending` call, not by this method.
    pub async fn run_task(&self, task: Task, events: mpsc::UnboundedSender<ExecutorEvent>) {
        let uid = task.uid.clone();
        let task_sandbox = self.sandbox_root.join(&uid);

        let task = self.staging.stage_input(task, &task_sandbox);
        self.publish(&task);
        if task.state == TaskState::Failed {
            return;
        }

        let before_schedule = task.clone();
        let task = match self.scheduler.lock().try_schedule(task) {
            Ok(t) => t,
            Err(e) => {
                warn!(uid = %uid, error = %e, "task unschedulable");
                let mut task = before_schedule;
                task.fail(format!("{e}"));
                self.publish(&task);
                return;
            }
        };
        self.publish(&task);
        if task.state != TaskState::AgentExecutingPending {
            return;
        }

        match self.executor.spawn(task, events).await {
            Ok(t) => {
                self.publish(&t);
                if t.state == TaskState::Failed {
                    // Executor failed before it ever spawned a child (no
                    // applicable launch method, sandbox/script/spawn
                    // failure): no `ExecutorEvent` will ever arrive for
                    // this uid, so release its slots and retry pending
                    // tasks here instead of leaking an `in_flight` entry
                    // with permanently BUSY slots (spec §4.3 failure modes).
                    if let Some(slots) = t.slots {
                        let mut sched = self.scheduler.lock();
                        sched.release(&slots);
                        let retried: Vec<Task> = sched.retry_pending();
                        drop(sched);
                        for r in retried {
                            self.publish(&r);
                        }
                    }
                } else {
                    self.in_flight.lock().insert(uid, t);
                }
            }
            Err(e) => warn!(uid = %uid, error = %e, "executor spawn failed"),
        }
    }

    /// Drive a terminal `ExecutorEvent` to completion: recover the task from
    /// `in_flight` and dispatch to `finish_task` (or fail it directly if the
    /// Executor couldn't even wait on the child).
    pub fn handle_event(&self, event: ExecutorEvent) {
        match event {
            ExecutorEvent::Exited { uid, exit_code, .. } => {
                if let Some(task) = self.in_flight.lock().remove(&uid) {
                    self.finish_task(task, exit_code);
                }
            }
            ExecutorEvent::WaitFailed { uid, reason, slots } => {
                let Some(mut task) = self.in_flight.lock().remove(&uid) else {
                    warn!(uid = %uid, "WaitFailed event for a task not in in_flight registry");
                    return;
                };
                task.fail(format!("wait on child failed: {reason}"));
                self.publish(&task);
                let mut sched = self.scheduler.lock();
                sched.release(&slots);
                let retried: Vec<Task> = sched.retry_pending();
                drop(sched);
                for t in retried {
                    self.publish(&t);
                }
            }
        }
    }

    /// Handle a child's exit (spec §4.3 step 6): Staging-Output on success,
    /// FAILED with the exit code preserved otherwise, then release the
    /// task's slots and re-drive the pending queue.
    pub fn finish_task(&self, mut task: Task, exit_code: i32) {
        task.exit_code = Some(exit_code);
        let slots = task.slots.clone();

        if exit_code == 0 {
            if task.transition(TaskState::AgentStagingOutputPending).is_ok() {
                let task_sandbox = self.sandbox_root.join(&task.uid);
                task = self.staging.stage_output(task, &task_sandbox);
            }
        } else {
            task.fail(format!("task exited with code {exit_code}"));
        }
        self.publish(&task);

        if let Some(slots) = slots {
            let mut sched = self.scheduler.lock();
            sched.release(&slots);
            let retried: Vec<Task> = sched.retry_pending();
            drop(sched);
            for t in retried {
                self.publish(&t);
            }
        }
    }

    pub async fn cancel(&self, uid: &str) {
        self.executor.cancel(uid).await;
    }

    /// uids with a live child, for `cancel_pilot`/`shutdown` fan-out.
    pub fn running_uids(&self) -> Vec<String> {
        self.executor.running_uids()
    }

    fn publish(&self, task: &Task) {
        let msg = StateMessage::task(task.uid.clone(), task.state, now());
        let msg = match &task.error {
            Some(reason) => msg.with_details(reason.clone()),
            None if !task.description.tags.is_empty() => {
                msg.with_details(format!("{:?}", task.description.tags))
            }
            None => msg,
        };
        let _ = self.update.publish(msg);
    }
}

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
