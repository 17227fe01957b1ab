//! RAPTOR subsystem (spec §4.7, optional high-throughput mode): a Master
//! task hosts an inner scheduling queue; N Worker tasks pull and execute
//! short-lived function/exec tasks. RAPTOR bypasses the normal `Scheduler`
//! for these inner tasks -- they run on whichever worker already holds
//! them, which occupies its own slot from the outer pipeline's point of
//! view -- but still honors cancellation and state reporting.

use std::collections::{HashMap, VecDeque};

use rp_core::error::Result;
use rp_core::model::{Task, TaskState};

/// Inner-task execution mode (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaptorMode {
    TaskFunction,
    TaskProc,
    TaskEval,
    TaskExec,
    TaskShell,
}

struct WorkerState {
    in_flight: Vec<String>,
}

/// Owns the inner scheduling queue and the worker pool. A task submitted
/// here never touches the outer `Scheduler`/`ResourceMap`.
pub struct RaptorMaster {
    queue: VecDeque<Task>,
    workers: HashMap<String, WorkerState>,
    assignments: HashMap<String, String>,
}

impl Default for RaptorMaster {
    fn default() -> Self {
        Self::new()
    }
}

impl RaptorMaster {
    pub fn new() -> Self {
        Self { queue: VecDeque::new(), workers: HashMap::new(), assignments: HashMap::new() }
    }

    pub fn register_worker(&mut self, id: impl Into<String>) {
        self.workers.insert(id.into(), WorkerState { in_flight: Vec::new() });
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Submit an inner task. Drives it straight to `AGENT_EXECUTING_PENDING`
    /// without ever asking the Scheduler for slots.
    pub fn submit(&mut self, mut task: Task) -> Result<()> {
        if task.state == TaskState::New {
            task.transition(TaskState::AgentSchedulingPending)?;
            task.transition(TaskState::AgentScheduling)?;
            task.transition(TaskState::AgentExecutingPending)?;
        }
        self.queue.push_back(task);
        Ok(())
    }

    /// Hand the next pending task to the first worker under `per_worker_capacity`.
    pub fn dispatch(&mut self, per_worker_capacity: usize) -> Option<(String, Task)> {
        let worker_id = self
            .workers
            .iter()
            .find(|(_, w)| w.in_flight.len() < per_worker_capacity)
            .map(|(id, _)| id.clone())?;
        let mut task = self.queue.pop_front()?;
        task.transition(TaskState::AgentExecuting).ok()?;
        self.assignments.insert(task.uid.clone(), worker_id.clone());
        self.workers.get_mut(&worker_id).unwrap().in_flight.push(task.uid.clone());
        Some((worker_id, task))
    }

    /// Record a worker's result for an inner task (spec: RAPTOR still
    /// reports state like any other task).
    pub fn complete(&mut self, mut task: Task, exit_code: i32) -> Result<Task> {
        task.exit_code = Some(exit_code);
        self.release(&task.uid);
        if exit_code == 0 {
            task.transition(TaskState::AgentStagingOutputPending)?;
        } else {
            task.fail(format!("inner task exited with code {exit_code}"));
        }
        Ok(task)
    }

    /// Worker-failure semantics (spec §9 Open Question -- left
    /// implementation-defined): a lost worker fails every task it had
    /// in flight rather than silently requeuing them. RAPTOR inner tasks
    /// are typically side-effecting function calls, so a silent re-run on
    /// another worker risks double execution; surfacing a hard failure and
    /// letting the session-level retry policy (outside this agent) decide
    /// is the conservative choice. Returns the uids that were failed this
    /// way.
    pub fn worker_lost(&mut self, worker_id: &str) -> Vec<String> {
        let Some(worker) = self.workers.remove(worker_id) else {
            return Vec::new();
        };
        for uid in &worker.in_flight {
            self.assignments.remove(uid);
        }
        worker.in_flight
    }

    fn release(&mut self, uid: &str) {
        if let Some(worker_id) = self.assignments.remove(uid) {
            if let Some(w) = self.workers.get_mut(&worker_id) {
                w.in_flight.retain(|u| u != uid);
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }
}
