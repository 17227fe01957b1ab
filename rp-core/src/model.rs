//! Data model (spec §3): Node, ResourceMap, Slots, Task, State.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Per-slot lifecycle. BLOCKED is set once at boot from platform config and
/// never changes for the lifetime of the pilot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Free,
    Busy,
    Blocked,
}

/// A single schedulable core or GPU on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub id: u32,
    pub state: SlotState,
}

impl Slot {
    pub fn free(id: u32) -> Self {
        Self { id, state: SlotState::Free }
    }

    pub fn blocked(id: u32) -> Self {
        Self { id, state: SlotState::Blocked }
    }
}

/// A node in the allocation. The set of slots is fixed for the pilot's
/// lifetime; only slot state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub cores: Vec<Slot>,
    pub gpus: Vec<Slot>,
    pub lfs_path: PathBuf,
    pub lfs_size: u64,
    pub mem: u64,
}

impl Node {
    pub fn free_cores(&self) -> usize {
        self.cores.iter().filter(|s| s.state == SlotState::Free).count()
    }

    pub fn free_gpus(&self) -> usize {
        self.gpus.iter().filter(|s| s.state == SlotState::Free).count()
    }

    /// Find `n` contiguous free core indices, skipping blocked/busy slots.
    /// Returns `None` if no contiguous run of length `n` exists.
    pub fn contiguous_free_cores(&self, n: usize) -> Option<Vec<u32>> {
        contiguous_free(&self.cores, n)
    }

    pub fn contiguous_free_gpus(&self, n: usize) -> Option<Vec<u32>> {
        contiguous_free(&self.gpus, n)
    }
}

fn contiguous_free(slots: &[Slot], n: usize) -> Option<Vec<u32>> {
    if n == 0 {
        return Some(vec![]);
    }
    let mut run_start = None;
    for (idx, slot) in slots.iter().enumerate() {
        if slot.state == SlotState::Free {
            if run_start.is_none() {
                run_start = Some(idx);
            }
            if idx + 1 - run_start.unwrap() >= n {
                let start = run_start.unwrap();
                return Some(slots[start..start + n].iter().map(|s| s.id).collect());
            }
        } else {
            run_start = None;
        }
    }
    None
}

/// The slot assignment placed on a single node as part of a task's overall
/// placement (one entry per node the task spans).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSlots {
    pub node_id: String,
    pub core_ids: Vec<u32>,
    pub gpu_ids: Vec<u32>,
    pub lfs_size: u64,
    pub mem: u64,
}

/// The result of a successful scheduling attempt: ranks-to-hardware
/// placement, ordered by node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Slots {
    pub placements: Vec<NodeSlots>,
}

impl Slots {
    pub fn total_cores(&self) -> usize {
        self.placements.iter().map(|p| p.core_ids.len()).sum()
    }

    pub fn total_gpus(&self) -> usize {
        self.placements.iter().map(|p| p.gpu_ids.len()).sum()
    }
}

/// Sole owner of node/slot state is the Scheduler (spec §3); this type is
/// the data it owns. `acquire`/`release` are atomic relative to each other
/// because `&mut self` gives the caller exclusive access to the whole map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceMap {
    pub nodes: Vec<Node>,
}

impl ResourceMap {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Mark every slot named by `slots` BUSY. Fails (and leaves no slot
    /// mutated) if any named slot is not currently FREE — the caller is
    /// expected to have checked availability while computing `slots`, so
    /// this is a double-booking guard, not a check/act race window.
    pub fn acquire(&mut self, slots: &Slots) -> Result<()> {
        for placement in &slots.placements {
            let node = self.node(&placement.node_id).ok_or_else(|| {
                Error::Runtime {
                    uid: String::new(),
                    reason: format!("unknown node {}", placement.node_id),
                }
            })?;
            for &core_id in &placement.core_ids {
                let slot = node.cores.iter().find(|s| s.id == core_id);
                if !matches!(slot, Some(s) if s.state == SlotState::Free) {
                    return Err(Error::Runtime {
                        uid: String::new(),
                        reason: format!(
                            "core {core_id} on node {} is not free",
                            placement.node_id
                        ),
                    });
                }
            }
            for &gpu_id in &placement.gpu_ids {
                let slot = node.gpus.iter().find(|s| s.id == gpu_id);
                if !matches!(slot, Some(s) if s.state == SlotState::Free) {
                    return Err(Error::Runtime {
                        uid: String::new(),
                        reason: format!(
                            "gpu {gpu_id} on node {} is not free",
                            placement.node_id
                        ),
                    });
                }
            }
        }

        for placement in &slots.placements {
            let node = self.node_mut(&placement.node_id).expect("checked above");
            for &core_id in &placement.core_ids {
                if let Some(s) = node.cores.iter_mut().find(|s| s.id == core_id) {
                    s.state = SlotState::Busy;
                }
            }
            for &gpu_id in &placement.gpu_ids {
                if let Some(s) = node.gpus.iter_mut().find(|s| s.id == gpu_id) {
                    s.state = SlotState::Busy;
                }
            }
        }
        Ok(())
    }

    /// Mark every slot named by `slots` FREE again. Idempotent: releasing an
    /// already-free slot is a no-op for that slot.
    pub fn release(&mut self, slots: &Slots) {
        for placement in &slots.placements {
            if let Some(node) = self.node_mut(&placement.node_id) {
                for &core_id in &placement.core_ids {
                    if let Some(s) = node.cores.iter_mut().find(|s| s.id == core_id) {
                        if s.state == SlotState::Busy {
                            s.state = SlotState::Free;
                        }
                    }
                }
                for &gpu_id in &placement.gpu_ids {
                    if let Some(s) = node.gpus.iter_mut().find(|s| s.id == gpu_id) {
                        if s.state == SlotState::Busy {
                            s.state = SlotState::Free;
                        }
                    }
                }
            }
        }
    }

    /// Testable property 1: conservation of slots for every node.
    pub fn busy_core_count(&self) -> usize {
        self.nodes
            .iter()
            .flat_map(|n| n.cores.iter())
            .filter(|s| s.state == SlotState::Busy)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadingType {
    OpenMP,
    Mpi,
    MpiOpenMP,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagingAction {
    Transfer,
    Link,
    Copy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingDirective {
    pub action: StagingAction,
    pub source: String,
    pub target: String,
}

/// Executable-or-function payload. Functions are used by the RAPTOR
/// subsystem (spec §4.7); plain tasks use `executable`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Executable { path: String, arguments: Vec<String> },
    Function { name: String, arguments_json: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescription {
    pub payload: Payload,
    pub environment: HashMap<String, String>,
    pub ranks: u32,
    pub cores_per_rank: u32,
    pub gpus_per_rank: u32,
    pub threading_type: ThreadingType,
    pub mem_per_rank: u64,
    pub lfs_per_rank: u64,
    pub pre_exec: Vec<String>,
    pub post_exec: Vec<String>,
    pub pre_launch: Vec<String>,
    pub post_launch: Vec<String>,
    pub input_staging: Vec<StagingDirective>,
    pub output_staging: Vec<StagingDirective>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub sandbox: Option<PathBuf>,
    pub named_env: Option<String>,
    pub tags: HashMap<String, String>,
}

impl TaskDescription {
    pub fn is_mpi(&self) -> bool {
        matches!(self.threading_type, ThreadingType::Mpi | ThreadingType::MpiOpenMP)
    }
}

/// Total order over task states (spec §3/§4.2). Never goes backward; every
/// transition is published exactly once (testable property 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    New,
    AgentStagingInputPending,
    AgentStagingInput,
    AgentSchedulingPending,
    AgentScheduling,
    AgentExecutingPending,
    AgentExecuting,
    AgentStagingOutputPending,
    AgentStagingOutput,
    Done,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Canceled)
    }

    /// Edges of the state graph. FAILED/CANCELED are reachable from any
    /// non-terminal state; the "happy path" is the pipeline order in
    /// spec §2.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Canceled) {
            return true;
        }
        matches!(
            (self, next),
            (New, AgentStagingInputPending)
                | (AgentStagingInputPending, AgentStagingInput)
                | (AgentStagingInput, AgentSchedulingPending)
                | (New, AgentSchedulingPending)
                | (AgentSchedulingPending, AgentScheduling)
                | (AgentScheduling, AgentExecutingPending)
                | (AgentScheduling, AgentSchedulingPending)
                | (AgentExecutingPending, AgentExecuting)
                | (AgentExecuting, AgentStagingOutputPending)
                | (AgentStagingOutputPending, AgentStagingOutput)
                | (AgentStagingOutputPending, Done)
                | (AgentStagingOutput, Done)
        )
    }
}

/// A unit of work flowing through the pipeline (spec §3). The agent mutates
/// only `state`, `slots`, timestamps and `exit_code`; the task is destroyed
/// only when its owning session ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub uid: String,
    pub description: TaskDescription,
    pub state: TaskState,
    pub slots: Option<Slots>,
    pub exit_code: Option<i32>,
    pub start_ts: Option<u64>,
    pub stop_ts: Option<u64>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(uid: impl Into<String>, description: TaskDescription) -> Self {
        Self {
            uid: uid.into(),
            description,
            state: TaskState::New,
            slots: None,
            exit_code: None,
            start_ts: None,
            stop_ts: None,
            error: None,
        }
    }

    /// Apply a state transition, enforcing monotonicity (testable property 3).
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Runtime {
                uid: self.uid.clone(),
                reason: format!("invalid transition {:?} -> {:?}", self.state, next),
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
        self.state = TaskState::Failed;
    }

    pub fn cancel(&mut self) {
        self.state = TaskState::Canceled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, cores: usize, blocked: &[u32]) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            cores: (0..cores as u32)
                .map(|i| {
                    if blocked.contains(&i) {
                        Slot::blocked(i)
                    } else {
                        Slot::free(i)
                    }
                })
                .collect(),
            gpus: vec![],
            lfs_path: PathBuf::from("/tmp"),
            lfs_size: 0,
            mem: 0,
        }
    }

    #[test]
    fn contiguous_free_skips_blocked() {
        let n = node("n0", 4, &[0]);
        assert_eq!(n.contiguous_free_cores(3), Some(vec![1, 2, 3]));
        assert_eq!(n.contiguous_free_cores(4), None);
    }

    #[test]
    fn acquire_then_release_restores_free_count() {
        let mut map = ResourceMap::new(vec![node("n0", 4, &[])]);
        let slots = Slots {
            placements: vec![NodeSlots {
                node_id: "n0".into(),
                core_ids: vec![0, 1],
                gpu_ids: vec![],
                lfs_size: 0,
                mem: 0,
            }],
        };
        map.acquire(&slots).unwrap();
        assert_eq!(map.busy_core_count(), 2);
        map.release(&slots);
        assert_eq!(map.busy_core_count(), 0);
    }

    #[test]
    fn acquire_rejects_busy_slot_without_partial_mutation() {
        let mut map = ResourceMap::new(vec![node("n0", 2, &[])]);
        let slots = Slots {
            placements: vec![NodeSlots {
                node_id: "n0".into(),
                core_ids: vec![0],
                gpu_ids: vec![],
                lfs_size: 0,
                mem: 0,
            }],
        };
        map.acquire(&slots).unwrap();
        assert!(map.acquire(&slots).is_err());
        assert_eq!(map.busy_core_count(), 1);
    }

    #[test]
    fn state_machine_never_goes_backward() {
        let desc = TaskDescription {
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
        let mut t = Task::new("t0", desc);
        t.transition(TaskState::AgentSchedulingPending).unwrap();
        t.transition(TaskState::AgentScheduling).unwrap();
        t.transition(TaskState::AgentExecutingPending).unwrap();
        assert!(t.transition(TaskState::AgentSchedulingPending).is_err());
        t.transition(TaskState::AgentExecuting).unwrap();
        t.transition(TaskState::AgentStagingOutputPending).unwrap();
        t.transition(TaskState::Done).unwrap();
        assert!(t.state.is_terminal());
        assert!(t.transition(TaskState::AgentExecuting).is_err());
    }
}
