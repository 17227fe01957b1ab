//! Scheduler (spec §4.2): a continuous bin packer over the ordered node
//! list. Owns the `ResourceMap` exclusively; no other component mutates it.

use std::collections::VecDeque;

use rp_core::error::{Error, Result};
use rp_core::model::{NodeSlots, ResourceMap, Slots, Task, TaskState};
use tracing::{debug, info};

/// Per-node soft capacity not modeled as discrete slots (lfs/mem are pools,
/// not enumerable units like cores/gpus). Tracked alongside `ResourceMap`
/// by the scheduler, which is its sole owner per spec §3.
#[derive(Debug, Clone, Default)]
struct NodeUsage {
    used_lfs: u64,
    used_mem: u64,
}

pub struct Scheduler {
    map: ResourceMap,
    usage: Vec<NodeUsage>,
    /// Tasks that could not be placed yet, in arrival order (spec §4.2:
    /// "no reordering or priority escalation").
    pending: VecDeque<Task>,
}

impl Scheduler {
    pub fn new(map: ResourceMap) -> Self {
        let usage = vec![NodeUsage::default(); map.nodes.len()];
        Self { map, usage, pending: VecDeque::new() }
    }

    pub fn resource_map(&self) -> &ResourceMap {
        &self.map
    }

    /// Attempt placement for one task. On success, acquires the slots
    /// (marking them BUSY) and transitions the task to
    /// `AgentExecutingPending`. On failure to find room right now, the task
    /// is pushed onto the pending queue and left in
    /// `AgentSchedulingPending`. Returns `Err(Unschedulable)` only when the
    /// requirement can never be satisfied by this pilot's configuration,
    /// regardless of current occupancy.
    pub fn try_schedule(&mut self, mut task: Task) -> Result<Task> {
        let desc = &task.description;
        let total_cores = (desc.ranks * desc.cores_per_rank) as usize;
        let total_gpus = (desc.ranks * desc.gpus_per_rank) as usize;

        if desc.is_mpi() {
            if !self.pilot_could_ever_fit_mpi(desc.ranks, desc.cores_per_rank, desc.gpus_per_rank) {
                return Err(Error::Unschedulable {
                    uid: task.uid.clone(),
                    reason: format!(
                        "MPI task requests {} ranks x {} cores; pilot has no node configuration that can ever satisfy this",
                        desc.ranks, desc.cores_per_rank
                    ),
                });
            }
        } else {
            let node_cores = self.map.nodes.iter().map(|n| n.cores.len()).max().unwrap_or(0);
            let node_gpus = self.map.nodes.iter().map(|n| n.gpus.len()).max().unwrap_or(0);
            if total_cores > node_cores {
                return Err(Error::Unschedulable {
                    uid: task.uid.clone(),
                    reason: format!(
                        "non-MPI task needs {total_cores} cores on one node; largest node has {node_cores}"
                    ),
                });
            }
            if total_gpus > node_gpus {
                return Err(Error::Unschedulable {
                    uid: task.uid.clone(),
                    reason: format!(
                        "non-MPI task needs {total_gpus} gpus on one node; largest node has {node_gpus}"
                    ),
                });
            }
        }

        if matches!(task.state, TaskState::New | TaskState::AgentStagingInput) {
            task.transition(TaskState::AgentSchedulingPending)?;
        }
        task.transition(TaskState::AgentScheduling)?;

        match self.place(&task) {
            Some(slots) => {
                self.map.acquire(&slots)?;
                self.account(&slots, true);
                task.slots = Some(slots);
                task.transition(TaskState::AgentExecutingPending)?;
                info!(uid = %task.uid, "scheduled task");
                Ok(task)
            }
            None => {
                debug!(uid = %task.uid, "no room yet, queued pending");
                task.transition(TaskState::AgentSchedulingPending)?;
                self.pending.push_back(task.clone());
                Ok(task)
            }
        }
    }

    /// A requirement that no single platform configuration could ever
    /// satisfy (ignoring current occupancy): more ranks than the pilot has
    /// nodes*cores_per_node worth of room for, even with every node idle.
    fn pilot_could_ever_fit_mpi(&self, ranks: u32, cores_per_rank: u32, gpus_per_rank: u32) -> bool {
        let total_cores: u64 = self.map.nodes.iter().map(|n| n.cores.len() as u64).sum();
        let total_gpus: u64 = self.map.nodes.iter().map(|n| n.gpus.len() as u64).sum();
        let need_cores = ranks as u64 * cores_per_rank as u64;
        let need_gpus = ranks as u64 * gpus_per_rank as u64;
        need_cores <= total_cores && need_gpus <= total_gpus
    }

    fn account(&mut self, slots: &Slots, acquire: bool) {
        for p in &slots.placements {
            if let Some(idx) = self.map.nodes.iter().position(|n| n.id == p.node_id) {
                if acquire {
                    self.usage[idx].used_lfs += p.lfs_size;
                    self.usage[idx].used_mem += p.mem;
                } else {
                    self.usage[idx].used_lfs = self.usage[idx].used_lfs.saturating_sub(p.lfs_size);
                    self.usage[idx].used_mem = self.usage[idx].used_mem.saturating_sub(p.mem);
                }
            }
        }
    }

    /// Single-node placement for a non-MPI task: walk nodes in order, place
    /// the whole requirement contiguously on the first node with room.
    fn place_single(&self, task: &Task) -> Option<Slots> {
        let desc = &task.description;
        let total_cores = (desc.ranks * desc.cores_per_rank) as usize;
        let total_gpus = (desc.ranks * desc.gpus_per_rank) as usize;
        let lfs_needed = desc.ranks as u64 * desc.lfs_per_rank;
        let mem_needed = desc.ranks as u64 * desc.mem_per_rank;

        for (idx, node) in self.map.nodes.iter().enumerate() {
            if node.free_cores() < total_cores || node.free_gpus() < total_gpus {
                continue;
            }
            if self.usage[idx].used_lfs + lfs_needed > node.lfs_size && node.lfs_size > 0 {
                continue;
            }
            if self.usage[idx].used_mem + mem_needed > node.mem && node.mem > 0 {
                continue;
            }
            let cores = node.contiguous_free_cores(total_cores)?;
            let gpus = if total_gpus > 0 {
                node.contiguous_free_gpus(total_gpus)?
            } else {
                vec![]
            };
            return Some(Slots {
                placements: vec![NodeSlots {
                    node_id: node.id.clone(),
                    core_ids: cores,
                    gpu_ids: gpus,
                    lfs_size: lfs_needed,
                    mem: mem_needed,
                }],
            });
        }
        None
    }

    /// Contiguous-span placement for an MPI task: greedily consume whole or
    /// partial nodes, in declared order, until all ranks are placed.
    fn place_mpi(&self, task: &Task) -> Option<Slots> {
        let desc = &task.description;
        let cores_per_rank = desc.cores_per_rank.max(1) as usize;
        let gpus_per_rank = desc.gpus_per_rank as usize;
        let mut remaining_ranks = desc.ranks as usize;
        let mut placements = Vec::new();

        for (idx, node) in self.map.nodes.iter().enumerate() {
            if remaining_ranks == 0 {
                break;
            }
            let max_run = max_contiguous_free(&node.cores);
            if max_run < cores_per_rank {
                continue;
            }
            let mut ranks_here = (max_run / cores_per_rank).min(remaining_ranks);
            if gpus_per_rank > 0 {
                let gpu_run = max_contiguous_free(&node.gpus);
                ranks_here = ranks_here.min(gpu_run / gpus_per_rank);
            }
            if ranks_here == 0 {
                continue;
            }

            let cores_needed = ranks_here * cores_per_rank;
            let gpus_needed = ranks_here * gpus_per_rank;
            let lfs_needed = ranks_here as u64 * desc.lfs_per_rank;
            let mem_needed = ranks_here as u64 * desc.mem_per_rank;
            if node.lfs_size > 0 && self.usage[idx].used_lfs + lfs_needed > node.lfs_size {
                continue;
            }
            if node.mem > 0 && self.usage[idx].used_mem + mem_needed > node.mem {
                continue;
            }

            let cores = node.contiguous_free_cores(cores_needed)?;
            let gpus = if gpus_needed > 0 {
                node.contiguous_free_gpus(gpus_needed)?
            } else {
                vec![]
            };

            placements.push(NodeSlots {
                node_id: node.id.clone(),
                core_ids: cores,
                gpu_ids: gpus,
                lfs_size: lfs_needed,
                mem: mem_needed,
            });
            remaining_ranks -= ranks_here;
        }

        if remaining_ranks == 0 {
            Some(Slots { placements })
        } else {
            None
        }
    }

    fn place(&self, task: &Task) -> Option<Slots> {
        if task.description.is_mpi() {
            self.place_mpi(task)
        } else {
            self.place_single(task)
        }
    }

    /// Drive the pending queue one pass (spec §4.2: "re-drive the pending
    /// queue ... one pass"), called when an unschedule event arrives.
    /// Head-of-line blocking is accepted: a task that still doesn't fit
    /// stays at the front, and later tasks are still attempted.
    pub fn retry_pending(&mut self) -> Vec<Task> {
        let mut still_pending = VecDeque::new();
        let mut scheduled = Vec::new();
        while let Some(mut task) = self.pending.pop_front() {
            if task.transition(TaskState::AgentScheduling).is_err() {
                still_pending.push_back(task);
                continue;
            }
            let placement = self.place(&task);
            match placement {
                Some(slots) if self.map.acquire(&slots).is_ok() => {
                    self.account(&slots, true);
                    task.slots = Some(slots);
                    match task.transition(TaskState::AgentExecutingPending) {
                        Ok(()) => scheduled.push(task),
                        Err(_) => still_pending.push_back(task),
                    }
                }
                _ => {
                    let _ = task.transition(TaskState::AgentSchedulingPending);
                    still_pending.push_back(task);
                }
            }
        }
        self.pending = still_pending;
        scheduled
    }

    /// Release the slots held by a task (spec §2: unschedule pubsub).
    pub fn release(&mut self, slots: &Slots) {
        self.map.release(slots);
        self.account(slots, false);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn max_contiguous_free(slots: &[rp_core::model::Slot]) -> usize {
    use rp_core::model::SlotState;
    let mut best = 0;
    let mut run = 0;
    for s in slots {
        if s.state == SlotState::Free {
            run += 1;
            best = best.max(run);
        } else {
            run = 0;
        }
    }
    best
}
