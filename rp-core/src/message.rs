//! Wire message types (spec §4.6, §6): state updates on the Update queue,
//! and administrative commands on the Control pubsub.

use serde::{Deserialize, Serialize};

use crate::model::TaskState;

/// Entity type a state update applies to (spec §6). The agent core only
/// ever emits `Task`; the other variants are accepted here so the type
/// matches the wire format the client-side transport expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Session,
    Pmgr,
    Pilot,
    Tmgr,
    Task,
}

/// One message per state transition (spec §4.6). Ordering guarantee:
/// messages for the same `uid` are emitted in the order the transitions
/// occurred; cross-task ordering is not guaranteed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMessage {
    pub uid: String,
    pub etype: EntityType,
    pub state: TaskState,
    pub ts: u64,
    pub details: Option<String>,
}

impl StateMessage {
    pub fn task(uid: impl Into<String>, state: TaskState, ts: u64) -> Self {
        Self { uid: uid.into(), etype: EntityType::Task, state, ts, details: None }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Administrative commands carried on the Control pubsub (spec §4.6). All
/// components subscribe; commands are processed in arrival order per
/// component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlCommand {
    CancelTask { uids: Vec<String> },
    CancelPilot,
    Shutdown,
}

/// Event published when resources previously held by a task become free
/// again (spec §2's "unschedule" pubsub).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnscheduleEvent {
    pub uid: String,
}
