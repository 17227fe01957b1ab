//! Update/Control (spec §4.6). Update is a single-writer sink that
//! serializes outgoing state notifications; Control is a bidirectional
//! pubsub for administrative commands (`cancel_task`, `cancel_pilot`,
//! `shutdown`), delivered to every subscribed component in publish order.

use rp_core::error::{Error, Result};
use rp_core::message::{ControlCommand, StateMessage};
use tokio::sync::{broadcast, mpsc};

/// Single-writer sink for `StateMessage`s. Per-task ordering is the
/// caller's responsibility: `publish` must be awaited (or at least called)
/// in the order the transitions occurred for a given `uid` -- cross-task
/// ordering carries no guarantee, matching spec §4.6.
#[derive(Clone)]
pub struct Update {
    tx: mpsc::UnboundedSender<StateMessage>,
}

impl Update {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StateMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, msg: StateMessage) -> Result<()> {
        self.tx.send(msg).map_err(|_| Error::Transport("update channel closed".into()))
    }
}

/// Bidirectional administrative pubsub. Every component holds its own
/// `subscribe()`d receiver; a published command reaches every receiver
/// that existed at publish time, in the order it was published.
#[derive(Clone)]
pub struct Control {
    tx: broadcast::Sender<ControlCommand>,
}

impl Control {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlCommand> {
        self.tx.subscribe()
    }

    /// A command published with no subscribers is simply missed, same as
    /// the real pubsub transport -- never an error.
    pub fn publish(&self, cmd: ControlCommand) {
        let _ = self.tx.send(cmd);
    }
}
