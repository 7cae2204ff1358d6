// src/core/events.rs

//! Defines the events consumed and emitted by the supervision core: the tick
//! and process events pushed by per-host process managers, and the status bus
//! fanning out state changes to subscribers.

use crate::core::address::AddressSnapshot;
use crate::core::application::ApplicationSnapshot;
use crate::core::process::{ProcessSnapshot, ProcessState};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, Sender as BroadcastSender};
use tracing::debug;

/// The capacity of the broadcast channel for status fan-out. Lagging
/// subscribers lose the oldest snapshots, never block the core.
const STATUS_BUS_CAPACITY: usize = 4096;

/// A liveness heartbeat from a peer, carrying its wall time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickEvent {
    pub address: String,
    pub when: i64,
}

/// A process state change reported by the process manager of one address.
/// Fields the core does not recognize are passed through verbatim in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub address: String,
    pub group: String,
    pub name: String,
    pub state: ProcessState,
    #[serde(default)]
    pub expected: bool,
    #[serde(default)]
    pub from_state: Option<ProcessState>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A status change published by the Context.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusEvent {
    Address(AddressSnapshot),
    Process(ProcessSnapshot),
    Application(ApplicationSnapshot),
}

/// The `StatusBus` is the fan-out hub for all status changes. Subscribers get
/// immutable snapshots; delivery is best-effort.
#[derive(Debug, Clone)]
pub struct StatusBus {
    sender: BroadcastSender<StatusEvent>,
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(STATUS_BUS_CAPACITY);
        Self { sender }
    }

    /// Publishes a status snapshot to all subscribers. It's okay if there are
    /// no active subscribers.
    pub fn publish(&self, event: StatusEvent) {
        if self.sender.send(event).is_err() {
            debug!("Published a status event with no active subscribers.");
        }
    }

    /// Provides a new receiver for an observer to subscribe to status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }
}
