// src/core/address.rs

//! Per-member records: the lifecycle state machine of a cluster address and
//! its last-seen bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum_macros::{Display, EnumString};
use tracing::warn;

/// The lifecycle state of a cluster member.
///
/// `Isolated` is terminal: once an address has been fenced off, no transition
/// leads out of it and all of its events are dropped.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum AddressState {
    Unknown,
    Checking,
    Running,
    Silent,
    Isolating,
    Isolated,
}

/// The immutable snapshot of an [`AddressStatus`] published on the status bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressSnapshot {
    pub address: String,
    pub state: AddressState,
    pub checked: bool,
    pub remote_time: i64,
    pub local_time: i64,
}

/// Runtime record for a single cluster member.
#[derive(Debug)]
pub struct AddressStatus {
    pub address: String,
    state: AddressState,
    /// Whether the initial authorization handshake and process inventory
    /// have been retrieved since the last transition out of `Unknown`/`Silent`.
    pub checked: bool,
    /// Wall time reported by the peer in its last tick.
    pub remote_time: i64,
    /// Local wall time at which the last tick was received.
    pub local_time: i64,
    /// Namespecs of the processes known to run on this address.
    pub processes: BTreeSet<String>,
}

impl AddressStatus {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            state: AddressState::Unknown,
            checked: false,
            remote_time: 0,
            local_time: 0,
            processes: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> AddressState {
        self.state
    }

    /// Applies a state transition, refusing to leave the terminal `Isolated` state.
    /// Returns whether the state actually changed.
    pub fn set_state(&mut self, new_state: AddressState) -> bool {
        if self.state == new_state {
            return false;
        }
        if self.state == AddressState::Isolated {
            warn!(
                "Ignoring transition of isolated address {} to {}",
                self.address, new_state
            );
            return false;
        }
        self.state = new_state;
        true
    }

    /// True while the address is being fenced or already fenced off.
    pub fn in_isolation(&self) -> bool {
        matches!(
            self.state,
            AddressState::Isolating | AddressState::Isolated
        )
    }

    pub fn update_times(&mut self, remote_time: i64, local_time: i64) {
        self.remote_time = remote_time;
        self.local_time = local_time;
    }

    pub fn snapshot(&self) -> AddressSnapshot {
        AddressSnapshot {
            address: self.address.clone(),
            state: self.state,
            checked: self.checked,
            remote_time: self.remote_time,
            local_time: self.local_time,
        }
    }
}
