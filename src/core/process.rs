// src/core/process.rs

//! Per-process records: aggregation of per-address process info into one
//! cluster-wide state, placement rules, and the transient command bookkeeping
//! used by the commanders.

use crate::core::events::ProcessEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::{Display, EnumString};
use tracing::{debug, warn};

/// The state of a process as reported by a per-host process manager, and the
/// derived cluster-wide state of a [`ProcessStatus`].
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
pub enum ProcessState {
    Stopped,
    Starting,
    Backoff,
    Running,
    Stopping,
    Exited,
    Fatal,
    Unknown,
}

impl ProcessState {
    /// States that count as "running on an address" for conflict detection
    /// and load accounting.
    pub fn is_running_like(self) -> bool {
        matches!(
            self,
            ProcessState::Running | ProcessState::Starting | ProcessState::Backoff
        )
    }

    /// States from which no further activity is expected.
    pub fn is_stopped_like(self) -> bool {
        matches!(
            self,
            ProcessState::Stopped
                | ProcessState::Exited
                | ProcessState::Fatal
                | ProcessState::Unknown
        )
    }
}

/// The info block held for one (process, address) pair, merged from inventory
/// loads and live process events. Unrecognized event fields are carried along
/// verbatim in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub state: Option<ProcessState>,
    #[serde(default)]
    pub start: i64,
    #[serde(default)]
    pub stop: i64,
    #[serde(default)]
    pub now: i64,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub spawnerr: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Per-process placement and sequencing rules, loaded lazily when the process
/// first appears in an inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessRules {
    /// A required process failing to start engages the application's starting
    /// failure strategy; an optional one only gets force-failed.
    pub required: bool,
    /// The process is expected to exit on its own as part of application startup.
    pub wait_exit: bool,
    /// Declared share of an address's capacity, in percent.
    pub expected_loading: u32,
    /// Candidate addresses for placement. Empty means any running address.
    pub starting_addresses: Vec<String>,
    /// Rank of this process inside the application start sequence.
    pub start_sequence: i32,
    /// Rank of this process inside the application stop sequence.
    pub stop_sequence: i32,
}

impl Default for ProcessRules {
    fn default() -> Self {
        Self {
            required: false,
            wait_exit: false,
            expected_loading: 1,
            starting_addresses: Vec::new(),
            start_sequence: 0,
            stop_sequence: 0,
        }
    }
}

/// The immutable snapshot of a [`ProcessStatus`] published on the status bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub namespec: String,
    pub state: ProcessState,
    /// Addresses on which the process is currently running.
    pub addresses: Vec<String>,
    pub expected_exit: bool,
    pub spawnerr: String,
}

/// Builds the cluster-wide process identifier from its two name parts.
pub fn namespec(application_name: &str, process_name: &str) -> String {
    format!("{application_name}:{process_name}")
}

/// Splits a namespec back into (application_name, process_name).
pub fn split_namespec(namespec: &str) -> Option<(&str, &str)> {
    namespec.split_once(':')
}

/// Cluster-wide record for one process, aggregating what every address knows
/// about it.
#[derive(Debug)]
pub struct ProcessStatus {
    pub application_name: String,
    pub process_name: String,
    state: ProcessState,
    /// Whether the last exit was expected, from the most recent event.
    pub expected_exit: bool,
    /// Set when an address hosting the process became invalid while the
    /// process was required and running, or when a conflict is detected.
    pub mark_for_restart: bool,
    /// Suppresses wait-exit bookkeeping for the current direct start command.
    pub ignore_wait_exit: bool,
    /// Extra arguments of the in-flight start command.
    pub extra_args: String,
    /// Wall time at which the in-flight command was dispatched.
    pub request_time: i64,
    pub rules: ProcessRules,
    /// Last spawn error reported for this process.
    pub spawnerr: String,
    infos: BTreeMap<String, ProcessInfo>,
}

impl ProcessStatus {
    pub fn new(application_name: &str, process_name: &str, rules: ProcessRules) -> Self {
        Self {
            application_name: application_name.to_string(),
            process_name: process_name.to_string(),
            state: ProcessState::Unknown,
            expected_exit: true,
            mark_for_restart: false,
            ignore_wait_exit: false,
            extra_args: String::new(),
            request_time: 0,
            rules,
            spawnerr: String::new(),
            infos: BTreeMap::new(),
        }
    }

    pub fn namespec(&self) -> String {
        namespec(&self.application_name, &self.process_name)
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Addresses whose info shows the process in a running-like state.
    pub fn running_addresses(&self) -> Vec<&str> {
        self.infos
            .iter()
            .filter(|(_, info)| info.state.is_some_and(ProcessState::is_running_like))
            .map(|(address, _)| address.as_str())
            .collect()
    }

    /// Addresses whose info shows the process in any non-stopped state,
    /// including a stop already under way.
    pub fn active_addresses(&self) -> Vec<&str> {
        self.infos
            .iter()
            .filter(|(_, info)| info.state.is_some_and(|s| !s.is_stopped_like()))
            .map(|(address, _)| address.as_str())
            .collect()
    }

    /// A process is conflicting iff it runs on more than one address.
    pub fn conflicting(&self) -> bool {
        self.running_addresses().len() > 1
    }

    /// Merges an inventory info block for one address and re-derives the state.
    pub fn merge_info(&mut self, address: &str, info: ProcessInfo) {
        if !info.spawnerr.is_empty() {
            self.spawnerr = info.spawnerr.clone();
        }
        self.infos.insert(address.to_string(), info);
        self.evaluate();
    }

    /// Applies a live process event from one address and re-derives the state.
    pub fn apply_event(&mut self, address: &str, event: &ProcessEvent, when: i64) {
        let info = self.infos.entry(address.to_string()).or_default();
        info.state = Some(event.state);
        info.now = when;
        match event.state {
            ProcessState::Running | ProcessState::Starting | ProcessState::Backoff => {
                info.start = when;
            }
            ProcessState::Stopped | ProcessState::Exited | ProcessState::Fatal => {
                info.stop = when;
            }
            _ => {}
        }
        for (key, value) in &event.extra {
            if key == "spawnerr" {
                if let Some(text) = value.as_str() {
                    info.spawnerr = text.to_string();
                    self.spawnerr = text.to_string();
                }
            }
            info.extra.insert(key.clone(), value.clone());
        }
        self.expected_exit = event.expected;
        self.evaluate();
    }

    /// Marks the info from an invalidated address as unusable without removing
    /// it. Returns true when the loss marks the process for restart.
    pub fn invalidate_address(&mut self, address: &str) -> bool {
        let was_running = self
            .infos
            .get(address)
            .and_then(|info| info.state)
            .is_some_and(ProcessState::is_running_like);
        if let Some(info) = self.infos.get_mut(address) {
            info.state = Some(ProcessState::Unknown);
        }
        self.evaluate();
        let marked = was_running && self.rules.required;
        if marked {
            debug!(
                "Marking {} for restart after loss of address {}",
                self.namespec(),
                address
            );
            self.mark_for_restart = true;
        }
        marked
    }

    /// Forces the derived state, used when a command failure must be surfaced
    /// without any event from a process manager.
    pub fn force_state(&mut self, state: ProcessState, reason: &str) {
        self.state = state;
        self.spawnerr = reason.to_string();
    }

    /// Re-derives the cluster-wide state from the per-address info map.
    /// The result is deterministic in the info contents alone.
    fn evaluate(&mut self) {
        let states: Vec<ProcessState> =
            self.infos.values().filter_map(|info| info.state).collect();
        let next = if states.is_empty() {
            ProcessState::Unknown
        } else if states.contains(&ProcessState::Running) {
            ProcessState::Running
        } else if states.contains(&ProcessState::Stopping) {
            ProcessState::Stopping
        } else if states.contains(&ProcessState::Starting) {
            ProcessState::Starting
        } else if states.contains(&ProcessState::Backoff) {
            ProcessState::Backoff
        } else {
            // All addresses agree the process is down. Use the most recent info
            // to decide between STOPPED, EXITED, FATAL and UNKNOWN.
            self.infos
                .values()
                .filter(|info| info.state.is_some_and(|s| s != ProcessState::Unknown))
                .max_by_key(|info| (info.stop, info.now))
                .and_then(|info| info.state)
                .unwrap_or(ProcessState::Unknown)
        };
        self.state = next;
        if self.conflicting() && !self.mark_for_restart {
            warn!(
                "Conflict detected: {} is running on addresses {:?}",
                self.namespec(),
                self.running_addresses()
            );
            self.mark_for_restart = true;
        }
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            namespec: self.namespec(),
            state: self.state,
            addresses: self
                .running_addresses()
                .into_iter()
                .map(str::to_string)
                .collect(),
            expected_exit: self.expected_exit,
            spawnerr: self.spawnerr.clone(),
        }
    }
}
