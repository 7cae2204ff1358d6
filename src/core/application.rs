// src/core/application.rs

//! Groups the processes sharing an application name, with their ordered
//! start/stop sequences and the failure strategies applied when a required
//! process cannot be brought up.

use crate::core::process::{ProcessState, ProcessStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::{Display, EnumString};

/// The derived state of an application, summarizing its processes.
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
pub enum ApplicationState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// What the Starter does with its plan when a required process of this
/// application fails to start.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum StartingFailureStrategy {
    /// Give up on the application: drop its remaining planned jobs.
    #[default]
    Abort,
    /// Keep going with the rest of the plan.
    Continue,
    /// Drop the remaining planned jobs and stop the whole application.
    Stop,
}

/// Policy applied by a higher-level reactor when a process of a running
/// application crashes. Recorded here, not acted on by the commanders.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunningFailureStrategy {
    #[default]
    Continue,
    RestartProcess,
    StopApplication,
    RestartApplication,
}

/// Per-application rules, loaded lazily when the application first appears.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationRules {
    /// Outer rank of the application in a cluster-wide start. Zero or negative
    /// keeps the application out of automatic starts.
    pub start_sequence: i32,
    /// Outer rank of the application in a cluster-wide stop.
    pub stop_sequence: i32,
    pub starting_failure_strategy: StartingFailureStrategy,
    pub running_failure_strategy: RunningFailureStrategy,
}

/// The immutable snapshot of an [`ApplicationStatus`] published on the status bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSnapshot {
    pub application_name: String,
    pub state: ApplicationState,
    pub major_failure: bool,
    pub minor_failure: bool,
}

/// Runtime record for one application: its processes, sequences and rules.
#[derive(Debug)]
pub struct ApplicationStatus {
    pub application_name: String,
    state: ApplicationState,
    /// A required process is broken while the application runs.
    pub major_failure: bool,
    /// An optional process is broken.
    pub minor_failure: bool,
    pub rules: ApplicationRules,
    pub processes: BTreeMap<String, ProcessStatus>,
    start_sequence: BTreeMap<i32, Vec<String>>,
    stop_sequence: BTreeMap<i32, Vec<String>>,
}

impl ApplicationStatus {
    pub fn new(application_name: &str, rules: ApplicationRules) -> Self {
        Self {
            application_name: application_name.to_string(),
            state: ApplicationState::Stopped,
            major_failure: false,
            minor_failure: false,
            rules,
            processes: BTreeMap::new(),
            start_sequence: BTreeMap::new(),
            stop_sequence: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> ApplicationState {
        self.state
    }

    /// Ordered start sequence: inner rank to the namespecs scheduled at it.
    pub fn start_sequence(&self) -> &BTreeMap<i32, Vec<String>> {
        &self.start_sequence
    }

    /// Ordered stop sequence: inner rank to the namespecs scheduled at it.
    pub fn stop_sequence(&self) -> &BTreeMap<i32, Vec<String>> {
        &self.stop_sequence
    }

    /// Rebuilds both sequences from the current process rules. Processes keep
    /// the list order of the underlying name-sorted map within a rank.
    pub fn update_sequences(&mut self) {
        self.start_sequence.clear();
        self.stop_sequence.clear();
        for process in self.processes.values() {
            let namespec = process.namespec();
            self.start_sequence
                .entry(process.rules.start_sequence)
                .or_default()
                .push(namespec.clone());
            self.stop_sequence
                .entry(process.rules.stop_sequence)
                .or_default()
                .push(namespec);
        }
    }

    /// Re-derives the application state and failure flags from its processes.
    pub fn evaluate(&mut self) {
        let states: Vec<(ProcessState, bool, bool)> = self
            .processes
            .values()
            .map(|process| {
                (
                    process.state(),
                    process.rules.required,
                    process.expected_exit,
                )
            })
            .collect();

        self.state = if states
            .iter()
            .any(|(s, ..)| matches!(*s, ProcessState::Starting | ProcessState::Backoff))
        {
            ApplicationState::Starting
        } else if states
            .iter()
            .any(|(s, ..)| matches!(*s, ProcessState::Stopping))
        {
            ApplicationState::Stopping
        } else if states
            .iter()
            .any(|(s, ..)| matches!(*s, ProcessState::Running))
        {
            ApplicationState::Running
        } else {
            ApplicationState::Stopped
        };

        let application_alive = !matches!(self.state, ApplicationState::Stopped);
        self.major_failure = application_alive
            && states.iter().any(|(s, required, expected)| {
                *required
                    && (matches!(*s, ProcessState::Fatal)
                        || (matches!(*s, ProcessState::Exited) && !*expected))
            });
        self.minor_failure = states
            .iter()
            .any(|(s, required, _)| !*required && matches!(*s, ProcessState::Fatal));
    }

    pub fn snapshot(&self) -> ApplicationSnapshot {
        ApplicationSnapshot {
            application_name: self.application_name.clone(),
            state: self.state,
            major_failure: self.major_failure,
            minor_failure: self.minor_failure,
        }
    }
}
