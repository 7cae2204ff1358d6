// src/config.rs

//! Manages supervisor configuration: loading, validation, and the rules
//! tables resolved lazily when applications and processes are discovered.

use crate::core::application::ApplicationRules;
use crate::core::placement::PlacementStrategy;
use crate::core::process::ProcessRules;
use crate::core::remote::RulesLoader;
use anyhow::{Context as _, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

/// The full supervisor configuration, parsed from a TOML file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// The member identifier of this very instance. Must be in `members`.
    pub local_address: String,
    /// The configured cluster membership.
    pub members: Vec<String>,
    #[serde(default = "default_host")]
    pub host: String,
    /// Port of the event intake listener.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// If true, unauthorized or unresponsive remotes are isolated instead of
    /// merely silenced.
    #[serde(default)]
    pub auto_fence: bool,
    /// A running address is invalidated after this long without a tick.
    #[serde(default = "default_tick_timeout", with = "humantime_serde")]
    pub tick_timeout: Duration,
    /// An in-flight start/stop command is considered failed after this long.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// How long to wait for first ticks before invalidating unknown members.
    #[serde(default = "default_synchro_timeout", with = "humantime_serde")]
    pub synchro_timeout: Duration,
    /// Placement strategy used when a request does not name one.
    #[serde(default)]
    pub starting_strategy: PlacementStrategy,
    /// Per-application rules, keyed by application name.
    #[serde(default)]
    pub applications: BTreeMap<String, ApplicationRules>,
    /// Per-process rules, keyed by namespec ("app:proc").
    #[serde(default)]
    pub programs: BTreeMap<String, ProcessRules>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8671
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_tick_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_command_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_synchro_timeout() -> Duration {
    Duration::from_secs(15)
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the parsed configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.members.is_empty() {
            return Err(anyhow!("members cannot be empty"));
        }
        if !self.members.iter().any(|m| m == &self.local_address) {
            return Err(anyhow!(
                "local_address '{}' is not in the members list",
                self.local_address
            ));
        }
        if self.tick_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(anyhow!("timeouts cannot be 0"));
        }
        for namespec in self.programs.keys() {
            if !namespec.contains(':') {
                return Err(anyhow!(
                    "invalid program key '{namespec}': expected 'application:process'"
                ));
            }
        }
        Ok(())
    }
}

/// The shipped rules loader, resolving the `[applications]` and `[programs]`
/// tables. Unlisted entities get the default rules.
#[derive(Debug)]
pub struct ConfigRules {
    config: Arc<Config>,
}

impl ConfigRules {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl RulesLoader for ConfigRules {
    fn application_rules(&self, application_name: &str) -> ApplicationRules {
        self.config
            .applications
            .get(application_name)
            .cloned()
            .unwrap_or_default()
    }

    fn process_rules(&self, namespec: &str) -> ProcessRules {
        self.config
            .programs
            .get(namespec)
            .cloned()
            .unwrap_or_default()
    }
}
