// src/core/placement.rs

//! Pure placement: picks the address that will host a process at start time,
//! from a load snapshot taken on the loop thread.

use crate::core::process::ProcessRules;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use strum_macros::{Display, EnumString};

/// Share of an address assumed fully loaded, in the same percent units as
/// `ProcessRules::expected_loading`.
pub const ADDRESS_CAPACITY: u32 = 100;

/// Strategy selecting an address to host a process.
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
pub enum PlacementStrategy {
    /// First candidate, in the static order of the process rules.
    #[default]
    Config,
    LessLoaded,
    MostLoaded,
}

/// Selects an address for a process, or `None` when no candidate has room for
/// `expected_loading` more units. `load` holds the current load of every
/// address eligible to host anything (the running members).
pub fn select_address(
    strategy: PlacementStrategy,
    rules: &ProcessRules,
    expected_loading: u32,
    load: &BTreeMap<String, u32>,
) -> Option<String> {
    let candidates: Vec<&str> = if rules.starting_addresses.is_empty() {
        load.keys().map(String::as_str).collect()
    } else {
        rules
            .starting_addresses
            .iter()
            .map(String::as_str)
            .filter(|address| load.contains_key(*address))
            .collect()
    };

    let fits = |address: &str| {
        load.get(address)
            .is_some_and(|used| used + expected_loading <= ADDRESS_CAPACITY)
    };
    let used = |address: &str| load.get(address).copied().unwrap_or(0);

    let chosen = match strategy {
        PlacementStrategy::Config => candidates.into_iter().find(|a| fits(a)),
        PlacementStrategy::LessLoaded => candidates
            .into_iter()
            .filter(|a| fits(a))
            .min_by_key(|a| (used(a), *a)),
        PlacementStrategy::MostLoaded => candidates
            .into_iter()
            .filter(|a| fits(a))
            .max_by_key(|a| (used(a), Reverse(*a))),
    };
    chosen.map(str::to_string)
}
