// src/core/plan.rs

//! The two-level ordered schedule owned by a commander: outer ranks over
//! applications, inner ranks over processes within an application. Modeled as
//! an explicit value type with deterministic rank ordering; negative and zero
//! ranks are valid and order normally.

use std::collections::BTreeMap;

/// Inner rank to the namespecs scheduled at it, for one application.
pub type JobGroup = BTreeMap<i32, Vec<String>>;

/// One outer rank: the applications scheduled at it and their job groups.
pub type Batch = BTreeMap<String, JobGroup>;

/// The full planned sequence: outer rank to batch. Each outer rank is a
/// barrier; nothing in rank r+1 starts before rank r has drained.
#[derive(Debug, Default)]
pub struct Plan {
    ranks: BTreeMap<i32, Batch>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// Inserts one application job group under an outer rank, merging with any
    /// group already scheduled there for the same application.
    pub fn insert(&mut self, rank: i32, application_name: &str, group: JobGroup) {
        let slot = self
            .ranks
            .entry(rank)
            .or_default()
            .entry(application_name.to_string())
            .or_default();
        for (inner_rank, mut namespecs) in group {
            slot.entry(inner_rank).or_default().append(&mut namespecs);
        }
    }

    /// Pops the lowest outer rank, if any.
    pub fn pop_lowest(&mut self) -> Option<Batch> {
        self.ranks.pop_first().map(|(_, batch)| batch)
    }

    /// Removes every trace of an application from the plan, pruning outer
    /// ranks left empty. Returns whether anything was removed.
    pub fn remove_application(&mut self, application_name: &str) -> bool {
        let mut removed = false;
        self.ranks.retain(|_, batch| {
            removed |= batch.remove(application_name).is_some();
            !batch.is_empty()
        });
        removed
    }

    /// Whether a namespec is scheduled anywhere in the plan.
    pub fn contains(&self, namespec: &str) -> bool {
        self.ranks.values().any(|batch| {
            batch
                .values()
                .any(|group| group.values().any(|list| list.iter().any(|n| n == namespec)))
        })
    }

    pub fn clear(&mut self) {
        self.ranks.clear();
    }
}
