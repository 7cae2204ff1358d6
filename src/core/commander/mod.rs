// src/core/commander/mod.rs

//! The commanders turn application-level start/stop requests into ordered,
//! concurrent, failure-aware execution of per-process commands. This module
//! holds the scheduling skeleton shared by the Starter and the Stopper: a
//! two-level plan where each outer rank is a barrier over applications and
//! each inner rank a barrier over the processes of one application.

pub mod starter;
pub mod stopper;

pub use starter::Starter;
pub use stopper::Stopper;

use crate::core::clock::Clock;
use crate::core::context::Context;
use crate::core::plan::{JobGroup, Plan};
use crate::core::process::{ProcessState, split_namespec};
use std::collections::BTreeMap;
use tracing::warn;

/// The three plan maps of a commander. A namespec appears in at most one of
/// them at any time.
#[derive(Debug, Default)]
pub struct CommanderPlan {
    /// Outer rank to applications to inner job groups: work not yet begun.
    pub planned_sequence: Plan,
    /// The current outer-rank batch, per application.
    pub planned_jobs: BTreeMap<String, JobGroup>,
    /// In-flight commands, per application.
    pub current_jobs: BTreeMap<String, Vec<String>>,
}

impl CommanderPlan {
    pub fn in_progress(&self) -> bool {
        !self.planned_sequence.is_empty()
            || !self.planned_jobs.is_empty()
            || !self.current_jobs.is_empty()
    }

    /// Whether a namespec is anywhere in the plan, at any of the three levels.
    pub fn contains(&self, namespec: &str) -> bool {
        self.planned_sequence.contains(namespec)
            || self
                .planned_jobs
                .values()
                .any(|group| group.values().any(|list| list.iter().any(|n| n == namespec)))
            || self
                .current_jobs
                .values()
                .any(|list| list.iter().any(|n| n == namespec))
    }

    pub fn clear(&mut self) {
        self.planned_sequence.clear();
        self.planned_jobs.clear();
        self.current_jobs.clear();
    }
}

/// The scheduling skeleton. Concrete commanders provide the per-direction
/// pieces (`process_job`, `process_failure`, the terminal predicate); the
/// provided methods drive the plan through its barriers. Commanders hold
/// processes by namespec only and resolve them through the Context on each
/// step.
pub trait Commander {
    fn plan(&self) -> &CommanderPlan;

    fn plan_mut(&mut self) -> &mut CommanderPlan;

    fn clock(&self) -> &dyn Clock;

    /// Seconds an in-flight command may take before it is declared failed.
    fn command_timeout(&self) -> i64;

    /// Whether an observed state ends the wait for this commander's command.
    fn is_terminal(&self, state: ProcessState) -> bool;

    /// Whether a state past the command timeout counts as a stuck command.
    fn is_stuck(&self, state: ProcessState) -> bool;

    /// "stopped" for the Starter, "running" for the Stopper.
    fn stuck_verb(&self) -> &'static str;

    /// "start" for the Starter, "stop" for the Stopper.
    fn request_verb(&self) -> &'static str;

    /// Issues the command for one process, appending it to `jobs` when a
    /// command was actually dispatched.
    fn process_job(&mut self, ctx: &mut Context, namespec: &str, jobs: &mut Vec<String>);

    /// Reacts to a process that failed its command.
    fn process_failure(&mut self, ctx: &mut Context, namespec: &str, reason: &str, force: bool);

    /// True iff any work is planned or in flight.
    fn in_progress(&self) -> bool {
        self.plan().in_progress()
    }

    /// Pops the lowest outer rank into the planned jobs and processes every
    /// application of that batch.
    fn initial_jobs(&mut self, ctx: &mut Context) {
        let Some(batch) = self.plan_mut().planned_sequence.pop_lowest() else {
            return;
        };
        let application_names: Vec<String> = batch.keys().cloned().collect();
        {
            let plan = self.plan_mut();
            for (application_name, group) in batch {
                let slot = plan.planned_jobs.entry(application_name).or_default();
                for (rank, mut namespecs) in group {
                    slot.entry(rank).or_default().append(&mut namespecs);
                }
            }
        }
        for application_name in application_names {
            self.process_application_jobs(ctx, &application_name);
        }
    }

    /// Works through the inner ranks of one application until a rank actually
    /// dispatches commands (then waits for events) or the ranks run out.
    fn process_application_jobs(&mut self, ctx: &mut Context, application_name: &str) {
        loop {
            let popped = {
                let plan = self.plan_mut();
                let Some(job_group) = plan.planned_jobs.get_mut(application_name) else {
                    return;
                };
                let popped = job_group.pop_first();
                if job_group.is_empty() {
                    plan.planned_jobs.remove(application_name);
                }
                popped
            };
            let Some((_, namespecs)) = popped else {
                return;
            };
            let mut jobs = self
                .plan_mut()
                .current_jobs
                .remove(application_name)
                .unwrap_or_default();
            for namespec in &namespecs {
                self.process_job(ctx, namespec, &mut jobs);
            }
            if !jobs.is_empty() {
                self.plan_mut()
                    .current_jobs
                    .insert(application_name.to_string(), jobs);
                return;
            }
            // Nothing got a command at this rank, fall through to the next one.
        }
    }

    /// Feeds an observed process event into the plan: removes the process
    /// from its in-flight list once terminal, then advances the inner and
    /// outer barriers as lists drain.
    fn on_event(&mut self, ctx: &mut Context, namespec: &str) {
        let Some((group, _)) = split_namespec(namespec) else {
            return;
        };
        let application_name = group.to_string();
        if !self.plan().current_jobs.contains_key(&application_name) {
            return;
        }
        let Some(state) = ctx.process(namespec).map(|p| p.state()) else {
            return;
        };
        if self.is_terminal(state) {
            if let Some(jobs) = self.plan_mut().current_jobs.get_mut(&application_name) {
                jobs.retain(|n| n != namespec);
            }
            if let Some(process) = ctx.process_mut(namespec) {
                process.ignore_wait_exit = false;
            }
        }
        let drained = self
            .plan()
            .current_jobs
            .get(&application_name)
            .is_some_and(|jobs| jobs.is_empty());
        if !drained {
            return;
        }
        self.plan_mut().current_jobs.remove(&application_name);
        if self.plan().planned_jobs.contains_key(&application_name) {
            self.process_application_jobs(ctx, &application_name);
        } else if self.plan().current_jobs.is_empty()
            && !self.plan().planned_sequence.is_empty()
        {
            self.initial_jobs(ctx);
        }
    }

    /// Periodic audit of the in-flight commands: any command past the timeout
    /// whose process is still stuck is declared failed. Returns true iff
    /// nothing is in progress afterwards.
    fn check_progress(&mut self, ctx: &mut Context) -> bool {
        let now = self.clock().now();
        let timeout = self.command_timeout();
        let mut stuck = Vec::new();
        for jobs in self.plan().current_jobs.values() {
            for namespec in jobs {
                let Some(process) = ctx.process(namespec) else {
                    continue;
                };
                if now - process.request_time > timeout && self.is_stuck(process.state()) {
                    stuck.push(namespec.clone());
                }
            }
        }
        for namespec in stuck {
            let reason = format!(
                "Still {} {} seconds after {} request",
                self.stuck_verb(),
                timeout,
                self.request_verb()
            );
            warn!("{}: {}", namespec, reason);
            self.process_failure(ctx, &namespec, &reason, true);
        }
        !self.in_progress()
    }

    /// Empties the whole plan. Already-dispatched commands are not rescinded;
    /// their completion events are ignored because their application is no
    /// longer in the in-flight map.
    fn abort(&mut self) {
        self.plan_mut().clear();
    }
}
