// src/core/commander/stopper.rs

//! The stop-direction commander: dispatches stop commands to every address
//! running a process and walks the application stop sequences. Stop failures
//! never touch the plan.

use crate::core::application::ApplicationState;
use crate::core::clock::Clock;
use crate::core::commander::{Commander, CommanderPlan};
use crate::core::context::Context;
use crate::core::errors::FleetdError;
use crate::core::process::ProcessState;
use crate::core::remote::{ProcessInfoSource, Pusher};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Stopper {
    plan: CommanderPlan,
    pusher: Pusher,
    info_source: Arc<dyn ProcessInfoSource>,
    clock: Arc<dyn Clock>,
    command_timeout: i64,
}

impl Stopper {
    pub fn new(
        pusher: Pusher,
        info_source: Arc<dyn ProcessInfoSource>,
        clock: Arc<dyn Clock>,
        command_timeout: i64,
    ) -> Self {
        Self {
            plan: CommanderPlan::default(),
            pusher,
            info_source,
            clock,
            command_timeout,
        }
    }

    /// Inserts the application stop sequence under outer rank 0, merged with
    /// whatever is already scheduled there.
    pub fn store_application_stop_sequence(&mut self, ctx: &Context, application_name: &str) {
        if let Some(application) = ctx.application(application_name) {
            let group = application.stop_sequence().clone();
            self.plan
                .planned_sequence
                .insert(0, application_name, group);
        }
    }

    /// Plans and begins a full application stop. Returns true when nothing is
    /// (or remains) to be done.
    pub fn stop_application(&mut self, ctx: &mut Context, application_name: &str) -> bool {
        let Some(application) = ctx.application(application_name) else {
            warn!("Cannot stop unknown application {}", application_name);
            return true;
        };
        if application.state() == ApplicationState::Stopped {
            debug!("Application {} already stopped", application_name);
            return true;
        }
        info!("Stopping application {}", application_name);
        self.store_application_stop_sequence(ctx, application_name);
        self.initial_jobs(ctx);
        !self.in_progress()
    }

    /// Stops a single process on every address running it, outside of any
    /// sequence. Returns true when nothing is (or remains) to be done.
    pub fn stop_process(&mut self, ctx: &mut Context, namespec: &str) -> bool {
        let Some(process) = ctx.process(namespec) else {
            warn!("Cannot stop unknown process {}", namespec);
            return true;
        };
        let application_name = process.application_name.clone();
        let mut jobs = self
            .plan
            .current_jobs
            .remove(&application_name)
            .unwrap_or_default();
        self.process_job(ctx, namespec, &mut jobs);
        if !jobs.is_empty() {
            self.plan.current_jobs.insert(application_name, jobs);
        }
        !self.in_progress()
    }

    /// Plans a cluster stop: every application not already stopped is
    /// enqueued at its configured stop sequence rank.
    pub fn stop_applications(&mut self, ctx: &mut Context) {
        let stoppable: Vec<(i32, String)> = ctx
            .applications()
            .values()
            .filter(|application| application.state() != ApplicationState::Stopped)
            .map(|application| {
                (
                    application.rules.stop_sequence,
                    application.application_name.clone(),
                )
            })
            .collect();
        for (rank, application_name) in stoppable {
            if let Some(application) = ctx.application(&application_name) {
                let group = application.stop_sequence().clone();
                self.plan
                    .planned_sequence
                    .insert(rank, &application_name, group);
            }
        }
        self.initial_jobs(ctx);
    }
}

impl Commander for Stopper {
    fn plan(&self) -> &CommanderPlan {
        &self.plan
    }

    fn plan_mut(&mut self) -> &mut CommanderPlan {
        &mut self.plan
    }

    fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    fn command_timeout(&self) -> i64 {
        self.command_timeout
    }

    /// The wait ends once the process is down for good. STOPPING does not
    /// terminate: the stop is still under way.
    fn is_terminal(&self, state: ProcessState) -> bool {
        matches!(
            state,
            ProcessState::Stopped
                | ProcessState::Exited
                | ProcessState::Fatal
                | ProcessState::Unknown
        )
    }

    fn is_stuck(&self, state: ProcessState) -> bool {
        !self.is_terminal(state)
    }

    fn stuck_verb(&self) -> &'static str {
        "running"
    }

    fn request_verb(&self) -> &'static str {
        "stop"
    }

    fn process_job(&mut self, ctx: &mut Context, namespec: &str, jobs: &mut Vec<String>) {
        let Some(process) = ctx.process(namespec) else {
            return;
        };
        if process.state().is_stopped_like() {
            debug!("{} already stopped", namespec);
            return;
        }
        let addresses: Vec<String> = process
            .active_addresses()
            .into_iter()
            .map(str::to_string)
            .collect();
        let now = self.clock.now();
        if let Some(process) = ctx.process_mut(namespec) {
            process.request_time = now;
        }
        for address in &addresses {
            info!("Stopping {} on {}", namespec, address);
            self.pusher.send_stop_process(address, namespec);
        }
        jobs.push(namespec.to_string());
    }

    fn process_failure(&mut self, ctx: &mut Context, namespec: &str, reason: &str, force: bool) {
        if force {
            match self.info_source.force_process_unknown(namespec, reason) {
                Ok(()) => {}
                Err(FleetdError::NotFound(_)) => {
                    ctx.apply_forced_state(namespec, ProcessState::Unknown, reason);
                }
                Err(e) => warn!("Failed to force {} unknown: {}", namespec, e),
            }
        }
    }
}
