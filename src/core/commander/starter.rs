// src/core/commander/starter.rs

//! The start-direction commander: places processes on addresses, dispatches
//! start commands through the pusher and applies the per-application starting
//! failure strategies.

use crate::core::application::{ApplicationState, StartingFailureStrategy};
use crate::core::clock::Clock;
use crate::core::commander::{Commander, CommanderPlan};
use crate::core::context::Context;
use crate::core::errors::FleetdError;
use crate::core::placement::{PlacementStrategy, select_address};
use crate::core::process::{ProcessState, split_namespec};
use crate::core::remote::{ProcessInfoSource, Pusher};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

pub struct Starter {
    plan: CommanderPlan,
    /// Strategy applied to the jobs currently being planned.
    strategy: PlacementStrategy,
    /// Strategy used when none is given, e.g. for marked-process restarts.
    default_strategy: PlacementStrategy,
    pusher: Pusher,
    info_source: Arc<dyn ProcessInfoSource>,
    /// Applications to be stopped after a STOP starting-failure, drained into
    /// the Stopper by the supervision loop.
    stop_requests: UnboundedSender<String>,
    clock: Arc<dyn Clock>,
    command_timeout: i64,
}

impl Starter {
    pub fn new(
        default_strategy: PlacementStrategy,
        pusher: Pusher,
        info_source: Arc<dyn ProcessInfoSource>,
        stop_requests: UnboundedSender<String>,
        clock: Arc<dyn Clock>,
        command_timeout: i64,
    ) -> Self {
        Self {
            plan: CommanderPlan::default(),
            strategy: default_strategy,
            default_strategy,
            pusher,
            info_source,
            stop_requests,
            clock,
            command_timeout,
        }
    }

    /// Inserts the application start sequence under outer rank 0, merged with
    /// whatever is already scheduled there. Processes already running are
    /// included; `process_job` no-ops them.
    pub fn store_application_start_sequence(&mut self, ctx: &Context, application_name: &str) {
        if let Some(application) = ctx.application(application_name) {
            let group = application.start_sequence().clone();
            self.plan
                .planned_sequence
                .insert(0, application_name, group);
        }
    }

    /// Plans and begins a full application start. Returns true when nothing
    /// is (or remains) to be done.
    pub fn start_application(
        &mut self,
        ctx: &mut Context,
        strategy: PlacementStrategy,
        application_name: &str,
    ) -> bool {
        self.strategy = strategy;
        let Some(application) = ctx.application(application_name) else {
            warn!("Cannot start unknown application {}", application_name);
            return true;
        };
        if application.state() == ApplicationState::Running {
            debug!("Application {} already running", application_name);
            return true;
        }
        info!("Starting application {}", application_name);
        self.store_application_start_sequence(ctx, application_name);
        self.initial_jobs(ctx);
        !self.in_progress()
    }

    /// Starts a single process, outside of any sequence. Returns true when
    /// nothing is (or remains) to be done.
    pub fn start_process(
        &mut self,
        ctx: &mut Context,
        strategy: PlacementStrategy,
        namespec: &str,
        extra_args: &str,
    ) -> bool {
        self.strategy = strategy;
        let Some((group, _)) = split_namespec(namespec) else {
            return true;
        };
        let application_name = group.to_string();
        match ctx.process_mut(namespec) {
            Some(process) => {
                process.extra_args = extra_args.to_string();
                process.ignore_wait_exit = true;
            }
            None => {
                warn!("Cannot start unknown process {}", namespec);
                return true;
            }
        }
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

    /// Restarts the processes marked after an address loss or a conflict:
    /// required ones first, then the optional ones, clearing each mark as the
    /// process is submitted. Uses the configured default strategy.
    pub fn start_marked_processes(&mut self, ctx: &mut Context) {
        let marked = ctx.marked_processes();
        if marked.is_empty() {
            return;
        }
        let (required, optional): (Vec<String>, Vec<String>) = marked
            .into_iter()
            .partition(|namespec| ctx.process(namespec).is_some_and(|p| p.rules.required));
        for namespec in required.into_iter().chain(optional) {
            info!("Restarting marked process {}", namespec);
            if let Some(process) = ctx.process_mut(&namespec) {
                process.mark_for_restart = false;
            }
            self.start_process(ctx, self.default_strategy, &namespec, "");
        }
    }

    /// Plans a cluster start: every stopped application with a positive start
    /// sequence rank is enqueued at that outer rank.
    pub fn start_applications(&mut self, ctx: &mut Context) {
        let startable: Vec<(i32, String)> = ctx
            .applications()
            .values()
            .filter(|application| {
                application.state() == ApplicationState::Stopped
                    && application.rules.start_sequence > 0
            })
            .map(|application| {
                (
                    application.rules.start_sequence,
                    application.application_name.clone(),
                )
            })
            .collect();
        for (rank, application_name) in startable {
            if let Some(application) = ctx.application(&application_name) {
                let group = application.start_sequence().clone();
                self.plan
                    .planned_sequence
                    .insert(rank, &application_name, group);
            }
        }
        self.initial_jobs(ctx);
    }
}

impl Commander for Starter {
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

    /// The wait ends once the process reached any non-starting state.
    fn is_terminal(&self, state: ProcessState) -> bool {
        matches!(
            state,
            ProcessState::Stopped
                | ProcessState::Exited
                | ProcessState::Fatal
                | ProcessState::Running
                | ProcessState::Stopping
        )
    }

    fn is_stuck(&self, state: ProcessState) -> bool {
        !matches!(state, ProcessState::Running | ProcessState::Stopping)
    }

    fn stuck_verb(&self) -> &'static str {
        "stopped"
    }

    fn request_verb(&self) -> &'static str {
        "start"
    }

    fn process_job(&mut self, ctx: &mut Context, namespec: &str, jobs: &mut Vec<String>) {
        let Some(process) = ctx.process(namespec) else {
            return;
        };
        if matches!(
            process.state(),
            ProcessState::Running | ProcessState::Starting
        ) {
            debug!("{} already started", namespec);
            return;
        }
        let rules = process.rules.clone();
        let load = ctx.address_load();
        match select_address(self.strategy, &rules, rules.expected_loading, &load) {
            Some(address) => {
                let now = self.clock.now();
                let Some(process) = ctx.process_mut(namespec) else {
                    return;
                };
                process.request_time = now;
                let extra_args = process.extra_args.clone();
                info!("Starting {} on {}", namespec, address);
                self.pusher
                    .send_start_process(&address, namespec, &extra_args);
                jobs.push(namespec.to_string());
            }
            None => {
                warn!("No resource available to start {}", namespec);
                self.process_failure(ctx, namespec, "no resource available", true);
            }
        }
    }

    fn process_failure(&mut self, ctx: &mut Context, namespec: &str, reason: &str, force: bool) {
        if force {
            match self.info_source.force_process_fatal(namespec, reason) {
                Ok(()) => {}
                Err(FleetdError::NotFound(_)) => {
                    ctx.apply_forced_state(namespec, ProcessState::Fatal, reason);
                }
                Err(e) => warn!("Failed to force {} fatal: {}", namespec, e),
            }
        }
        let Some(process) = ctx.process(namespec) else {
            return;
        };
        if !process.rules.required {
            return;
        }
        let application_name = process.application_name.clone();
        let Some(application) = ctx.application(&application_name) else {
            return;
        };
        match application.rules.starting_failure_strategy {
            StartingFailureStrategy::Abort => {
                warn!(
                    "Aborting start of application {} after failure of {}",
                    application_name, namespec
                );
                self.plan.planned_jobs.remove(&application_name);
                self.plan
                    .planned_sequence
                    .remove_application(&application_name);
            }
            StartingFailureStrategy::Continue => {
                info!(
                    "Continuing start of application {} despite failure of {}",
                    application_name, namespec
                );
            }
            StartingFailureStrategy::Stop => {
                warn!(
                    "Stopping application {} after failure of {}",
                    application_name, namespec
                );
                self.plan.planned_jobs.remove(&application_name);
                self.plan
                    .planned_sequence
                    .remove_application(&application_name);
                let _ = self.stop_requests.send(application_name);
            }
        }
    }
}
