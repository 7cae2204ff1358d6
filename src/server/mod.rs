// src/server/mod.rs

//! The supervision loop: a single logical event loop consuming ticks, process
//! events and control requests, and driving the Context and the commanders.
//! Every mutation of core state happens here, on the loop task.

pub mod listener;

use crate::config::{Config, ConfigRules};
use crate::core::clock::Clock;
use crate::core::commander::{Commander, Starter, Stopper};
use crate::core::context::Context;
use crate::core::events::{ProcessEvent, StatusBus, StatusEvent, TickEvent};
use crate::core::placement::PlacementStrategy;
use crate::core::remote::{
    AddressMapper, DispatchRequest, ProcessInfoSource, Pusher, Requester,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time;
use tracing::{error, info};

/// Period of the coarse timer driving liveness audits and command timeouts.
const TIMER_PERIOD: Duration = Duration::from_secs(1);

/// A control request from an operator surface.
#[derive(Debug, Clone)]
pub enum ControlRequest {
    StartApplication {
        application_name: String,
        strategy: Option<PlacementStrategy>,
    },
    StopApplication {
        application_name: String,
    },
    StartProcess {
        namespec: String,
        strategy: Option<PlacementStrategy>,
        extra_args: String,
    },
    StopProcess {
        namespec: String,
    },
    /// Record the externally elected master address.
    SetMaster {
        address: String,
    },
}

/// Everything the loop consumes, from the intake listener and the operator
/// surfaces.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Tick(TickEvent),
    Process(ProcessEvent),
    Control(ControlRequest),
}

/// Handles held by the embedding application: inject events, subscribe to
/// status changes, drain outgoing commands, request shutdown.
pub struct SupervisorHandle {
    pub events: UnboundedSender<SupervisorEvent>,
    pub shutdown: broadcast::Sender<()>,
    status: StatusBus,
    dispatch: Option<UnboundedReceiver<DispatchRequest>>,
}

impl SupervisorHandle {
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    /// The stream of outgoing start/stop commands. The transport attaching to
    /// the per-host process managers drains this; it can be taken only once.
    pub fn take_dispatch(&mut self) -> Option<UnboundedReceiver<DispatchRequest>> {
        self.dispatch.take()
    }
}

/// Owns the Context and the commanders, and runs the supervision loop.
pub struct Supervisor {
    ctx: Context,
    starter: Starter,
    stopper: Stopper,
    default_strategy: PlacementStrategy,
    events_rx: UnboundedReceiver<SupervisorEvent>,
    stop_requests_rx: UnboundedReceiver<String>,
    shutdown_rx: broadcast::Receiver<()>,
    clock: Arc<dyn Clock>,
    synchro_deadline: i64,
    synchro_done: bool,
}

impl Supervisor {
    pub fn new(
        config: Arc<Config>,
        requester: Arc<dyn Requester>,
        info_source: Arc<dyn ProcessInfoSource>,
        clock: Arc<dyn Clock>,
    ) -> (Self, SupervisorHandle) {
        let mapper = AddressMapper::new(config.members.clone(), config.local_address.clone());
        let bus = StatusBus::new();
        let rules = Arc::new(ConfigRules::new(Arc::clone(&config)));
        let ctx = Context::new(
            mapper,
            config.auto_fence,
            config.tick_timeout.as_secs() as i64,
            requester,
            rules,
            bus.clone(),
            Arc::clone(&clock),
        );

        let (pusher, dispatch_rx) = Pusher::new();
        let (stop_requests_tx, stop_requests_rx) = mpsc::unbounded_channel();
        let command_timeout = config.command_timeout.as_secs() as i64;
        let starter = Starter::new(
            config.starting_strategy,
            pusher.clone(),
            Arc::clone(&info_source),
            stop_requests_tx,
            Arc::clone(&clock),
            command_timeout,
        );
        let stopper = Stopper::new(pusher, info_source, Arc::clone(&clock), command_timeout);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let synchro_deadline = clock.now() + config.synchro_timeout.as_secs() as i64;

        let supervisor = Self {
            ctx,
            starter,
            stopper,
            default_strategy: config.starting_strategy,
            events_rx,
            stop_requests_rx,
            shutdown_rx,
            clock,
            synchro_deadline,
            synchro_done: false,
        };
        let handle = SupervisorHandle {
            events: events_tx,
            shutdown: shutdown_tx,
            status: bus,
            dispatch: Some(dispatch_rx),
        };
        (supervisor, handle)
    }

    /// The main loop. Returns once a shutdown is signalled.
    pub async fn run(mut self) {
        let mut timer = time::interval(TIMER_PERIOD);
        info!(
            "Supervision loop started for local address {}",
            self.ctx.local_address()
        );
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Supervision loop shutting down.");
                    return;
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }
                _ = timer.tick() => {
                    self.handle_timer();
                }
            }
        }
    }

    async fn handle_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Tick(tick) => {
                if let Err(e) = self.ctx.on_tick(&tick.address, tick.when).await {
                    error!("Check of address {} failed: {}", tick.address, e);
                }
            }
            SupervisorEvent::Process(process_event) => {
                if let Some(namespec) = self.ctx.on_process_event(&process_event) {
                    self.starter.on_event(&mut self.ctx, &namespec);
                    self.stopper.on_event(&mut self.ctx, &namespec);
                    self.drain_forced_events();
                }
            }
            SupervisorEvent::Control(request) => self.handle_control(request),
        }
    }

    fn handle_control(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::StartApplication {
                application_name,
                strategy,
            } => {
                self.starter.start_application(
                    &mut self.ctx,
                    strategy.unwrap_or(self.default_strategy),
                    &application_name,
                );
            }
            ControlRequest::StopApplication { application_name } => {
                self.stopper.stop_application(&mut self.ctx, &application_name);
            }
            ControlRequest::StartProcess {
                namespec,
                strategy,
                extra_args,
            } => {
                self.starter.start_process(
                    &mut self.ctx,
                    strategy.unwrap_or(self.default_strategy),
                    &namespec,
                    &extra_args,
                );
            }
            ControlRequest::StopProcess { namespec } => {
                self.stopper.stop_process(&mut self.ctx, &namespec);
            }
            ControlRequest::SetMaster { address } => {
                self.ctx.set_master_address(&address);
            }
        }
        self.drain_forced_events();
        self.drain_stop_requests();
    }

    fn handle_timer(&mut self) {
        let now = self.clock.now();
        self.ctx.on_timer();
        let isolated = self.ctx.handle_isolation();
        if !isolated.is_empty() {
            info!("Isolated addresses: {:?}", isolated);
        }
        if !self.synchro_done && now >= self.synchro_deadline {
            self.synchro_done = true;
            info!("Synchronization window closed.");
            self.ctx.end_synchro();
            self.starter.start_applications(&mut self.ctx);
        }
        self.starter.check_progress(&mut self.ctx);
        self.stopper.check_progress(&mut self.ctx);
        self.drain_forced_events();
        self.drain_stop_requests();
        if self.synchro_done {
            self.starter.start_marked_processes(&mut self.ctx);
        }
    }

    /// Routes the synthetic events queued by forced state changes into the
    /// commanders, exactly like ordinary process events.
    fn drain_forced_events(&mut self) {
        loop {
            let forced = self.ctx.take_forced_events();
            if forced.is_empty() {
                return;
            }
            for namespec in forced {
                self.starter.on_event(&mut self.ctx, &namespec);
                self.stopper.on_event(&mut self.ctx, &namespec);
            }
        }
    }

    /// Applies the application stops requested by the Starter's STOP
    /// starting-failure strategy.
    fn drain_stop_requests(&mut self) {
        while let Ok(application_name) = self.stop_requests_rx.try_recv() {
            self.stopper.stop_application(&mut self.ctx, &application_name);
        }
    }
}
