// src/core/context.rs

//! The authoritative cluster view: membership, process and application maps,
//! tick/event ingestion, auto-fencing and status publication. Every mutation
//! happens on the loop thread; snapshots published on the bus are immutable.

use crate::core::address::{AddressState, AddressStatus};
use crate::core::application::ApplicationStatus;
use crate::core::clock::Clock;
use crate::core::errors::FleetdError;
use crate::core::events::{ProcessEvent, StatusBus, StatusEvent};
use crate::core::process::{ProcessState, ProcessStatus, namespec, split_namespec};
use crate::core::remote::{AddressMapper, Requester, RemoteProcessInfo, RulesLoader};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Owns the cluster membership view and the application/process maps, and
/// turns ticks, process events and timer ticks into state transitions.
pub struct Context {
    mapper: AddressMapper,
    auto_fence: bool,
    tick_timeout: i64,
    requester: Arc<dyn Requester>,
    rules: Arc<dyn RulesLoader>,
    bus: StatusBus,
    clock: Arc<dyn Clock>,
    addresses: BTreeMap<String, AddressStatus>,
    applications: BTreeMap<String, ApplicationStatus>,
    master_address: Option<String>,
    forced_events: Vec<String>,
}

impl Context {
    pub fn new(
        mapper: AddressMapper,
        auto_fence: bool,
        tick_timeout: i64,
        requester: Arc<dyn Requester>,
        rules: Arc<dyn RulesLoader>,
        bus: StatusBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let addresses = mapper
            .addresses()
            .iter()
            .map(|address| (address.clone(), AddressStatus::new(address)))
            .collect();
        Self {
            mapper,
            auto_fence,
            tick_timeout,
            requester,
            rules,
            bus,
            clock,
            addresses,
            applications: BTreeMap::new(),
            master_address: None,
            forced_events: Vec::new(),
        }
    }

    // --- accessors -------------------------------------------------------

    pub fn local_address(&self) -> &str {
        self.mapper.local_address()
    }

    pub fn address(&self, address: &str) -> Option<&AddressStatus> {
        self.addresses.get(address)
    }

    pub fn addresses(&self) -> &BTreeMap<String, AddressStatus> {
        &self.addresses
    }

    pub fn application(&self, application_name: &str) -> Option<&ApplicationStatus> {
        self.applications.get(application_name)
    }

    pub fn applications(&self) -> &BTreeMap<String, ApplicationStatus> {
        &self.applications
    }

    pub fn process(&self, namespec_str: &str) -> Option<&ProcessStatus> {
        let (group, name) = split_namespec(namespec_str)?;
        self.applications.get(group)?.processes.get(name)
    }

    pub fn process_mut(&mut self, namespec_str: &str) -> Option<&mut ProcessStatus> {
        let (group, name) = split_namespec(namespec_str)?;
        self.applications.get_mut(group)?.processes.get_mut(name)
    }

    /// The elected master address. Election itself is external; the core only
    /// records the outcome.
    pub fn master_address(&self) -> Option<&str> {
        self.master_address.as_deref()
    }

    pub fn set_master_address(&mut self, address: &str) {
        self.master_address = Some(address.to_string());
    }

    /// True iff some process is seen running on more than one address.
    pub fn conflicting(&self) -> bool {
        self.applications
            .values()
            .flat_map(|app| app.processes.values())
            .any(ProcessStatus::conflicting)
    }

    /// Namespecs currently marked for restart, in deterministic order.
    pub fn marked_processes(&self) -> Vec<String> {
        self.applications
            .values()
            .flat_map(|app| app.processes.values())
            .filter(|process| process.mark_for_restart)
            .map(ProcessStatus::namespec)
            .collect()
    }

    /// Current load of every running address, in capacity units, derived from
    /// the expected loading of the processes running there.
    pub fn address_load(&self) -> BTreeMap<String, u32> {
        let mut load: BTreeMap<String, u32> = self
            .addresses
            .values()
            .filter(|status| status.state() == AddressState::Running)
            .map(|status| (status.address.clone(), 0))
            .collect();
        for application in self.applications.values() {
            for process in application.processes.values() {
                for address in process.running_addresses() {
                    if let Some(used) = load.get_mut(address) {
                        *used += process.rules.expected_loading;
                    }
                }
            }
        }
        load
    }

    // --- event ingestion -------------------------------------------------

    /// Handles a liveness tick from a peer. On the first tick after a silence
    /// the peer is checked (authorization handshake plus inventory load); a
    /// transport failure there is a bug-class error propagated to the caller,
    /// which retries naturally on a later tick.
    pub async fn on_tick(&mut self, address: &str, when: i64) -> Result<(), FleetdError> {
        if !self.mapper.valid(address) {
            warn!("Received tick from unknown address {}", address);
            return Ok(());
        }
        let checked = {
            let Some(status) = self.addresses.get(address) else {
                return Ok(());
            };
            if status.in_isolation() {
                return Ok(());
            }
            status.checked
        };
        if !checked {
            if let Some(status) = self.addresses.get_mut(address) {
                status.set_state(AddressState::Checking);
            }
            self.check_address(address).await?;
        }
        // Re-test isolation: the check may have fenced the address off.
        let snapshot = {
            let Some(status) = self.addresses.get_mut(address) else {
                return Ok(());
            };
            if status.in_isolation() {
                return Ok(());
            }
            status.set_state(AddressState::Running);
            status.update_times(when, self.clock.now());
            status.snapshot()
        };
        self.bus.publish(StatusEvent::Address(snapshot));
        Ok(())
    }

    /// Handles a process state change pushed by a peer. Returns the namespec
    /// of the updated process so the caller can feed the active commanders.
    pub fn on_process_event(&mut self, event: &ProcessEvent) -> Option<String> {
        let address = event.address.as_str();
        if !self.mapper.valid(address) {
            warn!("Received process event from unknown address {}", address);
            return None;
        }
        if self
            .addresses
            .get(address)
            .is_some_and(AddressStatus::in_isolation)
        {
            return None;
        }
        let now = self.clock.now();
        let process_namespec = namespec(&event.group, &event.name);
        let (process_snapshot, application_snapshot) = {
            let Some(application) = self.applications.get_mut(&event.group) else {
                debug!(
                    "Dropping event for unknown application {}",
                    event.group
                );
                return None;
            };
            let Some(process) = application.processes.get_mut(&event.name) else {
                debug!("Dropping event for unknown process {}", process_namespec);
                return None;
            };
            process.apply_event(address, event, now);
            let process_snapshot = process.snapshot();
            application.evaluate();
            (process_snapshot, application.snapshot())
        };
        if let Some(status) = self.addresses.get_mut(address) {
            status.processes.insert(process_namespec.clone());
        }
        self.bus.publish(StatusEvent::Process(process_snapshot));
        self.bus
            .publish(StatusEvent::Application(application_snapshot));
        Some(process_namespec)
    }

    /// Periodic liveness audit: a running address that has not ticked within
    /// the tick timeout is invalidated.
    pub fn on_timer(&mut self) {
        let now = self.clock.now();
        let stale: Vec<String> = self
            .addresses
            .values()
            .filter(|status| {
                status.state() == AddressState::Running
                    && now - status.local_time > self.tick_timeout
            })
            .map(|status| status.address.clone())
            .collect();
        for address in stale {
            info!("No tick from {} within the timeout, invalidating", address);
            self.invalid(&address);
        }
    }

    /// One-shot handshake and inventory load on (re)entry into CHECKING.
    async fn check_address(&mut self, address: &str) -> Result<(), FleetdError> {
        let requester = Arc::clone(&self.requester);
        if self.auto_fence {
            let local = self.mapper.local_address().to_string();
            let peer_view = requester.address_info(address, &local).await.map_err(|e| {
                error!("[BUG] failed to fetch address info from {}: {}", address, e);
                e
            })?;
            if matches!(
                peer_view.state,
                AddressState::Isolating | AddressState::Isolated
            ) {
                warn!(
                    "Peer {} considers the local address {} in isolation",
                    address, local
                );
                self.invalid(address);
                return Ok(());
            }
        }
        let all_info = requester.all_process_info(address).await.map_err(|e| {
            error!(
                "[BUG] failed to fetch process inventory from {}: {}",
                address, e
            );
            e
        })?;
        if all_info.is_empty() {
            self.invalid(address);
        } else {
            self.load_processes(address, all_info);
        }
        if let Some(status) = self.addresses.get_mut(address) {
            status.checked = true;
        }
        Ok(())
    }

    /// Invalidates an address: SILENT, or ISOLATING when auto-fencing a
    /// remote member. Publishes the address first, then every process
    /// transition the invalidation triggers.
    pub fn invalid(&mut self, address: &str) {
        let is_local = self.mapper.local_address() == address;
        let (snapshot, hosted) = {
            let Some(status) = self.addresses.get_mut(address) else {
                return;
            };
            if self.auto_fence && !is_local {
                status.set_state(AddressState::Isolating);
            } else {
                status.set_state(AddressState::Silent);
                status.checked = false;
            }
            (
                status.snapshot(),
                status.processes.iter().cloned().collect::<Vec<_>>(),
            )
        };
        self.bus.publish(StatusEvent::Address(snapshot));
        for process_namespec in hosted {
            let Some((group, name)) = split_namespec(&process_namespec) else {
                continue;
            };
            let (group, name) = (group.to_string(), name.to_string());
            let Some((process_snapshot, application_snapshot)) = ({
                self.applications.get_mut(&group).and_then(|application| {
                    let process = application.processes.get_mut(&name)?;
                    process.invalidate_address(address);
                    let process_snapshot = process.snapshot();
                    application.evaluate();
                    Some((process_snapshot, application.snapshot()))
                })
            }) else {
                continue;
            };
            self.bus.publish(StatusEvent::Process(process_snapshot));
            self.bus
                .publish(StatusEvent::Application(application_snapshot));
        }
    }

    /// Promotes every ISOLATING address to the terminal ISOLATED state and
    /// returns them, so the transport layer can physically disconnect.
    pub fn handle_isolation(&mut self) -> Vec<String> {
        let mut isolated = Vec::new();
        for status in self.addresses.values_mut() {
            if status.state() == AddressState::Isolating {
                status.set_state(AddressState::Isolated);
                isolated.push(status.address.clone());
            }
        }
        for address in &isolated {
            if let Some(status) = self.addresses.get(address) {
                self.bus.publish(StatusEvent::Address(status.snapshot()));
            }
        }
        isolated
    }

    /// Merges a peer's full process inventory: creates missing applications
    /// and processes (loading their rules) and registers each process under
    /// the owning address.
    pub fn load_processes(&mut self, address: &str, all_info: Vec<RemoteProcessInfo>) {
        let rules = Arc::clone(&self.rules);
        let mut touched: BTreeSet<String> = BTreeSet::new();
        for entry in &all_info {
            if !self.applications.contains_key(&entry.group) {
                let application_rules = rules.application_rules(&entry.group);
                self.applications.insert(
                    entry.group.clone(),
                    ApplicationStatus::new(&entry.group, application_rules),
                );
            }
            touched.insert(entry.group.clone());
        }
        for entry in all_info {
            let process_namespec = namespec(&entry.group, &entry.name);
            let Some(application) = self.applications.get_mut(&entry.group) else {
                continue;
            };
            let process = application
                .processes
                .entry(entry.name.clone())
                .or_insert_with(|| {
                    ProcessStatus::new(
                        &entry.group,
                        &entry.name,
                        rules.process_rules(&process_namespec),
                    )
                });
            process.merge_info(address, entry.info);
            if let Some(status) = self.addresses.get_mut(address) {
                status.processes.insert(process_namespec);
            }
        }
        for application_name in touched {
            if let Some(application) = self.applications.get_mut(&application_name) {
                application.update_sequences();
                application.evaluate();
            }
        }
    }

    /// Ends the initial synchronization window: any address still UNKNOWN is
    /// invalidated eagerly.
    pub fn end_synchro(&mut self) {
        let unknown: Vec<String> = self
            .addresses
            .values()
            .filter(|status| status.state() == AddressState::Unknown)
            .map(|status| status.address.clone())
            .collect();
        for address in unknown {
            info!("Address {} never ticked during synchronization", address);
            self.invalid(&address);
        }
    }

    // --- forced state changes -------------------------------------------

    /// In-process fallback of the force-fatal/force-unknown hooks: applies the
    /// state directly and queues a synthetic event for the commanders.
    pub fn apply_forced_state(&mut self, namespec_str: &str, state: ProcessState, reason: &str) {
        let Some((group, name)) = split_namespec(namespec_str) else {
            return;
        };
        let (group, name) = (group.to_string(), name.to_string());
        let Some((process_snapshot, application_snapshot)) =
            self.applications.get_mut(&group).and_then(|application| {
                let process = application.processes.get_mut(&name)?;
                process.force_state(state, reason);
                let process_snapshot = process.snapshot();
                application.evaluate();
                Some((process_snapshot, application.snapshot()))
            })
        else {
            return;
        };
        self.bus.publish(StatusEvent::Process(process_snapshot));
        self.bus
            .publish(StatusEvent::Application(application_snapshot));
        self.forced_events.push(namespec_str.to_string());
    }

    /// Drains the synthetic events queued by forced state changes; the loop
    /// routes them into the commanders like ordinary process events.
    pub fn take_forced_events(&mut self) -> Vec<String> {
        std::mem::take(&mut self.forced_events)
    }
}
