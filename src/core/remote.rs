// src/core/remote.rs

//! Seams to the external collaborators of the core: the configured address
//! mapper, the peer state requester, the command pusher and the hook into the
//! local process manager.

use crate::core::address::AddressState;
use crate::core::application::ApplicationRules;
use crate::core::errors::FleetdError;
use crate::core::process::{ProcessInfo, ProcessRules};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::warn;

/// The configured cluster membership: the full member list and which of the
/// members is this very instance.
#[derive(Debug, Clone)]
pub struct AddressMapper {
    addresses: Vec<String>,
    local_address: String,
}

impl AddressMapper {
    pub fn new(addresses: Vec<String>, local_address: String) -> Self {
        Self {
            addresses,
            local_address,
        }
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn valid(&self, address: &str) -> bool {
        self.addresses.iter().any(|a| a == address)
    }
}

/// A peer's view of one address, as returned by `address_info`. Only the state
/// is consulted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddressInfo {
    pub state: AddressState,
}

/// One process entry of a peer's full inventory.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteProcessInfo {
    pub group: String,
    pub name: String,
    #[serde(flatten)]
    pub info: ProcessInfo,
}

/// Pulls state from peer process managers. Implementations perform the actual
/// RPC; failures surface as [`FleetdError::Transport`].
#[async_trait]
pub trait Requester: Send + Sync {
    /// Asks `peer` for its view of the address named by `subject`.
    async fn address_info(
        &self,
        peer: &str,
        subject: &str,
    ) -> Result<PeerAddressInfo, FleetdError>;

    /// Fetches the full process inventory of `peer`.
    async fn all_process_info(&self, peer: &str) -> Result<Vec<RemoteProcessInfo>, FleetdError>;
}

/// A command to be delivered to the process manager of one address. Delivery
/// is fire-and-forget; completion is observed through subsequent process
/// events only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DispatchRequest {
    StartProcess {
        address: String,
        namespec: String,
        extra_args: String,
    },
    StopProcess {
        address: String,
        namespec: String,
    },
}

/// Hands start/stop commands to the transport worker draining the channel.
/// Safe to call from the loop thread; never blocks.
#[derive(Debug, Clone)]
pub struct Pusher {
    sender: UnboundedSender<DispatchRequest>,
}

impl Pusher {
    pub fn new() -> (Self, UnboundedReceiver<DispatchRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn send_start_process(&self, address: &str, namespec: &str, extra_args: &str) {
        self.send(DispatchRequest::StartProcess {
            address: address.to_string(),
            namespec: namespec.to_string(),
            extra_args: extra_args.to_string(),
        });
    }

    pub fn send_stop_process(&self, address: &str, namespec: &str) {
        self.send(DispatchRequest::StopProcess {
            address: address.to_string(),
            namespec: namespec.to_string(),
        });
    }

    fn send(&self, request: DispatchRequest) {
        if self.sender.send(request).is_err() {
            warn!("Dropping outgoing command: the transport worker is gone.");
        }
    }
}

/// Hook into the process manager hosting this supervisor, used to force a
/// process state when a command fails without any observable event. May fail
/// with [`FleetdError::NotFound`]; callers then fall back to applying the
/// forced state through the Context.
pub trait ProcessInfoSource: Send + Sync {
    fn force_process_fatal(&self, namespec: &str, reason: &str) -> Result<(), FleetdError>;

    fn force_process_unknown(&self, namespec: &str, reason: &str) -> Result<(), FleetdError>;
}

/// Resolves the rules of applications and processes discovered lazily by the
/// Context. The shipped implementation reads them from the configuration
/// rules tables.
pub trait RulesLoader: Send + Sync {
    fn application_rules(&self, application_name: &str) -> ApplicationRules;

    fn process_rules(&self, namespec: &str) -> ProcessRules;
}

/// The shipped no-op hook: reports every process as unknown so that callers
/// always take the in-process fallback arm.
#[derive(Debug, Default)]
pub struct NullProcessInfoSource;

impl ProcessInfoSource for NullProcessInfoSource {
    fn force_process_fatal(&self, namespec: &str, _reason: &str) -> Result<(), FleetdError> {
        Err(FleetdError::NotFound(namespec.to_string()))
    }

    fn force_process_unknown(&self, namespec: &str, _reason: &str) -> Result<(), FleetdError> {
        Err(FleetdError::NotFound(namespec.to_string()))
    }
}
