// src/rpc.rs

//! Client side of the peer process-manager API: pulls address and inventory
//! state and forwards start/stop commands, as line-delimited JSON over TCP.
//! Member identifiers are the `host:port` of the peer manager endpoint.

use fleetd::core::errors::FleetdError;
use fleetd::core::remote::{DispatchRequest, PeerAddressInfo, RemoteProcessInfo, Requester};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

/// Bound on one request round-trip, so a slow peer cannot stall the caller.
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
#[serde(tag = "request", rename_all = "snake_case")]
enum RpcRequest<'a> {
    AddressInfo { subject: &'a str },
    AllProcessInfo,
}

fn transport_error(peer: &str, reason: impl ToString) -> FleetdError {
    FleetdError::Transport {
        peer: peer.to_string(),
        reason: reason.to_string(),
    }
}

/// Sends one request line to `peer` and reads one response line back.
async fn round_trip(peer: &str, request: &RpcRequest<'_>) -> Result<String, FleetdError> {
    let io = async {
        let mut stream = TcpStream::connect(peer).await?;
        let mut line = serde_json::to_string(request).map_err(std::io::Error::other)?;
        line.push('\n');
        stream.write_all(line.as_bytes()).await?;
        let mut reader = BufReader::new(stream);
        let mut response = String::new();
        reader.read_line(&mut response).await?;
        Ok::<String, std::io::Error>(response)
    };
    match timeout(RPC_TIMEOUT, io).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(transport_error(peer, e)),
        Err(_) => Err(transport_error(peer, "request timed out")),
    }
}

/// The shipped [`Requester`], speaking the peer manager line protocol.
#[derive(Debug, Default)]
pub struct PeerRequester;

impl PeerRequester {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Requester for PeerRequester {
    async fn address_info(
        &self,
        peer: &str,
        subject: &str,
    ) -> Result<PeerAddressInfo, FleetdError> {
        let response = round_trip(peer, &RpcRequest::AddressInfo { subject }).await?;
        serde_json::from_str(&response).map_err(|e| transport_error(peer, e))
    }

    async fn all_process_info(&self, peer: &str) -> Result<Vec<RemoteProcessInfo>, FleetdError> {
        let response = round_trip(peer, &RpcRequest::AllProcessInfo).await?;
        serde_json::from_str(&response).map_err(|e| transport_error(peer, e))
    }
}

/// Forwards one outgoing command to the process manager it addresses.
/// Fire-and-forget: a delivery failure is only logged, completion is observed
/// through subsequent process events.
pub async fn forward_command(request: DispatchRequest) {
    let address = match &request {
        DispatchRequest::StartProcess { address, .. } => address.clone(),
        DispatchRequest::StopProcess { address, .. } => address.clone(),
    };
    let io = async {
        let mut stream = TcpStream::connect(&address).await?;
        let mut line = serde_json::to_string(&request).map_err(std::io::Error::other)?;
        line.push('\n');
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;
        Ok::<(), std::io::Error>(())
    };
    match timeout(RPC_TIMEOUT, io).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to deliver command to {}: {}", address, e),
        Err(_) => warn!("Timed out delivering command to {}", address),
    }
}
