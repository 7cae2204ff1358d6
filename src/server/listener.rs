// src/server/listener.rs

//! Implements the TCP event intake, through which per-host process managers
//! push their ticks and process events as line-delimited JSON.

use crate::core::events::{ProcessEvent, TickEvent};
use crate::server::SupervisorEvent;
use anyhow::Result;
use futures::StreamExt;
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{info, warn};

/// The wire form of one intake line.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum IntakeMessage {
    Tick(TickEvent),
    Process(ProcessEvent),
}

impl From<IntakeMessage> for SupervisorEvent {
    fn from(message: IntakeMessage) -> Self {
        match message {
            IntakeMessage::Tick(tick) => SupervisorEvent::Tick(tick),
            IntakeMessage::Process(event) => SupervisorEvent::Process(event),
        }
    }
}

/// Spawns the main intake listener loop.
pub async fn run_listener(
    host: String,
    port: u16,
    events: UnboundedSender<SupervisorEvent>,
) -> Result<()> {
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    info!("Event intake listening on {}:{}", host, port);

    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let events = events.clone();
                // Handle each process manager connection concurrently.
                tokio::spawn(async move {
                    info!("Accepted intake connection from: {}", addr);
                    if let Err(e) = handle_connection(socket, events).await {
                        warn!("Error handling intake connection from {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                warn!("Failed to accept intake connection: {}", e);
            }
        }
    }
}

/// Reads one connection until EOF, forwarding every decoded line into the
/// supervision loop. Malformed lines are logged and skipped.
async fn handle_connection(
    socket: TcpStream,
    events: UnboundedSender<SupervisorEvent>,
) -> Result<()> {
    let mut framed = FramedRead::new(socket, LinesCodec::new());

    while let Some(result) = framed.next().await {
        let line = match result {
            Ok(line) => line,
            Err(e) => {
                warn!("Error decoding intake line: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IntakeMessage>(&line) {
            Ok(message) => {
                if events.send(message.into()).is_err() {
                    // The supervision loop is gone, stop reading.
                    break;
                }
            }
            Err(e) => warn!("Dropping malformed intake line: {}", e),
        }
    }
    Ok(())
}
