// src/main.rs

//! The main entry point for the Fleetd supervisor application.

use anyhow::Result;
use fleetd::config::Config;
use fleetd::core::clock::SystemClock;
use fleetd::core::remote::NullProcessInfoSource;
use fleetd::server::{Supervisor, listener};
use std::env;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info};

mod rpc;

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    // Define version information.
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    // Collect command-line arguments to decide the execution mode.
    let args: Vec<String> = env::args().collect();

    // Handle the --version flag.
    if args.contains(&"--version".to_string()) {
        println!("Fleetd version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; otherwise, it defaults to "fleetd.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("fleetd.toml");

    // Load the supervisor configuration from the determined path. The
    // supervisor cannot run without a valid configuration.
    let config = match Config::from_file(config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Failed to load configuration from '{config_path}': {e}");
            std::process::exit(1);
        }
    };

    // Initialize logging. It defaults to a more verbose level for the
    // supervision core.
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| format!("{},fleetd::core=debug", config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .with_ansi(true)
        .init();

    info!("Starting Fleetd {} on {}", VERSION, config.local_address);

    let clock = Arc::new(SystemClock);
    let requester = Arc::new(rpc::PeerRequester::new());
    let info_source = Arc::new(NullProcessInfoSource);
    let (supervisor, mut handle) = Supervisor::new(
        Arc::clone(&config),
        requester,
        info_source,
        clock,
    );

    // The transport worker draining outgoing start/stop commands. The
    // per-host process manager transport attaches here.
    if let Some(mut dispatch_rx) = handle.take_dispatch() {
        tokio::spawn(async move {
            while let Some(request) = dispatch_rx.recv().await {
                debug!("Dispatching command: {:?}", request);
                rpc::forward_command(request).await;
            }
        });
    }

    // Mirror status changes into the log until a real subscriber surface
    // (web UI, REST) attaches to the bus.
    let status_rx = handle.subscribe_status();
    tokio::spawn(async move {
        let mut stream = BroadcastStream::new(status_rx);
        while let Some(event) = stream.next().await {
            match event {
                Ok(status) => debug!("Status change: {:?}", status),
                Err(lagged) => debug!("Status observer lagged: {}", lagged),
            }
        }
    });

    // The TCP intake through which process managers push ticks and events.
    let events = handle.events.clone();
    let host = config.host.clone();
    let port = config.port;
    tokio::spawn(async move {
        if let Err(e) = listener::run_listener(host, port, events).await {
            error!("Event intake listener failed: {}", e);
        }
    });

    // Run the supervision loop until a shutdown is requested.
    let shutdown = handle.shutdown.clone();
    let loop_task = tokio::spawn(supervisor.run());

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal.");
    let _ = shutdown.send(());
    let _ = loop_task.await;
    Ok(())
}
