// Geotrack - Main Entry Point
// Copyright (C) 2024
// Licensed under AGPL v3

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use geotrack::config::{Command, Config, RelayArgs, TrackArgs};
use geotrack::net::Relay;
use geotrack::position::{FeedSource, PermissionState};
use geotrack::replay::Replay;
use geotrack::TrackingOrchestrator;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let config = Config::parse();

    // Initialize logging
    init_logging(config.verbose);

    match config.command {
        Command::Track(args) => run_track(args).await,
        Command::Relay(args) => run_relay(args).await,
    }
}

async fn run_track(args: TrackArgs) -> Result<(), Box<dyn std::error::Error>> {
    let replay = Replay::load(&args.readings).await?;
    if replay.is_empty() {
        warn!("Recording {} has no readings", args.readings.display());
    }

    let source = Arc::new(FeedSource::new(PermissionState::Prompt));
    let orchestrator = TrackingOrchestrator::new(source.clone(), args.orchestrator_config());

    // Log what other room members publish
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!("Inbound {:?}: {}", event.kind, event.payload),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} inbound events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    orchestrator
        .start_tracking(args.entity.clone(), args.tracking_options())
        .await?;
    info!("Tracking {} via {}", args.entity, args.server);

    let feed = source.feed();
    tokio::select! {
        pushed = replay.play(&feed, args.speed) => info!("Replayed {} readings", pushed),
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Received shutdown signal (Ctrl+C)"),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
    }

    // Give queued updates a chance to go out before disconnecting
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.linger_secs);
    while orchestrator.queue_len().await > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let state = orchestrator.estimator_state();
    let pending = orchestrator.queue_len().await;
    orchestrator.stop_tracking().await;

    info!(
        "Stopped. Filter updates: {}, last position: {:.6}, {:.6}, undelivered: {}",
        state.updates, state.position[0], state.position[1], pending
    );
    Ok(())
}

async fn run_relay(args: RelayArgs) -> Result<(), Box<dyn std::error::Error>> {
    let relay = Relay::new();
    let mut server = relay.serve(args.listen).await?;
    info!("Relay ready on {}", server.addr());

    // Wait for shutdown signal (Ctrl+C)
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal (Ctrl+C)");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            return Err(err.into());
        }
    }

    info!("Shutting down...");
    server.shutdown().await;
    info!(
        "Relay stopped. Clients: {}, messages relayed: {}",
        relay.client_count(),
        relay.relayed_count()
    );

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;

    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_span_events(if verbose {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
