#![deny(unused_must_use)]
mod api;
mod config;
mod coverage;
mod database;
mod export_api;
mod federation;
mod ingest;
mod node_store;
mod nodes_api;
mod probe_log;
mod radio;
mod relay;
#[cfg(test)]
mod scenario_tests;
mod state;
mod telemetry_api;
mod telemetry_scheduler;
mod topology_api;
mod topology_store;
mod traceroute_api;
mod traceroute_scheduler;
mod traceroute_store;
mod views;

use crate::federation::FederatedUploader;
use crate::state::AppState;
use crate::telemetry_scheduler::TelemetryScheduler;
use crate::traceroute_scheduler::TracerouteScheduler;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// Workers get this long to drain after the shutdown broadcast before
/// being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Value of a `--config PATH` argument, if one was given.
fn config_path_from_args() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
    }
    None
}

#[tokio::main]
async fn main() {
    let config_path = config_path_from_args();
    let config = Arc::new(config::Config::load_or_default(config_path.as_deref()));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    let db = match database::init_database(Path::new(&config.database.path)) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to initialize database {}: {}", config.database.path, e);
            std::process::exit(1);
        }
    };
    tracing::info!("Node database initialized at {}", config.database.path);

    let (state, packet_receiver) = AppState::new(db, config.clone());

    // The radio driver (serial/TCP link to the local node) is a separate
    // crate: on connect it calls state.radio.connect(..) and feeds decoded
    // packets into state.packet_sender. Until then the schedulers no-op.

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut workers: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    let ingestor = Arc::new(state.ingestor());
    workers.push((
        "ingest",
        tokio::spawn(ingest::run_ingest_worker(
            ingestor,
            packet_receiver,
            shutdown_tx.subscribe(),
        )),
    ));

    if config.topology.enabled {
        workers.push((
            "topology-sweeper",
            tokio::spawn(topology_store::run_sweeper(
                state.topology.clone(),
                config.topology.link_timeout_minutes,
                shutdown_tx.subscribe(),
            )),
        ));
    }

    let traceroute_scheduler = Arc::new(TracerouteScheduler::new(
        state.traceroutes.clone(),
        state.probes.clone(),
        state.radio.clone(),
        config.auto_traceroute.clone(),
    ));
    workers.push((
        "auto-traceroute",
        tokio::spawn(traceroute_scheduler.run(shutdown_tx.subscribe())),
    ));

    let telemetry_scheduler = Arc::new(TelemetryScheduler::new(
        state.probes.clone(),
        state.radio.clone(),
        config.auto_telemetry.clone(),
        &config.auto_traceroute,
    ));
    workers.push((
        "auto-telemetry",
        tokio::spawn(telemetry_scheduler.run(shutdown_tx.subscribe())),
    ));

    let uploader = Arc::new(FederatedUploader::new(
        state.nodes.clone(),
        state.topology.clone(),
        state.traceroutes.clone(),
        config.federation.clone(),
    ));
    workers.push((
        "federated-uploader",
        tokio::spawn(uploader.run(shutdown_tx.subscribe())),
    ));

    let addr: SocketAddr = match format!("{}:{}", config.server.host, config.server.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(
                "Invalid listen address {}:{}: {}",
                config.server.host,
                config.server.port,
                e
            );
            std::process::exit(1);
        }
    };

    let router = api::build_router(state.clone());
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("HTTP API listening on http://{}", addr);

    let mut server_shutdown = shutdown_tx.subscribe();
    workers.push((
        "http-server",
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = server_shutdown.recv().await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("HTTP server error: {}", e);
            }
        }),
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown requested, stopping workers");
    let _ = shutdown_tx.send(());

    // Bounded join: whatever does not drain inside the grace window gets
    // aborted rather than holding the process open.
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    for (name, mut handle) in workers {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, &mut handle).await {
            Ok(Ok(())) => tracing::debug!("Worker {} stopped", name),
            Ok(Err(e)) => tracing::warn!("Worker {} panicked: {}", name, e),
            Err(_) => {
                tracing::warn!("Worker {} did not stop in time, aborting", name);
                handle.abort();
            }
        }
    }

    tracing::info!("Shutdown complete");
}
