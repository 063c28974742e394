// sigrelay - local event-routing engine
//
// Host signals (CPU/RAM, battery, network, window focus, filesystem,
// clipboard, microphone) flow onto a process-local bus. The pipeline executor routes
// each event through user-authored graphs of filters, transformers, and
// policy-gated actions; the WebSocket hub fans events and results out to
// UI clients in real time.
//
// Architecture:
// - Signal sources: one producer task per host subsystem
// - Event bus: per-subscriber bounded queues connect all components
// - Pipeline executor: BFS traversal with per-node execution policies
// - WebSocket hub (axum): live event/action/status feed for clients
// - Store (SQLite): pipeline definitions in, event/action logs out

mod actions;
mod bus;
mod cli;
mod config;
mod events;
mod logging;
mod pipeline;
mod server;
mod signals;
mod startup;
mod store;
mod template;
mod util;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use actions::ActionRegistry;
use bus::{BusMessage, EventBus};
use config::Config;
use pipeline::Executor;
use server::{AppState, WsHub};
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    if cli::handle_cli() {
        return Ok(());
    }

    let config = Config::load().context("failed to load configuration")?;
    let _log_guard = logging::init(&config.logging)?;
    startup::print_startup(&config);

    let bus = EventBus::new();
    let store = Arc::new(Store::open(&config.db_path)?);
    let executor = Executor::new(
        bus.clone(),
        ActionRegistry::new(),
        config.permissions.clone(),
    );

    // Load active pipelines from the store. A bad row is skipped, not fatal:
    // the engine comes up with whatever loads cleanly.
    for record in store.list_active()? {
        match executor.load(record.id, &record.name, &record.nodes, &record.edges) {
            Ok(()) => {}
            Err(err) => {
                tracing::error!(pipeline = %record.name, id = record.id, error = %err, "rejected pipeline");
            }
        }
    }
    tracing::info!(count = executor.pipeline_count(), "pipelines loaded");

    // Bus consumers: executor traversal, WebSocket fan-out, log writer
    let executor_rx = bus.subscribe("executor", bus::DEFAULT_SUBSCRIBER_CAPACITY);
    tokio::spawn(executor.clone().run(executor_rx));

    let hub = WsHub::new();
    let hub_rx = bus.subscribe("hub", bus::DEFAULT_SUBSCRIBER_CAPACITY);
    tokio::spawn(hub.clone().run(hub_rx));

    let store_rx = bus.subscribe("store", bus::DEFAULT_SUBSCRIBER_CAPACITY);
    tokio::spawn(store::run_logger(store.clone(), store_rx));

    // Signal sources publish onto the bus
    let sources = Arc::new(signals::build_sources(&config)?);
    for handle in sources.iter() {
        let bus = bus.clone();
        handle.subscribe(Arc::new(move |event| {
            bus.publish(BusMessage::Signal(event));
        }));
        handle.start().await;
        tracing::info!(source = handle.name(), "started signal source");
    }

    let state = AppState {
        hub: hub.clone(),
        executor: executor.clone(),
        sources: sources.clone(),
        started_at: Utc::now(),
    };

    // Periodic system status on the `system` channel
    let status_state = state.clone();
    let status_interval = Duration::from_secs(config.status_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(status_interval);
        loop {
            ticker.tick().await;
            status_state
                .hub
                .broadcast_system_status(status_state.system_status());
        }
    });

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    server::serve(&config, state, shutdown).await?;

    // Stop sources before exiting so no event outlives the server
    for handle in sources.iter() {
        handle.stop().await;
    }
    tracing::info!("sigrelay stopped");
    Ok(())
}
