//! xpwatchd - character experience watcher daemon.
//!
//! Polls the remote character API for every watched id, emits change
//! notifications to a chat webhook, and serves the local command API.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use xpwatch_common::{SubjectStore, WatchConfig, VERSION};
use xpwatchd::commands::Commands;
use xpwatchd::fetch::CharacterClient;
use xpwatchd::notify::{self, WebhookDispatcher};
use xpwatchd::reconcile::ReconcileLoop;
use xpwatchd::registry::TrackerRegistry;
use xpwatchd::routes;
use xpwatchd::SharedStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("xpwatchd v{} starting", VERSION);

    let config = WatchConfig::load();
    let store: SharedStore = Arc::new(RwLock::new(SubjectStore::open(
        config.state_file.clone(),
        config.watch_file.clone(),
    )));
    let client = Arc::new(CharacterClient::new(&config.api_base, config.fetch_timeout())?);

    let (notifier, rx) = notify::channel();
    let dispatcher = WebhookDispatcher::new(&config.webhook_url)?;
    tokio::spawn(dispatcher.clone().run(rx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = ReconcileLoop::new(
        store.clone(),
        client.clone(),
        notifier.clone(),
        dispatcher,
        config.poll_interval(),
        shutdown_rx,
    );
    let loop_task = tokio::spawn(engine.run());

    let registry = TrackerRegistry::new();
    let commands = Arc::new(Commands::new(
        store.clone(),
        client,
        notifier,
        registry,
        config.tracker_tick(),
        config.tracker_duration(),
    ));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Command API listening on {}", config.bind_addr);
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, routes::router(commands)).await {
            error!("Command API server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down gracefully");

    let _ = shutdown_tx.send(true);
    let _ = loop_task.await;
    server.abort();

    if let Err(e) = store.read().await.save_all() {
        error!("Final state save failed: {}", e);
    }

    Ok(())
}
