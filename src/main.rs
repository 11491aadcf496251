//! Flarepath - Uptime Monitoring Engine
//!
//! Probes HTTP(S) endpoints on aligned intervals and turns raw results into
//! debounced state transitions, outage records, and alert decisions.

mod config;
mod db;
mod engine;
mod notify;
mod probe;

use config::Config;
use db::Store;
use engine::Engine;
use notify::NotificationEvent;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("flarepath=info".parse()?))
        .init();

    // Load configuration
    let cfg = Config::load();
    tracing::info!("Starting Flarepath...");
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Notification sink; delivery transports hang off this queue.
    let (notify_tx, notify_rx) = mpsc::channel(1000);
    tokio::spawn(drain_notifications(notify_rx));

    // Add a sample monitor if none exist
    let monitors = store.list_monitors()?;
    if monitors.is_empty() {
        tracing::info!("Adding sample monitor: Example");
        let mut monitor = db::MonitorConfig {
            name: "Example".to_string(),
            url: "https://example.com".to_string(),
            ..Default::default()
        };
        store.add_monitor(&mut monitor)?;
    }

    // Create and start the engine
    let engine = Arc::new(Engine::new(store, notify_tx, &cfg)?);
    engine.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    engine.stop().await;

    Ok(())
}

/// Stand-in notifier: logs everything the engine decided to alert on.
async fn drain_notifications(mut rx: mpsc::Receiver<NotificationEvent>) {
    while let Some(event) = rx.recv().await {
        tracing::info!(
            "Notification [{}] {} ({}): {}",
            event.kind,
            event.monitor_name,
            event.monitor_url,
            event.message
        );
    }
}
