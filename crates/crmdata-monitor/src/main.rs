//! CRM data-access monitor binary.
//!
//! Keeps the configured documents under live subscription, runs background
//! maintenance and periodically reports daily quota usage.

mod config;
mod watch;

use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crmdata_access::{AccessConfig, DataAccess};
use crmdata_firestore::FirestoreClient;
use crmdata_storage::FileKvStore;

use crate::config::MonitorConfig;
use crate::watch::Watchlist;

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        eprintln!("rustls crypto provider already installed");
    }

    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting crmdata-monitor");

    if let Err(e) = run().await {
        error!("Monitor error: {:#}", e);
        std::process::exit(1);
    }

    info!("Monitor shutdown complete");
}

fn init_tracing() {
    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let mut env_filter = EnvFilter::from_default_env();
    for directive in [
        "crmdata_access=info",
        "crmdata_firestore=info",
        "crmdata_monitor=info",
        "reqwest=warn",
    ] {
        if let Ok(directive) = directive.parse() {
            env_filter = env_filter.add_directive(directive);
        }
    }

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

async fn run() -> anyhow::Result<()> {
    let config = MonitorConfig::from_env();
    let access_config = AccessConfig::from_env();
    info!("Monitor config: {:?}", config);
    info!("Access config: {:?}", access_config);

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Serving metrics on {}", addr);
    }

    let client = FirestoreClient::from_env()
        .await
        .context("Failed to create Firestore client")?;
    let kv = FileKvStore::open(config.data_dir.clone())
        .with_context(|| format!("Failed to open data directory {}", config.data_dir.display()))?;

    let access = DataAccess::new(access_config, Arc::new(client), Arc::new(kv));
    access.start();

    let mut watchlist = Watchlist::new(config.watch.clone());
    let opened = watchlist.ensure(&access);
    info!(watched = config.watch.len(), opened, "Watching documents");

    let mut ticker = interval(config.stats_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reopened = watchlist.ensure(&access);
                if reopened > 0 {
                    info!(reopened, "Resubscribed watched documents");
                }
                let stats = access.usage_stats();
                info!(
                    reads = stats.reads,
                    writes = stats.writes,
                    deletes = stats.deletes,
                    in_backoff = stats.in_backoff,
                    pending_writes = access.pending_writes(),
                    subscriptions = access.active_subscriptions(),
                    "Daily usage"
                );
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Received shutdown signal");
                break;
            }
        }
    }

    watchlist.unsubscribe_all();
    let outcome = access.shutdown().await;
    info!(?outcome, "Final flush");
    Ok(())
}
