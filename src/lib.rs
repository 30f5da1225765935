//! Preventa - offline order capture and synchronization engine
//!
//! Field sellers capture orders on a device that is often offline. Orders are
//! committed to a local SQLite store first, submitted to the order server by
//! a background sync loop with bounded exponential backoff, and never lost
//! across restarts. A caching dispatch agent serves catalog reads from
//! versioned cache tiers while the network is unavailable.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod agent;
pub mod api;
pub mod composition;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod events;
pub mod models;
pub mod orders;
pub mod storage;
pub mod store;
pub mod sync;

use crate::agent::{Agent, StoreDeferredSync};
use crate::api::{HttpConnectivityProbe, HttpFetcher, HttpOrderSubmitter};
use crate::config::AppConfig;
use crate::db::DbState;
use crate::events::{OrderEvent, OrderEvents};
use crate::orders::OrderService;
use crate::sync::{SyncEngine, TokioSleeper, SYNC_CHANNEL_CAPACITY};

const DEFAULT_LOG_FILTER: &str = "info,preventa_sync=debug";

/// Install the global subscriber: console plus a daily rolling file under
/// `log_dir`. Keep the returned guard alive; dropping it flushes the file
/// writer.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs(log_dir);
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("failed to create log directory {}: {e}", log_dir.display());
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

/// Open the database and resolve configuration for `data_dir`.
pub fn open(data_dir: &Path) -> anyhow::Result<(Arc<DbState>, AppConfig)> {
    let db = Arc::new(
        db::init(data_dir)
            .with_context(|| format!("failed to open database in {}", data_dir.display()))?,
    );
    let config = AppConfig::load(data_dir, &db).context("failed to resolve configuration")?;
    Ok((db, config))
}

/// Build the sync engine against the configured order server.
pub fn build_engine(
    db: Arc<DbState>,
    config: &AppConfig,
    events: OrderEvents,
) -> anyhow::Result<SyncEngine> {
    let orders = OrderService::new(db, events, config.max_retries);
    let submitter = HttpOrderSubmitter::new(
        &config.api_url,
        config.api_token.clone(),
        config.submit_timeout,
    )
    .context("failed to build order submission client")?;
    Ok(SyncEngine::new(
        orders,
        Arc::new(submitter),
        Arc::new(TokioSleeper),
        config.sync_config(),
    ))
}

/// Log order lifecycle events until the hub is dropped or shutdown fires.
fn spawn_event_logger(events: &OrderEvents, shutdown: CancellationToken) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(OrderEvent::Created { order }) => {
                    info!(order_id = %order.local_id, total = order.total, "Order captured")
                }
                Ok(OrderEvent::StatusChanged { from, order }) => info!(
                    order_id = %order.local_id,
                    from = %from,
                    to = %order.status,
                    attempts = order.attempts,
                    "Order status changed"
                ),
                Ok(OrderEvent::Cancelled { local_id }) => {
                    info!(order_id = %local_id, "Order cancelled")
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event logger lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Run the background runtime until Ctrl-C.
pub async fn run(data_dir: PathBuf) -> anyhow::Result<()> {
    info!("Starting Preventa sync v{}", env!("CARGO_PKG_VERSION"));
    let (db, config) = open(&data_dir)?;
    info!(
        api_url = %config.api_url,
        vendor_id = config.vendor_id.as_deref().unwrap_or("-"),
        data_dir = %data_dir.display(),
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let events = OrderEvents::new();
    spawn_event_logger(&events, shutdown.clone());

    let engine = Arc::new(
        build_engine(db.clone(), &config, events)?.with_shutdown(shutdown.clone()),
    );

    let (tx, rx) = mpsc::channel(SYNC_CHANNEL_CAPACITY);
    let fetcher =
        HttpFetcher::new(config.api_token.clone()).context("failed to build fetch client")?;
    let agent = Arc::new(
        Agent::new(db.clone(), Arc::new(fetcher), config.agent_config())
            .with_registrar(Arc::new(StoreDeferredSync::new(db.clone())))
            .with_engine_channel(tx),
    );
    if let Err(e) = agent.activate() {
        warn!(error = %e, "Cache activation failed; continuing with existing tiers");
    }

    let probe = HttpConnectivityProbe::new(&config.api_url)
        .context("failed to build connectivity probe")?;
    let handle = sync::start_sync_loop(
        engine.clone(),
        agent,
        Arc::new(probe),
        rx,
        config.sync_interval,
        shutdown.clone(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    shutdown.cancel();

    if let Err(e) = handle.await {
        warn!(error = %e, "Sync loop task ended abnormally");
    }
    match engine.status() {
        Ok(status) => info!(
            pending = status.queue_depth,
            failed = status.failed,
            "Sync stopped"
        ),
        Err(e) => warn!(error = %e, "Could not read final sync status"),
    }
    Ok(())
}
