//! Sync engine: drains pending orders to the order API.
//!
//! Orders are submitted strictly one at a time. Each failure moves the order
//! to `failed` and, when the failure is retryable, waits
//! `min(cap, base * 2^attempts)` (or the server's `Retry-After`, if longer,
//! up to the same cap) before the next order so a server that is down is not
//! hammered. Two drains may overlap; the `sending` state makes the second one
//! skip whatever the first one has in flight, and an order only starts while
//! its queue entry is live.
//!
//! [`start_sync_loop`] runs the engine in the background: a periodic tick,
//! wake messages from the cache agent, connectivity transitions and persisted
//! deferred-sync registrations all trigger a drain.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, ReconnectOutcome};
use crate::api::{ConnectivityProbe, OrderPayload, OrderSubmitter, SubmitError};
use crate::models::{Order, OrderStatus, SyncQueueItem, ENTITY_ORDER};
use crate::orders::{OrderError, OrderResult, OrderService};
use crate::store::SYNC_QUEUE_TABLE;

/// Capacity of the engine's wake channel.
pub const SYNC_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub submit_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            submit_timeout: Duration::from_secs(30),
        }
    }
}

/// `min(cap, base * 2^attempts)`, saturating at `cap`.
pub fn backoff_delay(attempts: u32, base: Duration, cap: Duration) -> Duration {
    2u32.checked_pow(attempts)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(cap, |delay| delay.min(cap))
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Outcome of one [`SyncEngine::drain`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
    /// Failures that left the order without automatic retries.
    pub exhausted: usize,
    /// Orders another drain or a user action got to first.
    pub skipped: usize,
    #[serde(skip)]
    pub backoffs: Vec<Duration>,
}

/// Snapshot of the sync state for UI consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub ingresado: usize,
    pub sending: usize,
    pub sent: usize,
    pub failed: usize,
    pub queue_depth: usize,
    /// Failed orders with no queued retry; they need a manual retry.
    pub exhausted: usize,
    pub last_drain_at: Option<DateTime<Utc>>,
}

/// Messages accepted by the background sync loop.
#[derive(Debug)]
pub enum SyncMessage {
    /// Drain as soon as the network allows.
    Wake { reason: String },
    /// Reply with a status snapshot.
    Status {
        reply: oneshot::Sender<OrderResult<SyncStatus>>,
    },
}

pub struct SyncEngine {
    orders: OrderService,
    submitter: Arc<dyn OrderSubmitter>,
    sleeper: Arc<dyn Sleeper>,
    config: SyncConfig,
    shutdown: CancellationToken,
    last_drain_at: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("max_retries", &self.orders.max_retries())
            .finish()
    }
}

impl SyncEngine {
    pub fn new(
        orders: OrderService,
        submitter: Arc<dyn OrderSubmitter>,
        sleeper: Arc<dyn Sleeper>,
        config: SyncConfig,
    ) -> Self {
        Self {
            orders,
            submitter,
            sleeper,
            config,
            shutdown: CancellationToken::new(),
            last_drain_at: Mutex::new(None),
        }
    }

    /// Stop drains at the next order boundary or backoff wait when `token`
    /// is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn orders(&self) -> &OrderService {
        &self.orders
    }

    /// Add work to the queue. An entity already queued keeps its entry so its
    /// retry count is not reset. Returns `true` when a new entry was written.
    pub fn enqueue(&self, item: SyncQueueItem) -> OrderResult<bool> {
        let key = item.key();
        let written = self.orders.db().transaction(|tx| -> OrderResult<bool> {
            if tx.get::<SyncQueueItem>(SYNC_QUEUE_TABLE, &key)?.is_some() {
                return Ok(false);
            }
            tx.put(SYNC_QUEUE_TABLE, &key, &item)?;
            Ok(true)
        })?;
        if written {
            debug!(entity = %key, "Enqueued for sync");
        }
        Ok(written)
    }

    /// Recover orders a previous process left in `sending`. Run once before
    /// the first drain.
    pub fn recover(&self) -> OrderResult<usize> {
        let recovered = self.orders.recover_interrupted()?;
        if recovered > 0 {
            warn!(recovered, "Recovered interrupted submissions");
        }
        Ok(recovered)
    }

    /// Submit every pending order, one at a time.
    ///
    /// Storage faults abort the drain and are returned; submission failures
    /// are recorded on the order and the drain moves on.
    pub async fn drain(&self) -> OrderResult<DrainReport> {
        let pending = self.orders.pending_submissions()?;
        let mut report = DrainReport::default();

        if !pending.is_empty() {
            info!(pending = pending.len(), "Draining sync queue");
        }

        for (entry, order) in pending {
            if self.shutdown.is_cancelled() {
                info!("Drain interrupted by shutdown");
                break;
            }

            // The snapshot may be stale: a concurrent drain can have sent,
            // rejected or exhausted this order since it was read.
            let order = match self.orders.begin_queued_submit(&order.local_id) {
                Ok(order) => order,
                Err(
                    OrderError::AlreadySending(_)
                    | OrderError::NotQueued(_)
                    | OrderError::InvalidTransition { .. }
                    | OrderError::NotFound(_),
                ) => {
                    debug!(order_id = %order.local_id, "Order no longer eligible, skipping");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            report.attempted += 1;
            debug!(
                order_id = %order.local_id,
                attempts = order.attempts,
                queue_retries = entry.retries,
                "Submitting order"
            );

            match self.submit(&order).await {
                Ok(receipt) => {
                    self.orders.mark_sent(&order.local_id, &receipt.server_id)?;
                    report.sent += 1;
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    let record =
                        self.orders
                            .mark_failed(&order.local_id, &err.to_string(), retryable)?;
                    report.failed += 1;
                    if !record.will_retry {
                        report.exhausted += 1;
                    }
                    if retryable {
                        // A server-requested Retry-After stretches the wait,
                        // still bounded by the cap.
                        let delay = backoff_delay(
                            record.order.attempts,
                            self.config.backoff_base,
                            self.config.backoff_cap,
                        )
                        .max(err.retry_after().unwrap_or_default())
                        .min(self.config.backoff_cap);
                        report.backoffs.push(delay);
                        debug!(order_id = %order.local_id, delay_ms = delay.as_millis() as u64, "Backing off");
                        tokio::select! {
                            _ = self.sleeper.sleep(delay) => {}
                            _ = self.shutdown.cancelled() => {
                                info!("Drain interrupted by shutdown");
                                break;
                            }
                        }
                    }
                }
            }
        }

        if let Ok(mut guard) = self.last_drain_at.lock() {
            *guard = Some(Utc::now());
        }
        if report.attempted > 0 {
            info!(
                sent = report.sent,
                failed = report.failed,
                skipped = report.skipped,
                "Drain complete"
            );
        }
        Ok(report)
    }

    async fn submit(&self, order: &Order) -> Result<crate::api::SubmitReceipt, SubmitError> {
        let payload = OrderPayload::from_order(order);
        let timeout = self.config.submit_timeout;
        match tokio::time::timeout(timeout, self.submitter.submit(&payload)).await {
            Ok(result) => result,
            Err(_) => Err(SubmitError::Timeout(timeout)),
        }
    }

    pub fn status(&self) -> OrderResult<SyncStatus> {
        let orders = self.orders.list_orders()?;
        let queue: Vec<SyncQueueItem> = self
            .orders
            .db()
            .query(SYNC_QUEUE_TABLE, |entry: &SyncQueueItem| {
                entry.entity_type == ENTITY_ORDER
            })?;

        let mut status = SyncStatus {
            queue_depth: queue.len(),
            last_drain_at: self.last_drain_at.lock().ok().and_then(|g| *g),
            ..Default::default()
        };
        for order in &orders {
            match order.status {
                OrderStatus::Ingresado => status.ingresado += 1,
                OrderStatus::Sending => status.sending += 1,
                OrderStatus::Sent => status.sent += 1,
                OrderStatus::Failed => {
                    status.failed += 1;
                    if !queue.iter().any(|e| e.entity_id == order.local_id) {
                        status.exhausted += 1;
                    }
                }
            }
        }
        Ok(status)
    }
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

async fn next_message(rx: &mut Option<mpsc::Receiver<SyncMessage>>) -> Option<SyncMessage> {
    match rx.as_mut() {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

/// Start the background sync loop. Spawns a tokio task that drains the
/// engine every `interval` while online, on wake messages, and when the agent
/// reports a reconnect. Stops when `shutdown` is cancelled.
pub fn start_sync_loop(
    engine: Arc<SyncEngine>,
    agent: Arc<Agent>,
    probe: Arc<dyn ConnectivityProbe>,
    rx: mpsc::Receiver<SyncMessage>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Sync loop started (interval: {}s)", interval.as_secs_f32());
        if let Err(e) = engine.recover() {
            warn!(error = %e, "Interrupted submission recovery failed");
        }

        let mut rx = Some(rx);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut previous_online: Option<bool> = None;

        loop {
            let trigger = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => "tick".to_string(),
                message = next_message(&mut rx) => match message {
                    Some(SyncMessage::Wake { reason }) => reason,
                    Some(SyncMessage::Status { reply }) => {
                        let _ = reply.send(engine.status());
                        continue;
                    }
                    None => {
                        debug!("Sync channel closed; continuing on ticks only");
                        rx = None;
                        continue;
                    }
                },
            };

            let online = probe.is_online().await;
            if !online {
                if previous_online != Some(false) {
                    info!("Network offline; deferring sync and keeping queue pending");
                }
                previous_online = Some(false);
                continue;
            }

            if previous_online == Some(false) {
                info!("Network restored; resuming queued sync");
                match agent.on_reconnect() {
                    ReconnectOutcome::Registered => debug!("Deferred sync registered"),
                    ReconnectOutcome::WokeEngine => debug!("Sync engine woken"),
                    ReconnectOutcome::NoActiveEngine => {
                        debug!("Reconnect had no engine to wake")
                    }
                }
            }
            previous_online = Some(true);

            // Consume the registration on every online cycle so reconnects
            // never pile up. A pending one counts as this cycle's trigger and
            // pushes the next periodic drain a full interval out.
            let trigger = match agent.take_deferred_sync() {
                Ok(true) => {
                    info!("Running deferred sync");
                    ticker.reset();
                    "deferred-sync".to_string()
                }
                Ok(false) => trigger,
                Err(e) => {
                    warn!(error = %e, "Reading deferred sync registrations failed");
                    trigger
                }
            };

            debug!(trigger = %trigger, "Sync cycle");
            if let Err(e) = engine.drain().await {
                warn!(error = %e, "Sync drain failed");
            }
        }

        info!("Sync loop stopped");
    })
}
