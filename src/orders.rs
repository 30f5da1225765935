//! Order state machine.
//!
//! Owns every write to the `orders` table. Each transition loads the order,
//! checks the current status, and writes the order together with its sync
//! queue entry in one store transaction; the change is published on
//! [`OrderEvents`] only after the commit.
//!
//! ```text
//! create ──> ingresado ──begin_submit──> sending ──mark_sent──> sent
//!                ^                          │
//!                └──(retry)── failed <──mark_failed
//! ```

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::composition::resolve_line_items;
use crate::events::{OrderEvent, OrderEvents};
use crate::models::{
    queue_key, round_money, NewOrder, Order, OrderItem, OrderStatus, SyncQueueItem, ENTITY_ORDER,
};
use crate::store::{DbState, StoreError, StoreTx, ORDERS_TABLE, SYNC_QUEUE_TABLE};

/// Error recorded on orders found mid-submission after a restart.
pub const INTERRUPTED_ERROR: &str = "submission interrupted";

#[derive(Debug, Error)]
pub enum OrderError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("order not found: {0}")]
    NotFound(String),

    #[error("order {0} is already being submitted")]
    AlreadySending(String),

    #[error("order {0} has no pending automatic submission")]
    NotQueued(String),

    #[error("cannot {action} order {local_id} while {status}")]
    InvalidTransition {
        local_id: String,
        status: OrderStatus,
        action: &'static str,
    },

    #[error("order {local_id} cannot be cancelled while {status}")]
    CancelRefused {
        local_id: String,
        status: OrderStatus,
    },

    #[error("order {0} was already sent; cancelling sent orders is not supported")]
    CancelUnsupported(String),

    #[error("discount must be between 0 and 100, got {0}")]
    InvalidDiscount(f64),

    #[error("invalid order: {0}")]
    Invalid(String),
}

pub type OrderResult<T> = Result<T, OrderError>;

/// Result of recording a failed submission.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub order: Order,
    /// The order still has a queue entry and will be picked up by a later drain.
    pub will_retry: bool,
}

/// `round(sum(subtotal) * (1 - discount / 100), 2)`.
pub fn compute_total(items: &[OrderItem], discount_percent: f64) -> f64 {
    let gross: f64 = items.iter().map(OrderItem::subtotal).sum();
    round_money(gross * (1.0 - discount_percent / 100.0))
}

fn validate_new_order(new_order: &NewOrder) -> OrderResult<()> {
    let discount = new_order.discount_percent;
    if !discount.is_finite() || !(0.0..=100.0).contains(&discount) {
        return Err(OrderError::InvalidDiscount(discount));
    }
    if new_order.customer_id.trim().is_empty() {
        return Err(OrderError::Invalid("customerId is required".into()));
    }
    for item in &new_order.items {
        if !item.cantidad.is_finite() || item.cantidad < 0.0 {
            return Err(OrderError::Invalid(format!(
                "item {} has invalid cantidad {}",
                item.id, item.cantidad
            )));
        }
        if !item.subtotal().is_finite() {
            return Err(OrderError::Invalid(format!(
                "item {} has a non-finite subtotal",
                item.id
            )));
        }
    }
    Ok(())
}

/// Give id-less lines a positional id and reject duplicates.
fn normalize_item_ids(items: Vec<OrderItem>) -> OrderResult<Vec<OrderItem>> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(items.len());
    for (position, mut item) in items.into_iter().enumerate() {
        if item.id.trim().is_empty() {
            item.id = format!("{}", position + 1);
        }
        if !seen.insert(item.id.clone()) {
            return Err(OrderError::Invalid(format!("duplicate item id {}", item.id)));
        }
        normalized.push(item);
    }
    Ok(normalized)
}

/// `ingresado | failed` -> `sending` inside `tx`. Returns the prior status.
fn start_submission(tx: &StoreTx<'_>, local_id: &str) -> OrderResult<(OrderStatus, Order)> {
    let mut order = load(tx, local_id)?;
    let from = order.status;
    if from == OrderStatus::Sending {
        return Err(OrderError::AlreadySending(local_id.to_string()));
    }
    if !from.can_begin_submit() {
        return Err(OrderError::InvalidTransition {
            local_id: local_id.to_string(),
            status: from,
            action: "submit",
        });
    }
    order.status = OrderStatus::Sending;
    order.attempts = order.attempts.saturating_add(1);
    order.modified_at = Utc::now();
    tx.put(ORDERS_TABLE, local_id, &order)?;
    Ok((from, order))
}

fn load(tx: &StoreTx<'_>, local_id: &str) -> OrderResult<Order> {
    tx.get::<Order>(ORDERS_TABLE, local_id)?
        .ok_or_else(|| OrderError::NotFound(local_id.to_string()))
}

/// Bump the retry counter of an order's queue entry, dropping the entry when
/// it is exhausted. Returns whether the entry is still queued.
fn record_queue_failure(
    tx: &StoreTx<'_>,
    local_id: &str,
    error: &str,
    retryable: bool,
    max_retries: u32,
) -> OrderResult<bool> {
    let key = queue_key(ENTITY_ORDER, local_id);
    let Some(mut entry) = tx.get::<SyncQueueItem>(SYNC_QUEUE_TABLE, &key)? else {
        return Ok(false);
    };
    entry.retries = entry.retries.saturating_add(1);
    entry.last_error = Some(error.to_string());
    if !retryable || entry.retries > max_retries {
        tx.delete(SYNC_QUEUE_TABLE, &key)?;
        return Ok(false);
    }
    tx.put(SYNC_QUEUE_TABLE, &key, &entry)?;
    Ok(true)
}

/// Lifecycle owner for orders. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OrderService {
    db: Arc<DbState>,
    events: OrderEvents,
    max_retries: u32,
}

impl OrderService {
    pub fn new(db: Arc<DbState>, events: OrderEvents, max_retries: u32) -> Self {
        Self {
            db,
            events,
            max_retries,
        }
    }

    pub fn events(&self) -> &OrderEvents {
        &self.events
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get_order(&self, local_id: &str) -> OrderResult<Order> {
        self.db
            .get::<Order>(ORDERS_TABLE, local_id)?
            .ok_or_else(|| OrderError::NotFound(local_id.to_string()))
    }

    /// Every order, oldest first.
    pub fn list_orders(&self) -> OrderResult<Vec<Order>> {
        let mut orders: Vec<Order> = self.db.query(ORDERS_TABLE, |_: &Order| true)?;
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(orders)
    }

    pub fn find_by_server_id(&self, server_id: &str) -> OrderResult<Option<Order>> {
        let mut found: Vec<Order> = self.db.query(ORDERS_TABLE, |order: &Order| {
            order.server_id.as_deref() == Some(server_id)
        })?;
        Ok(found.pop())
    }

    /// Queue entries with their orders that a drain may submit now, oldest
    /// entry first. Orders already `sending` or `sent` are excluded.
    pub fn pending_submissions(&self) -> OrderResult<Vec<(SyncQueueItem, Order)>> {
        let mut entries: Vec<SyncQueueItem> =
            self.db.query(SYNC_QUEUE_TABLE, |entry: &SyncQueueItem| {
                entry.entity_type == ENTITY_ORDER
            })?;
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let mut pending = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.retries > self.max_retries {
                continue;
            }
            match self.db.get::<Order>(ORDERS_TABLE, &entry.entity_id)? {
                Some(order) if order.status.can_begin_submit() => pending.push((entry, order)),
                Some(order) => {
                    debug!(order_id = %order.local_id, status = %order.status, "Skipping queued order not eligible for submission");
                }
                None => {
                    warn!(order_id = %entry.entity_id, "Sync queue entry without order");
                }
            }
        }
        Ok(pending)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// create: persist a new `ingresado` order and enqueue it for sync.
    ///
    /// A `localId` that already exists returns the stored order unchanged, so
    /// a retried create never duplicates an order.
    pub fn create_order(&self, new_order: NewOrder) -> OrderResult<Order> {
        validate_new_order(&new_order)?;
        let items = normalize_item_ids(new_order.items)?;
        // Persist the resolved sequence so stored and submitted lines agree.
        let items = resolve_line_items(&items).items();

        let local_id = new_order
            .local_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let order = Order {
            local_id: local_id.clone(),
            server_id: None,
            customer_id: new_order.customer_id.trim().to_string(),
            total: compute_total(&items, new_order.discount_percent),
            items,
            discount_percent: new_order.discount_percent,
            status: OrderStatus::Ingresado,
            attempts: 0,
            last_error: None,
            created_at: now,
            modified_at: now,
            synced: false,
        };

        let created = self.db.transaction(|tx| -> OrderResult<Option<Order>> {
            if let Some(existing) = tx.get::<Order>(ORDERS_TABLE, &local_id)? {
                return Ok(Some(existing));
            }
            tx.put(ORDERS_TABLE, &local_id, &order)?;
            let entry = SyncQueueItem::for_order(&local_id);
            tx.put(SYNC_QUEUE_TABLE, &entry.key(), &entry)?;
            Ok(None)
        })?;

        if let Some(existing) = created {
            info!(order_id = %local_id, "Order create deduplicated via localId");
            return Ok(existing);
        }

        info!(
            order_id = %local_id,
            items = order.items.len(),
            total = order.total,
            "Order created"
        );
        self.events.publish(OrderEvent::Created {
            order: order.clone(),
        });
        Ok(order)
    }

    /// begin-submit: `ingresado | failed` -> `sending`, `attempts += 1`.
    pub fn begin_submit(&self, local_id: &str) -> OrderResult<Order> {
        let (from, order) = self.db.transaction(|tx| start_submission(tx, local_id))?;
        self.submission_started(from, &order);
        Ok(order)
    }

    /// begin-submit for automatic drains: additionally requires a live queue
    /// entry within the retry budget, checked in the same transaction.
    ///
    /// A drain works from a snapshot of the queue; a concurrent drain may
    /// have rejected or exhausted the order since. Those orders wait for a
    /// manual [`retry_order`](Self::retry_order).
    pub fn begin_queued_submit(&self, local_id: &str) -> OrderResult<Order> {
        let max_retries = self.max_retries;
        let (from, order) = self.db.transaction(|tx| -> OrderResult<(OrderStatus, Order)> {
            let key = queue_key(ENTITY_ORDER, local_id);
            match tx.get::<SyncQueueItem>(SYNC_QUEUE_TABLE, &key)? {
                Some(entry) if entry.retries <= max_retries => start_submission(tx, local_id),
                _ => Err(OrderError::NotQueued(local_id.to_string())),
            }
        })?;
        self.submission_started(from, &order);
        Ok(order)
    }

    fn submission_started(&self, from: OrderStatus, order: &Order) {
        debug!(order_id = %order.local_id, attempts = order.attempts, "Order submission started");
        self.events.publish(OrderEvent::StatusChanged {
            from,
            order: order.clone(),
        });
    }

    /// submit-success: `sending` -> `sent`. The first server id sticks.
    pub fn mark_sent(&self, local_id: &str, server_id: &str) -> OrderResult<Order> {
        let order = self.db.transaction(|tx| -> OrderResult<Order> {
            let mut order = load(tx, local_id)?;
            if order.status != OrderStatus::Sending {
                return Err(OrderError::InvalidTransition {
                    local_id: local_id.to_string(),
                    status: order.status,
                    action: "complete submission of",
                });
            }
            match order.server_id.as_deref() {
                None => order.server_id = Some(server_id.to_string()),
                Some(existing) if existing != server_id => {
                    warn!(
                        order_id = %local_id,
                        server_id = %existing,
                        ignored_server_id = %server_id,
                        "Server id already assigned; keeping the first one"
                    );
                }
                Some(_) => {}
            }
            order.status = OrderStatus::Sent;
            order.synced = true;
            order.last_error = None;
            order.modified_at = Utc::now();
            tx.put(ORDERS_TABLE, local_id, &order)?;
            tx.delete(SYNC_QUEUE_TABLE, &queue_key(ENTITY_ORDER, local_id))?;
            Ok(order)
        })?;

        info!(
            order_id = %local_id,
            server_id = order.server_id.as_deref().unwrap_or_default(),
            attempts = order.attempts,
            "Order synced"
        );
        self.events.publish(OrderEvent::StatusChanged {
            from: OrderStatus::Sending,
            order: order.clone(),
        });
        Ok(order)
    }

    /// submit-failure: `sending` -> `failed` with the failure reason.
    ///
    /// Non-retryable failures and exhausted retries drop the queue entry; the
    /// order itself always stays visible as `failed`.
    pub fn mark_failed(
        &self,
        local_id: &str,
        error: &str,
        retryable: bool,
    ) -> OrderResult<FailureRecord> {
        let max_retries = self.max_retries;
        let record = self.db.transaction(|tx| -> OrderResult<FailureRecord> {
            let mut order = load(tx, local_id)?;
            if order.status != OrderStatus::Sending {
                return Err(OrderError::InvalidTransition {
                    local_id: local_id.to_string(),
                    status: order.status,
                    action: "fail submission of",
                });
            }
            order.status = OrderStatus::Failed;
            order.last_error = Some(error.to_string());
            order.modified_at = Utc::now();
            tx.put(ORDERS_TABLE, local_id, &order)?;
            let will_retry = record_queue_failure(tx, local_id, error, retryable, max_retries)?;
            Ok(FailureRecord { order, will_retry })
        })?;

        if record.will_retry {
            warn!(
                order_id = %local_id,
                attempts = record.order.attempts,
                error = %error,
                "Order submission failed, will retry"
            );
        } else {
            warn!(
                order_id = %local_id,
                attempts = record.order.attempts,
                retryable,
                error = %error,
                "Order submission failed, automatic retries stopped"
            );
        }
        self.events.publish(OrderEvent::StatusChanged {
            from: OrderStatus::Sending,
            order: record.order.clone(),
        });
        Ok(record)
    }

    /// cancel: only never-submitted orders are deleted. In-flight and failed
    /// orders are refused; sent orders are unsupported.
    pub fn cancel_order(&self, local_id: &str) -> OrderResult<()> {
        self.db.transaction(|tx| -> OrderResult<()> {
            let order = load(tx, local_id)?;
            if order.synced {
                return Err(OrderError::CancelUnsupported(local_id.to_string()));
            }
            match order.status {
                OrderStatus::Ingresado => {
                    tx.delete(ORDERS_TABLE, local_id)?;
                    tx.delete(SYNC_QUEUE_TABLE, &queue_key(ENTITY_ORDER, local_id))?;
                    Ok(())
                }
                OrderStatus::Sent => Err(OrderError::CancelUnsupported(local_id.to_string())),
                status => Err(OrderError::CancelRefused {
                    local_id: local_id.to_string(),
                    status,
                }),
            }
        })?;

        info!(order_id = %local_id, "Order cancelled");
        self.events.publish(OrderEvent::Cancelled {
            local_id: local_id.to_string(),
        });
        Ok(())
    }

    /// Manual retry of a `failed` order: gives it a fresh queue entry.
    pub fn retry_order(&self, local_id: &str) -> OrderResult<Order> {
        let order = self.db.transaction(|tx| -> OrderResult<Order> {
            let mut order = load(tx, local_id)?;
            if order.status != OrderStatus::Failed {
                return Err(OrderError::InvalidTransition {
                    local_id: local_id.to_string(),
                    status: order.status,
                    action: "retry",
                });
            }
            order.modified_at = Utc::now();
            tx.put(ORDERS_TABLE, local_id, &order)?;
            let entry = SyncQueueItem::for_order(local_id);
            tx.put(SYNC_QUEUE_TABLE, &entry.key(), &entry)?;
            Ok(order)
        })?;

        info!(order_id = %local_id, attempts = order.attempts, "Order re-queued by user");
        self.events.publish(OrderEvent::StatusChanged {
            from: OrderStatus::Failed,
            order: order.clone(),
        });
        Ok(order)
    }

    /// Move orders stranded in `sending` by a previous process to `failed`.
    /// The interrupted attempt counts against the retry budget.
    pub fn recover_interrupted(&self) -> OrderResult<usize> {
        let max_retries = self.max_retries;
        let recovered = self.db.transaction(|tx| -> OrderResult<Vec<Order>> {
            let stranded: Vec<Order> = tx.query(ORDERS_TABLE, |order: &Order| {
                order.status == OrderStatus::Sending
            })?;
            let mut recovered = Vec::with_capacity(stranded.len());
            for mut order in stranded {
                order.status = OrderStatus::Failed;
                order.last_error = Some(INTERRUPTED_ERROR.to_string());
                order.modified_at = Utc::now();
                tx.put(ORDERS_TABLE, &order.local_id, &order)?;
                record_queue_failure(tx, &order.local_id, INTERRUPTED_ERROR, true, max_retries)?;
                recovered.push(order);
            }
            Ok(recovered)
        })?;

        for order in &recovered {
            warn!(order_id = %order.local_id, "Recovered order interrupted mid-submission");
            self.events.publish(OrderEvent::StatusChanged {
                from: OrderStatus::Sending,
                order: order.clone(),
            });
        }
        Ok(recovered.len())
    }
}
