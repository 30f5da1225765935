//! Order, order item and sync queue records.
//!
//! Field names serialize in camelCase and keep the Spanish vocabulary used by
//! the order API (`productoId`, `cantidad`, `esBonificacion`, ...), so a
//! persisted order is also a valid submission document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sync queue entity type for orders.
pub const ENTITY_ORDER: &str = "order";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Created locally, never attempted.
    Ingresado,
    /// Submission in flight.
    Sending,
    /// Accepted by the server. Terminal.
    Sent,
    /// Last submission attempt failed.
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Ingresado => "ingresado",
            OrderStatus::Sending => "sending",
            OrderStatus::Sent => "sent",
            OrderStatus::Failed => "failed",
        }
    }

    /// Statuses from which a submission may begin.
    pub fn can_begin_submit(&self) -> bool {
        matches!(self, OrderStatus::Ingresado | OrderStatus::Failed)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single order line as captured by the seller.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    /// Stable within the order.
    pub id: String,
    pub producto_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descripcion: Option<String>,
    pub cantidad: f64,
    pub precio_unitario: f64,
    /// Explicit subtotal override; `cantidad * precioUnitario` otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtotal: Option<f64>,

    // Combo / kit linkage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combo_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kit_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combo_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combo_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combo_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combo_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combo_pack_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combo_packs_qty: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_code: Option<String>,

    // Bonus linkage
    #[serde(default)]
    pub es_bonificacion: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_item_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promo_bonificacion_id: Option<String>,

    // Classification, only used for deterministic ordering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codigo_proveedor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nombre_proveedor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codigo_linea: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nombre_linea: Option<String>,

    /// Assigned by the composition resolver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
}

/// Trimmed, non-empty value of an optional text field.
pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl OrderItem {
    pub fn subtotal(&self) -> f64 {
        self.subtotal
            .unwrap_or(self.cantidad * self.precio_unitario)
    }

    /// Belongs to a combo or kit purchase.
    pub fn is_combo_linked(&self) -> bool {
        non_empty(&self.combo_id).is_some()
            || non_empty(&self.kit_id).is_some()
            || non_empty(&self.combo_code).is_some()
            || non_empty(&self.combo_type).is_some()
    }

    pub fn provider_key(&self) -> &str {
        non_empty(&self.codigo_proveedor)
            .or_else(|| non_empty(&self.nombre_proveedor))
            .unwrap_or("")
    }

    pub fn line_key(&self) -> &str {
        non_empty(&self.codigo_linea)
            .or_else(|| non_empty(&self.nombre_linea))
            .unwrap_or("")
    }

    pub fn description(&self) -> &str {
        non_empty(&self.descripcion).unwrap_or("")
    }
}

/// An order as persisted in the `orders` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Client-generated UUID. Immutable.
    pub local_id: String,
    /// Assigned once by the server on first successful submission.
    pub server_id: Option<String>,
    pub customer_id: String,
    pub items: Vec<OrderItem>,
    pub discount_percent: f64,
    /// Fixed at creation.
    pub total: f64,
    pub status: OrderStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub synced: bool,
}

impl Order {
    /// `synced` and `serverId` agree with each other and with `status`.
    pub fn sync_invariant_holds(&self) -> bool {
        match (self.synced, self.server_id.is_some()) {
            (false, false) => self.status != OrderStatus::Sent,
            (true, true) => self.status == OrderStatus::Sent,
            _ => false,
        }
    }
}

/// Input for [`crate::orders::OrderService::create_order`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    /// Optional caller-generated id so a retried create is deduplicated.
    #[serde(default)]
    pub local_id: Option<String>,
    pub customer_id: String,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub discount_percent: f64,
}

/// Pending sync work for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub payload: Value,
    /// Failed submissions since this item was enqueued.
    pub retries: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SyncQueueItem {
    pub fn new(entity_type: &str, entity_id: &str, payload: Value) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            payload,
            retries: 0,
            timestamp: Utc::now(),
            last_error: None,
        }
    }

    pub fn for_order(local_id: &str) -> Self {
        Self::new(ENTITY_ORDER, local_id, Value::Null)
    }

    pub fn key(&self) -> String {
        queue_key(&self.entity_type, &self.entity_id)
    }
}

pub fn queue_key(entity_type: &str, entity_id: &str) -> String {
    format!("{entity_type}:{entity_id}")
}

/// Round a money amount to two decimals, half away from zero.
pub fn round_money(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_serializes_with_api_field_names() {
        let item = OrderItem {
            id: "1".into(),
            producto_id: "P-10".into(),
            cantidad: 2.0,
            precio_unitario: 3.5,
            es_bonificacion: true,
            parent_item_id: Some("0".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["productoId"], "P-10");
        assert_eq!(json["precioUnitario"], 3.5);
        assert_eq!(json["esBonificacion"], true);
        assert_eq!(json["parentItemId"], "0");
        assert!(json.get("comboId").is_none());
    }

    #[test]
    fn subtotal_defaults_to_quantity_times_price() {
        let mut item = OrderItem {
            cantidad: 3.0,
            precio_unitario: 2.5,
            ..Default::default()
        };
        assert_eq!(item.subtotal(), 7.5);
        item.subtotal = Some(6.0);
        assert_eq!(item.subtotal(), 6.0);
    }

    #[test]
    fn blank_combo_fields_do_not_link_item() {
        let mut item = OrderItem {
            combo_id: Some("  ".into()),
            ..Default::default()
        };
        assert!(!item.is_combo_linked());
        item.combo_type = Some("kit".into());
        assert!(item.is_combo_linked());
    }

    #[test]
    fn status_uses_lowercase_wire_names() {
        assert_eq!(
            serde_json::to_value(OrderStatus::Ingresado).unwrap(),
            "ingresado"
        );
        let parsed: OrderStatus = serde_json::from_value("failed".into()).unwrap();
        assert_eq!(parsed, OrderStatus::Failed);
        assert!(OrderStatus::Failed.can_begin_submit());
        assert!(!OrderStatus::Sending.can_begin_submit());
    }
}
