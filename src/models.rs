//! Wire and storage types for the sync engine.
//!
//! Field names follow the JSON contract spoken by the origin server
//! (`type`, `ts`, `serverTs`, camelCase entity fields), so a mutation
//! serialized here can be POSTed to `/sync` unchanged.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationKind {
    AddOrder,
    UpdateOrderStatus,
    ModifyOrder,
    CartAdd,
    CartRemove,
    SetProducts,
    AddPrintJob,
    /// Any `type` this build does not know. Every apply path ignores it.
    #[serde(other)]
    Unknown,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::AddOrder => "addOrder",
            MutationKind::UpdateOrderStatus => "updateOrderStatus",
            MutationKind::ModifyOrder => "modifyOrder",
            MutationKind::CartAdd => "cartAdd",
            MutationKind::CartRemove => "cartRemove",
            MutationKind::SetProducts => "setProducts",
            MutationKind::AddPrintJob => "addPrintJob",
            MutationKind::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "addOrder" => MutationKind::AddOrder,
            "updateOrderStatus" => MutationKind::UpdateOrderStatus,
            "modifyOrder" => MutationKind::ModifyOrder,
            "cartAdd" => MutationKind::CartAdd,
            "cartRemove" => MutationKind::CartRemove,
            "setProducts" => MutationKind::SetProducts,
            "addPrintJob" => MutationKind::AddPrintJob,
            _ => MutationKind::Unknown,
        }
    }

    /// Local-only kinds never enter the outbox or the bridge.
    pub fn is_local_only(&self) -> bool {
        matches!(self, MutationKind::AddPrintJob)
    }

    /// Kinds the server folds into its own entity state.
    pub fn is_materialized_by_server(&self) -> bool {
        matches!(
            self,
            MutationKind::AddOrder | MutationKind::UpdateOrderStatus | MutationKind::ModifyOrder
        )
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit exchanged between a terminal and the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub id: String,
    #[serde(rename = "type", alias = "kind")]
    pub kind: MutationKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ts", alias = "authoredAt", default)]
    pub authored_at: i64,
    #[serde(
        rename = "serverTs",
        alias = "serverAssignedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub server_assigned_at: Option<i64>,
}

impl Mutation {
    /// Author a fresh mutation with a new globally unique id.
    pub fn authored(kind: MutationKind, payload: Value, authored_at: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            authored_at,
            server_assigned_at: None,
        }
    }

    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusPayload {
    pub order_id: String,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyOrderPayload {
    pub order_id: String,
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartPayload {
    pub product_id: String,
}

// ---------------------------------------------------------------------------
// Orders, products, cart
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Preparing,
    Ready,
    Completed,
}

impl OrderStatus {
    /// The only legal progression. Declaration order doubles as rank.
    pub const FLOW: [OrderStatus; 4] = [
        OrderStatus::Pending,
        OrderStatus::Preparing,
        OrderStatus::Ready,
        OrderStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        OrderStatus::FLOW.into_iter().find(|s| s.as_str() == raw)
    }

    pub fn next(&self) -> Option<Self> {
        let idx = OrderStatus::FLOW.iter().position(|s| s == self)?;
        OrderStatus::FLOW.get(idx + 1).copied()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: String,
    #[serde(alias = "quantity")]
    pub qty: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub items: Vec<OrderItem>,
    pub status: OrderStatus,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub price: f64,
}

/// productId -> quantity. Ordered so checkout produces stable item lists.
pub type Cart = BTreeMap<String, u32>;

// ---------------------------------------------------------------------------
// Print jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintDestination {
    Receipt,
    Kitchen,
}

impl PrintDestination {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrintDestination::Receipt => "receipt",
            PrintDestination::Kitchen => "kitchen",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "receipt" => Some(PrintDestination::Receipt),
            "kitchen" => Some(PrintDestination::Kitchen),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintJobStatus {
    Queued,
    Printing,
    Done,
    Error,
}

impl PrintJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrintJobStatus::Queued => "queued",
            PrintJobStatus::Printing => "printing",
            PrintJobStatus::Done => "done",
            PrintJobStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(PrintJobStatus::Queued),
            "printing" => Some(PrintJobStatus::Printing),
            "done" => Some(PrintJobStatus::Done),
            "error" => Some(PrintJobStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintJob {
    pub id: String,
    /// Weak reference; the order may be gone by the time the job prints.
    pub order_id: String,
    #[serde(alias = "dest")]
    pub destination: PrintDestination,
    pub priority: i64,
    pub content: String,
    pub attempts: u32,
    pub status: PrintJobStatus,
    /// Insertion sequence, the tie-break between equal priorities.
    pub seq: i64,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPrintJob {
    pub order_id: String,
    #[serde(alias = "dest")]
    pub destination: PrintDestination,
    pub priority: i64,
    pub content: String,
}

// ---------------------------------------------------------------------------
// Sync exchange
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub changes: Vec<Mutation>,
    #[serde(default)]
    pub last_sync_at: i64,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "generic".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    #[serde(default)]
    pub server_changes: Vec<Mutation>,
    #[serde(default)]
    pub accepted_ids: Vec<String>,
}
