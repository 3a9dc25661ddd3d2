//! In-process reference implementation of the origin server's `/sync`
//! contract.
//!
//! Every incoming change is stamped with a strictly increasing server time,
//! appended to the server log and, for the order kinds, folded into the
//! server's own order list. The response carries the accepted ids plus every
//! log entry newer than the caller's watermark, including the caller's own
//! changes. Resubmitted ids are accepted again but never re-logged.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::api::SyncTransport;
use crate::clock::Clock;
use crate::error::PosError;
use crate::models::{
    ModifyOrderPayload, Mutation, MutationKind, Order, OrderStatusPayload, Product, SyncRequest,
    SyncResponse,
};

#[derive(Default)]
struct ServerState {
    products: Vec<Product>,
    orders: Vec<Order>,
    changes: Vec<Mutation>,
    seen: HashSet<String>,
    last_stamp: i64,
    exchanges: usize,
}

pub struct MemoryServer {
    state: Mutex<ServerState>,
    clock: Arc<dyn Clock>,
    reachable: AtomicBool,
}

impl MemoryServer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            clock,
            reachable: AtomicBool::new(true),
        }
    }

    pub fn with_products(self, products: Vec<Product>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.products = products;
        }
        self
    }

    /// Simulate the network path to the server going down or coming back.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn orders(&self) -> Vec<Order> {
        self.state.lock().map(|s| s.orders.clone()).unwrap_or_default()
    }

    pub fn changes(&self) -> Vec<Mutation> {
        self.state.lock().map(|s| s.changes.clone()).unwrap_or_default()
    }

    /// Number of `/sync` requests that reached the server.
    pub fn exchange_count(&self) -> usize {
        self.state.lock().map(|s| s.exchanges).unwrap_or(0)
    }

    /// Inject a change as if another terminal had pushed it.
    pub fn push_foreign(&self, change: Mutation) -> Result<Mutation, PosError> {
        let mut state = self.state.lock()?;
        let stamped = self.accept(&mut state, change);
        Ok(stamped)
    }

    fn accept(&self, state: &mut ServerState, mut change: Mutation) -> Mutation {
        let stamp = self.clock.now_ms().max(state.last_stamp + 1);
        state.last_stamp = stamp;
        change.server_assigned_at = Some(stamp);
        materialize(state, &change);
        state.seen.insert(change.id.clone());
        state.changes.push(change.clone());
        change
    }
}

fn materialize(state: &mut ServerState, change: &Mutation) {
    match change.kind {
        MutationKind::AddOrder => {
            if let Ok(order) = change.payload_as::<Order>() {
                if !state.orders.iter().any(|o| o.id == order.id) {
                    state.orders.push(order);
                }
            }
        }
        MutationKind::UpdateOrderStatus => {
            if let Ok(p) = change.payload_as::<OrderStatusPayload>() {
                if let Some(order) = state.orders.iter_mut().find(|o| o.id == p.order_id) {
                    order.status = p.status;
                    order.updated_at = Some(change.authored_at);
                }
            }
        }
        MutationKind::ModifyOrder => {
            if let Ok(p) = change.payload_as::<ModifyOrderPayload>() {
                if let Some(order) = state.orders.iter_mut().find(|o| o.id == p.order_id) {
                    order.items = p.items;
                    order.comments = p.comments;
                    order.updated_at = Some(change.authored_at);
                }
            }
        }
        _ => {}
    }
}

#[async_trait]
impl SyncTransport for MemoryServer {
    async fn exchange(&self, request: &SyncRequest) -> Result<SyncResponse, PosError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(PosError::Http("Cannot reach server".into()));
        }

        let mut state = self.state.lock()?;
        state.exchanges += 1;

        let mut accepted_ids = Vec::with_capacity(request.changes.len());
        for change in &request.changes {
            accepted_ids.push(change.id.clone());
            if state.seen.contains(&change.id) {
                debug!(id = %change.id, "Resubmitted change ignored");
                continue;
            }
            self.accept(&mut state, change.clone());
        }

        let server_changes: Vec<Mutation> = state
            .changes
            .iter()
            .filter(|c| c.server_assigned_at.unwrap_or(0) > request.last_sync_at)
            .cloned()
            .collect();

        info!(
            role = %request.role,
            accepted = accepted_ids.len(),
            returned = server_changes.len(),
            "Sync request served"
        );

        Ok(SyncResponse {
            server_changes,
            accepted_ids,
        })
    }

    async fn fetch_products(&self) -> Result<Vec<Product>, PosError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(PosError::Http("Cannot reach server".into()));
        }
        Ok(self.state.lock()?.products.clone())
    }

    async fn probe(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}
