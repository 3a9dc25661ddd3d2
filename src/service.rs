//! Authoring surface used by the presentation layer.
//!
//! Every user action becomes a [`Mutation`]. Validation happens here, before
//! anything is written: an illegal action (empty checkout, backward status,
//! editing an order that is already being prepared) is refused and never
//! reaches the outbox. An accepted mutation is applied locally and appended
//! to the outbox in one transaction, then handed to the background bridge.

use std::sync::Arc;

use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::bridge::BridgeClient;
use crate::clock::Clock;
use crate::error::PosError;
use crate::models::{
    ModifyOrderPayload, Mutation, MutationKind, NewPrintJob, Order, OrderItem, OrderStatus,
    OrderStatusPayload, PrintDestination, PrintJob, Product,
};
use crate::outbox::ChangeLog;
use crate::projector::{ApplyOutcome, Changed, Origin, StateProjector};
use crate::scheduler::JobScheduler;

pub struct PosService {
    projector: Arc<StateProjector>,
    outbox: ChangeLog,
    scheduler: Arc<JobScheduler>,
    bridge: Option<BridgeClient>,
    clock: Arc<dyn Clock>,
}

impl PosService {
    pub fn new(
        projector: Arc<StateProjector>,
        outbox: ChangeLog,
        scheduler: Arc<JobScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            projector,
            outbox,
            scheduler,
            bridge: None,
            clock,
        }
    }

    pub fn with_bridge(mut self, bridge: BridgeClient) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn projector(&self) -> &Arc<StateProjector> {
        &self.projector
    }

    // -----------------------------------------------------------------------
    // Cart
    // -----------------------------------------------------------------------

    pub fn add_to_cart(&self, product_id: &str) -> Result<Mutation, PosError> {
        self.author(
            MutationKind::CartAdd,
            json!({ "productId": product_id }),
            false,
        )
    }

    /// Returns `None` when the product is not in the cart.
    pub fn remove_from_cart(&self, product_id: &str) -> Result<Option<Mutation>, PosError> {
        if !self.projector.cart()?.contains_key(product_id) {
            return Ok(None);
        }
        self.author(
            MutationKind::CartRemove,
            json!({ "productId": product_id }),
            false,
        )
        .map(Some)
    }

    /// Turn the cart into a pending order and empty the cart.
    pub fn checkout(&self, comments: &str) -> Result<Order, PosError> {
        let items: Vec<OrderItem> = self
            .projector
            .cart()?
            .into_iter()
            .filter(|(_, qty)| *qty > 0)
            .map(|(product_id, qty)| OrderItem { product_id, qty })
            .collect();
        if items.is_empty() {
            return Err(PosError::IllegalTransition("cannot check out an empty cart".into()));
        }

        let now = self.clock.now_ms();
        let comments = comments.trim();
        let order = Order {
            id: uuid::Uuid::new_v4().to_string(),
            items,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: None,
            comments: (!comments.is_empty()).then(|| comments.to_string()),
        };

        self.author(MutationKind::AddOrder, serde_json::to_value(&order)?, true)?;
        info!(order_id = %order.id, items = order.items.len(), "Order checked out");
        Ok(order)
    }

    // -----------------------------------------------------------------------
    // Orders
    // -----------------------------------------------------------------------

    /// Move an order forward to `status`. Skipping steps is allowed; moving
    /// backward or re-sending the current status is not.
    pub fn update_order_status(&self, order_id: &str, status: OrderStatus) -> Result<Order, PosError> {
        let order = self.require_order(order_id)?;
        if status <= order.status {
            return Err(PosError::IllegalTransition(format!(
                "order {order_id} is {} and cannot move to {status}",
                order.status
            )));
        }
        let payload = OrderStatusPayload {
            order_id: order_id.to_string(),
            status,
        };
        self.author(MutationKind::UpdateOrderStatus, serde_json::to_value(payload)?, false)?;
        self.require_order(order_id)
    }

    /// Move an order to the next status in the flow.
    pub fn advance_order(&self, order_id: &str) -> Result<Order, PosError> {
        let order = self.require_order(order_id)?;
        let next = order.status.next().ok_or_else(|| {
            PosError::IllegalTransition(format!("order {order_id} is already completed"))
        })?;
        self.update_order_status(order_id, next)
    }

    /// Replace the items and comments of a pending order.
    pub fn modify_order(
        &self,
        order_id: &str,
        items: Vec<OrderItem>,
        comments: Option<String>,
    ) -> Result<Order, PosError> {
        let order = self.require_order(order_id)?;
        if order.status != OrderStatus::Pending {
            return Err(PosError::IllegalTransition(format!(
                "order {order_id} is {} and can no longer be modified",
                order.status
            )));
        }
        let payload = ModifyOrderPayload {
            order_id: order_id.to_string(),
            items,
            comments,
        };
        self.author(MutationKind::ModifyOrder, serde_json::to_value(payload)?, false)?;
        self.require_order(order_id)
    }

    // -----------------------------------------------------------------------
    // Catalogue
    // -----------------------------------------------------------------------

    pub fn set_products(&self, products: Vec<Product>) -> Result<Mutation, PosError> {
        self.author(MutationKind::SetProducts, serde_json::to_value(products)?, false)
    }

    // -----------------------------------------------------------------------
    // Printing
    // -----------------------------------------------------------------------

    /// Queue a ticket for `order_id`. The content is rendered now so the job
    /// stays printable even if the order changes or disappears.
    pub fn print_order(
        &self,
        order_id: &str,
        destination: PrintDestination,
        priority: i64,
    ) -> Result<PrintJob, PosError> {
        let order = self.require_order(order_id)?;
        let products = self.projector.products()?;
        let content = render_ticket(&order, &products, destination);
        self.scheduler.enqueue(NewPrintJob {
            order_id: order.id,
            destination,
            priority,
            content,
        })
    }

    fn require_order(&self, order_id: &str) -> Result<Order, PosError> {
        self.projector
            .order(order_id)?
            .ok_or_else(|| PosError::NotFound(format!("order {order_id}")))
    }

    /// Apply locally, record in the outbox, then hand to the bridge.
    fn author(&self, kind: MutationKind, payload: Value, clear_cart: bool) -> Result<Mutation, PosError> {
        let mutation = Mutation::authored(kind, payload, self.clock.now_ms());

        let changed = {
            let mut conn = self.projector.db().lock()?;
            let tx = conn.transaction()?;
            let mut changed = self.commit_local(&tx, &mutation)?;
            if clear_cart {
                changed.merge(self.projector.clear_cart_in(&tx)?);
            }
            tx.commit()?;
            changed
        };
        self.projector.publish(changed)?;

        if let Some(bridge) = &self.bridge {
            if let Err(e) = bridge.enqueue(mutation.clone()) {
                warn!(id = %mutation.id, error = %e, "Background bridge unavailable");
            }
        }
        Ok(mutation)
    }

    fn commit_local(&self, conn: &Connection, mutation: &Mutation) -> Result<Changed, PosError> {
        let (outcome, changed) = self.projector.apply_in(conn, mutation, Origin::Local)?;
        if let ApplyOutcome::Dropped(reason) = outcome {
            return Err(PosError::IllegalTransition(reason.to_string()));
        }
        self.outbox.append_in(conn, mutation)?;
        Ok(changed)
    }
}

fn render_ticket(order: &Order, products: &[Product], destination: PrintDestination) -> String {
    let short_id: String = order.id.chars().take(8).collect();
    let mut lines = vec![match destination {
        PrintDestination::Kitchen => format!("KITCHEN #{short_id}"),
        PrintDestination::Receipt => format!("RECEIPT #{short_id}"),
    }];

    let mut total = 0.0;
    for item in &order.items {
        let product = products.iter().find(|p| p.id == item.product_id);
        let name = product.map(|p| p.name.as_str()).unwrap_or(&item.product_id);
        match (destination, product) {
            (PrintDestination::Receipt, Some(p)) => {
                let line_total = p.price * f64::from(item.qty);
                total += line_total;
                lines.push(format!("{name} x{} {line_total:.2}", item.qty));
            }
            _ => lines.push(format!("{name} x{}", item.qty)),
        }
    }

    if let Some(comments) = order.comments.as_deref().filter(|c| !c.is_empty()) {
        lines.push(format!("Note: {comments}"));
    }
    if destination == PrintDestination::Receipt {
        lines.push(format!("TOTAL {total:.2}"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Role;
    use crate::db::{self, Schema};
    use crate::models::PrintJobStatus;
    use crate::print::{PrintQueue, PrintRenderer};
    use crate::scheduler::SchedulerTiming;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct NullRenderer;

    #[async_trait]
    impl PrintRenderer for NullRenderer {
        async fn render(&self, _job: &PrintJob) -> Result<(), PosError> {
            Ok(())
        }
    }

    fn service() -> (PosService, ChangeLog) {
        let db = Arc::new(db::open_in_memory(Schema::Terminal).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let projector = Arc::new(StateProjector::new(db.clone()).unwrap());
        let outbox = ChangeLog::outbox(db.clone());
        let scheduler = JobScheduler::new(
            PrintQueue::new(db),
            Arc::new(NullRenderer),
            Role::Manager,
            clock.clone(),
            SchedulerTiming {
                tick_every: Duration::from_secs(6),
                print_latency: Duration::from_millis(10),
                done_grace: Duration::from_secs(2),
            },
            CancellationToken::new(),
        )
        .unwrap();
        (
            PosService::new(projector, outbox.clone(), scheduler, clock),
            outbox,
        )
    }

    fn burger_and_fries() -> Vec<Product> {
        vec![
            Product { id: "p1".into(), name: "Burger".into(), price: 5.99 },
            Product { id: "p2".into(), name: "Fries".into(), price: 2.49 },
        ]
    }

    #[test]
    fn test_checkout_no_onions() {
        let (svc, outbox) = service();
        svc.add_to_cart("p1").unwrap();
        let order = svc.checkout("no onions").unwrap();

        let add_orders: Vec<Mutation> = outbox
            .pending()
            .unwrap()
            .into_iter()
            .filter(|m| m.kind == MutationKind::AddOrder)
            .collect();
        assert_eq!(add_orders.len(), 1);
        let payload = &add_orders[0].payload;
        assert_eq!(payload["items"], json!([{ "productId": "p1", "qty": 1 }]));
        assert_eq!(payload["comments"], "no onions");
        assert_eq!(payload["id"], order.id.as_str());

        assert!(svc.projector().cart().unwrap().is_empty());
        assert_eq!(svc.projector().orders().unwrap(), vec![order]);
    }

    #[test]
    fn test_empty_checkout_is_refused_and_not_queued() {
        let (svc, outbox) = service();
        assert!(matches!(svc.checkout(""), Err(PosError::IllegalTransition(_))));
        assert!(outbox.is_empty().unwrap());
    }

    #[test]
    fn test_remove_missing_cart_item_authors_nothing() {
        let (svc, outbox) = service();
        assert!(svc.remove_from_cart("p9").unwrap().is_none());
        svc.add_to_cart("p1").unwrap();
        svc.add_to_cart("p1").unwrap();
        assert!(svc.remove_from_cart("p1").unwrap().is_some());
        assert_eq!(svc.projector().cart().unwrap().get("p1"), Some(&1));
        assert_eq!(outbox.len().unwrap(), 3);
    }

    #[test]
    fn test_status_moves_forward_only() {
        let (svc, outbox) = service();
        svc.add_to_cart("p1").unwrap();
        let order = svc.checkout("").unwrap();
        assert_eq!(order.comments, None);

        let preparing = svc.advance_order(&order.id).unwrap();
        assert_eq!(preparing.status, OrderStatus::Preparing);
        assert_eq!(preparing.updated_at, Some(1_000));

        let queued = outbox.len().unwrap();
        assert!(matches!(
            svc.update_order_status(&order.id, OrderStatus::Pending),
            Err(PosError::IllegalTransition(_))
        ));
        assert!(matches!(
            svc.update_order_status(&order.id, OrderStatus::Preparing),
            Err(PosError::IllegalTransition(_))
        ));
        assert_eq!(outbox.len().unwrap(), queued);

        svc.update_order_status(&order.id, OrderStatus::Completed).unwrap();
        assert!(matches!(
            svc.advance_order(&order.id),
            Err(PosError::IllegalTransition(_))
        ));
        assert!(matches!(
            svc.advance_order("nope"),
            Err(PosError::NotFound(_))
        ));
    }

    #[test]
    fn test_modify_only_while_pending() {
        let (svc, outbox) = service();
        svc.add_to_cart("p1").unwrap();
        let order = svc.checkout("").unwrap();

        let items = vec![OrderItem { product_id: "p2".into(), qty: 2 }];
        let modified = svc
            .modify_order(&order.id, items.clone(), Some("extra salt".into()))
            .unwrap();
        assert_eq!(modified.items, items);
        assert_eq!(modified.comments.as_deref(), Some("extra salt"));

        svc.advance_order(&order.id).unwrap();
        let queued = outbox.len().unwrap();
        assert!(matches!(
            svc.modify_order(&order.id, vec![], None),
            Err(PosError::IllegalTransition(_))
        ));
        assert_eq!(outbox.len().unwrap(), queued);
    }

    #[test]
    fn test_set_products_is_queued_and_projected() {
        let (svc, outbox) = service();
        let mut rx = svc.projector().subscribe_products();
        let m = svc.set_products(burger_and_fries()).unwrap();
        assert_eq!(outbox.pending().unwrap(), vec![m]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 2);
    }

    #[tokio::test]
    async fn test_print_order_denormalizes_content_and_stays_local() {
        let (svc, outbox) = service();
        svc.projector().replace_products(&burger_and_fries()).unwrap();
        svc.add_to_cart("p1").unwrap();
        svc.add_to_cart("p2").unwrap();
        svc.add_to_cart("p2").unwrap();
        let order = svc.checkout("no onions").unwrap();
        let queued = outbox.len().unwrap();

        let kitchen = svc
            .print_order(&order.id, PrintDestination::Kitchen, 0)
            .unwrap();
        assert_eq!(kitchen.status, PrintJobStatus::Queued);
        assert!(kitchen.content.contains("Burger x1"));
        assert!(kitchen.content.contains("Fries x2"));
        assert!(kitchen.content.contains("Note: no onions"));

        let receipt = svc
            .print_order(&order.id, PrintDestination::Receipt, 1)
            .unwrap();
        assert!(receipt.content.contains("Fries x2 4.98"));
        assert!(receipt.content.ends_with("TOTAL 10.97"));

        assert_eq!(outbox.len().unwrap(), queued);
        assert!(matches!(
            svc.print_order("ghost", PrintDestination::Kitchen, 0),
            Err(PosError::NotFound(_))
        ));
        svc.scheduler.shutdown();
    }
}
