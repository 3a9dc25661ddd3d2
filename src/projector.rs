//! State projector.
//!
//! Folds mutations into the terminal's durable entity state (orders,
//! products, cart) and pushes the full resulting collections to
//! subscribers. Subscriptions are `tokio::sync::watch` receivers: a new
//! receiver sees the current value immediately, and dropping it
//! unsubscribes.
//!
//! Remote apply is idempotent. A mutation whose effect is already present
//! is reported as [`ApplyOutcome::Duplicate`]; one that targets an order we
//! have not seen yet (or would move an order backwards) is dropped, on the
//! expectation that a later reconciliation round delivers what it depends on.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::db::DbState;
use crate::error::PosError;
use crate::models::{
    Cart, CartPayload, ModifyOrderPayload, Mutation, MutationKind, Order, OrderItem, OrderStatus,
    OrderStatusPayload, Product,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The effect was already present; nothing changed.
    Duplicate,
    /// Not applicable here (stale target, backward move, per-terminal kind).
    Dropped(&'static str),
}

/// Which collections an apply touched, so only those are re-published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Changed {
    pub orders: bool,
    pub cart: bool,
    pub products: bool,
}

impl Changed {
    pub fn merge(&mut self, other: Changed) {
        self.orders |= other.orders;
        self.cart |= other.cart;
        self.products |= other.products;
    }

    pub fn any(&self) -> bool {
        self.orders || self.cart || self.products
    }
}

pub struct StateProjector {
    db: Arc<DbState>,
    orders_tx: watch::Sender<Vec<Order>>,
    cart_tx: watch::Sender<Cart>,
    products_tx: watch::Sender<Vec<Product>>,
}

impl StateProjector {
    pub fn new(db: Arc<DbState>) -> Result<Self, PosError> {
        let (orders, cart, products) = {
            let conn = db.lock()?;
            (load_orders(&conn)?, load_cart(&conn)?, load_products(&conn)?)
        };
        Ok(Self {
            db,
            orders_tx: watch::channel(orders).0,
            cart_tx: watch::channel(cart).0,
            products_tx: watch::channel(products).0,
        })
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    pub fn subscribe_orders(&self) -> watch::Receiver<Vec<Order>> {
        self.orders_tx.subscribe()
    }

    pub fn subscribe_cart(&self) -> watch::Receiver<Cart> {
        self.cart_tx.subscribe()
    }

    pub fn subscribe_products(&self) -> watch::Receiver<Vec<Product>> {
        self.products_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn orders(&self) -> Result<Vec<Order>, PosError> {
        load_orders(&*self.db.lock()?)
    }

    pub fn order(&self, id: &str) -> Result<Option<Order>, PosError> {
        load_order(&*self.db.lock()?, id)
    }

    pub fn cart(&self) -> Result<Cart, PosError> {
        load_cart(&*self.db.lock()?)
    }

    pub fn products(&self) -> Result<Vec<Product>, PosError> {
        load_products(&*self.db.lock()?)
    }

    // -----------------------------------------------------------------------
    // Apply
    // -----------------------------------------------------------------------

    /// Apply a mutation authored on this terminal and notify subscribers.
    pub fn apply_local(&self, mutation: &Mutation) -> Result<ApplyOutcome, PosError> {
        self.apply(mutation, Origin::Local)
    }

    /// Apply a mutation received from the server (or the bridge). Safe to
    /// call any number of times with the same mutation.
    pub fn apply_remote(&self, mutation: &Mutation) -> Result<ApplyOutcome, PosError> {
        self.apply(mutation, Origin::Remote)
    }

    fn apply(&self, mutation: &Mutation, origin: Origin) -> Result<ApplyOutcome, PosError> {
        let (outcome, changed) = {
            let conn = self.db.lock()?;
            self.apply_in(&conn, mutation, origin)?
        };
        self.publish(changed)?;
        Ok(outcome)
    }

    /// Apply without publishing, on a caller-owned connection or transaction.
    /// The caller must [`publish`](Self::publish) after committing.
    pub fn apply_in(
        &self,
        conn: &Connection,
        mutation: &Mutation,
        origin: Origin,
    ) -> Result<(ApplyOutcome, Changed), PosError> {
        let result = match mutation.kind {
            MutationKind::AddOrder => apply_add_order(conn, mutation),
            MutationKind::UpdateOrderStatus => apply_order_status(conn, mutation),
            MutationKind::ModifyOrder => apply_modify_order(conn, mutation),
            MutationKind::SetProducts => apply_set_products(conn, mutation),
            MutationKind::CartAdd | MutationKind::CartRemove => match origin {
                Origin::Local => apply_cart(conn, mutation),
                Origin::Remote => Ok((ApplyOutcome::Dropped("cart is per-terminal"), Changed::default())),
            },
            MutationKind::AddPrintJob | MutationKind::Unknown => {
                Ok((ApplyOutcome::Dropped("not projected"), Changed::default()))
            }
        };

        match result {
            Ok((outcome, changed)) => {
                match &outcome {
                    ApplyOutcome::Applied => {
                        debug!(id = %mutation.id, kind = %mutation.kind, ?origin, "Mutation applied")
                    }
                    ApplyOutcome::Duplicate => {
                        debug!(id = %mutation.id, kind = %mutation.kind, ?origin, "Mutation already applied")
                    }
                    ApplyOutcome::Dropped(reason) => {
                        debug!(id = %mutation.id, kind = %mutation.kind, ?origin, reason, "Mutation dropped")
                    }
                }
                Ok((outcome, changed))
            }
            // A malformed server payload must not wedge reconciliation.
            Err(PosError::Serialization(e)) if origin == Origin::Remote => {
                warn!(id = %mutation.id, kind = %mutation.kind, error = %e, "Dropping remote mutation with malformed payload");
                Ok((ApplyOutcome::Dropped("malformed payload"), Changed::default()))
            }
            Err(e) => Err(e),
        }
    }

    /// Push the current value of every touched collection to subscribers.
    pub fn publish(&self, changed: Changed) -> Result<(), PosError> {
        if !changed.any() {
            return Ok(());
        }
        let conn = self.db.lock()?;
        if changed.orders {
            self.orders_tx.send_replace(load_orders(&conn)?);
        }
        if changed.cart {
            self.cart_tx.send_replace(load_cart(&conn)?);
        }
        if changed.products {
            self.products_tx.send_replace(load_products(&conn)?);
        }
        Ok(())
    }

    /// Empty the cart after checkout. Cart clearing is a local effect only.
    pub fn clear_cart(&self) -> Result<(), PosError> {
        let changed = self.clear_cart_in(&*self.db.lock()?)?;
        self.publish(changed)
    }

    pub fn clear_cart_in(&self, conn: &Connection) -> Result<Changed, PosError> {
        conn.execute("DELETE FROM cart", [])?;
        Ok(Changed {
            cart: true,
            ..Changed::default()
        })
    }

    /// Seed the product cache from the server without authoring a mutation.
    pub fn replace_products(&self, products: &[Product]) -> Result<(), PosError> {
        {
            let mut conn = self.db.lock()?;
            let tx = conn.transaction()?;
            write_products(&tx, products)?;
            tx.commit()?;
        }
        self.publish(Changed {
            products: true,
            ..Changed::default()
        })
    }
}

// ---------------------------------------------------------------------------
// Per-kind application
// ---------------------------------------------------------------------------

type Applied = Result<(ApplyOutcome, Changed), PosError>;

const ORDERS: Changed = Changed {
    orders: true,
    cart: false,
    products: false,
};

fn apply_add_order(conn: &Connection, mutation: &Mutation) -> Applied {
    let order: Order = mutation.payload_as()?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO orders (id, items, status, comments, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            order.id,
            serde_json::to_string(&order.items)?,
            order.status.as_str(),
            order.comments,
            order.created_at,
            order.updated_at
        ],
    )?;
    if inserted == 0 {
        return Ok((ApplyOutcome::Duplicate, Changed::default()));
    }
    Ok((ApplyOutcome::Applied, ORDERS))
}

fn apply_order_status(conn: &Connection, mutation: &Mutation) -> Applied {
    let payload: OrderStatusPayload = mutation.payload_as()?;
    let Some(order) = load_order(conn, &payload.order_id)? else {
        return Ok((ApplyOutcome::Dropped("unknown order"), Changed::default()));
    };
    if payload.status == order.status {
        return Ok((ApplyOutcome::Duplicate, Changed::default()));
    }
    if payload.status < order.status {
        return Ok((ApplyOutcome::Dropped("status would move backward"), Changed::default()));
    }
    conn.execute(
        "UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![payload.status.as_str(), mutation.authored_at, payload.order_id],
    )?;
    Ok((ApplyOutcome::Applied, ORDERS))
}

fn apply_modify_order(conn: &Connection, mutation: &Mutation) -> Applied {
    let payload: ModifyOrderPayload = mutation.payload_as()?;
    let Some(order) = load_order(conn, &payload.order_id)? else {
        return Ok((ApplyOutcome::Dropped("unknown order"), Changed::default()));
    };
    if order.items == payload.items && order.comments == payload.comments {
        return Ok((ApplyOutcome::Duplicate, Changed::default()));
    }
    if order.status != OrderStatus::Pending {
        return Ok((ApplyOutcome::Dropped("order is past pending"), Changed::default()));
    }
    conn.execute(
        "UPDATE orders SET items = ?1, comments = ?2, updated_at = ?3 WHERE id = ?4",
        params![
            serde_json::to_string(&payload.items)?,
            payload.comments,
            mutation.authored_at,
            payload.order_id
        ],
    )?;
    Ok((ApplyOutcome::Applied, ORDERS))
}

fn apply_set_products(conn: &Connection, mutation: &Mutation) -> Applied {
    let products: Vec<Product> = mutation.payload_as()?;
    if load_products(conn)? == products {
        return Ok((ApplyOutcome::Duplicate, Changed::default()));
    }
    write_products(conn, &products)?;
    Ok((
        ApplyOutcome::Applied,
        Changed {
            products: true,
            ..Changed::default()
        },
    ))
}

fn apply_cart(conn: &Connection, mutation: &Mutation) -> Applied {
    let payload: CartPayload = mutation.payload_as()?;
    let current: Option<i64> = conn
        .query_row(
            "SELECT qty FROM cart WHERE product_id = ?1",
            params![payload.product_id],
            |row| row.get(0),
        )
        .optional()?;

    match (mutation.kind, current) {
        (MutationKind::CartAdd, _) => {
            conn.execute(
                "INSERT INTO cart (product_id, qty) VALUES (?1, 1)
                 ON CONFLICT(product_id) DO UPDATE SET qty = qty + 1",
                params![payload.product_id],
            )?;
        }
        (_, None) => return Ok((ApplyOutcome::Dropped("product not in cart"), Changed::default())),
        (_, Some(qty)) if qty > 1 => {
            conn.execute(
                "UPDATE cart SET qty = qty - 1 WHERE product_id = ?1",
                params![payload.product_id],
            )?;
        }
        (_, Some(_)) => {
            conn.execute(
                "DELETE FROM cart WHERE product_id = ?1",
                params![payload.product_id],
            )?;
        }
    }
    Ok((
        ApplyOutcome::Applied,
        Changed {
            cart: true,
            ..Changed::default()
        },
    ))
}

// ---------------------------------------------------------------------------
// Row loaders
// ---------------------------------------------------------------------------

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Order, String)> {
    let status: String = row.get(2)?;
    let items_json: String = row.get(1)?;
    Ok((
        Order {
            id: row.get(0)?,
            items: Vec::new(),
            status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Pending),
            comments: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        },
        items_json,
    ))
}

fn hydrate_items(mut order: Order, items_json: &str) -> Order {
    order.items = serde_json::from_str::<Vec<OrderItem>>(items_json).unwrap_or_else(|e| {
        warn!(order_id = %order.id, error = %e, "order items column is malformed");
        Vec::new()
    });
    order
}

pub(crate) fn load_orders(conn: &Connection) -> Result<Vec<Order>, PosError> {
    let mut stmt = conn.prepare(
        "SELECT id, items, status, comments, created_at, updated_at
         FROM orders ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt.query_map([], row_to_order)?;
    let mut out = Vec::new();
    for row in rows {
        let (order, items) = row?;
        out.push(hydrate_items(order, &items));
    }
    Ok(out)
}

pub(crate) fn load_order(conn: &Connection, id: &str) -> Result<Option<Order>, PosError> {
    let row = conn
        .query_row(
            "SELECT id, items, status, comments, created_at, updated_at
             FROM orders WHERE id = ?1",
            params![id],
            row_to_order,
        )
        .optional()?;
    Ok(row.map(|(order, items)| hydrate_items(order, &items)))
}

fn load_cart(conn: &Connection) -> Result<Cart, PosError> {
    let mut stmt = conn.prepare("SELECT product_id, qty FROM cart")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut cart = Cart::new();
    for row in rows {
        let (product_id, qty) = row?;
        cart.insert(product_id, qty.max(0) as u32);
    }
    Ok(cart)
}

fn load_products(conn: &Connection) -> Result<Vec<Product>, PosError> {
    let mut stmt = conn.prepare("SELECT id, name, price FROM products ORDER BY position ASC")?;
    let rows = stmt.query_map([], |row| {
        Ok(Product {
            id: row.get(0)?,
            name: row.get(1)?,
            price: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn write_products(conn: &Connection, products: &[Product]) -> Result<(), PosError> {
    conn.execute("DELETE FROM products", [])?;
    let mut stmt =
        conn.prepare("INSERT OR REPLACE INTO products (id, name, price, position) VALUES (?1, ?2, ?3, ?4)")?;
    for (position, p) in products.iter().enumerate() {
        stmt.execute(params![p.id, p.name, p.price, position as i64])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, Schema};
    use serde_json::json;

    fn projector() -> StateProjector {
        StateProjector::new(Arc::new(db::open_in_memory(Schema::Terminal).unwrap())).unwrap()
    }

    fn add_order(id: &str) -> Mutation {
        Mutation {
            id: format!("m-{id}"),
            kind: MutationKind::AddOrder,
            payload: json!({
                "id": id,
                "items": [{ "productId": "p1", "qty": 1 }],
                "status": "pending",
                "createdAt": 100
            }),
            authored_at: 100,
            server_assigned_at: Some(1_000),
        }
    }

    fn status(order_id: &str, status: &str, ts: i64) -> Mutation {
        Mutation {
            id: format!("s-{order_id}-{status}"),
            kind: MutationKind::UpdateOrderStatus,
            payload: json!({ "orderId": order_id, "status": status }),
            authored_at: ts,
            server_assigned_at: Some(ts + 1),
        }
    }

    fn modify(order_id: &str, qty: u32, comments: &str) -> Mutation {
        Mutation {
            id: format!("mod-{order_id}-{qty}"),
            kind: MutationKind::ModifyOrder,
            payload: json!({
                "orderId": order_id,
                "items": [{ "productId": "p1", "qty": qty }],
                "comments": comments
            }),
            authored_at: 300,
            server_assigned_at: Some(301),
        }
    }

    fn set_products() -> Mutation {
        Mutation {
            id: "prod-1".into(),
            kind: MutationKind::SetProducts,
            payload: json!([
                { "id": "1", "name": "Burger", "price": 5.99 },
                { "id": "2", "name": "Fries", "price": 2.49 }
            ]),
            authored_at: 1,
            server_assigned_at: Some(2),
        }
    }

    #[test]
    fn test_remote_apply_is_idempotent_for_every_kind() {
        let p = projector();
        p.apply_remote(&add_order("o1")).unwrap();

        for m in [
            add_order("o2"),
            modify("o2", 3, "extra salt"),
            status("o2", "preparing", 200),
            set_products(),
        ] {
            p.apply_remote(&m).unwrap();
            let orders_once = p.orders().unwrap();
            let products_once = p.products().unwrap();

            let second = p.apply_remote(&m).unwrap();
            assert_ne!(second, ApplyOutcome::Applied, "{:?} applied twice", m.kind);
            assert_eq!(p.orders().unwrap(), orders_once);
            assert_eq!(p.products().unwrap(), products_once);
        }
    }

    #[test]
    fn test_status_update_for_unknown_order_is_dropped() {
        let p = projector();
        let outcome = p.apply_remote(&status("ghost", "ready", 50)).unwrap();
        assert_eq!(outcome, ApplyOutcome::Dropped("unknown order"));
        assert!(p.orders().unwrap().is_empty());
    }

    #[test]
    fn test_status_never_moves_backward() {
        let p = projector();
        p.apply_remote(&add_order("o1")).unwrap();
        p.apply_remote(&status("o1", "ready", 200)).unwrap();
        let outcome = p.apply_remote(&status("o1", "preparing", 300)).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Dropped(_)));
        assert_eq!(p.order("o1").unwrap().unwrap().status, OrderStatus::Ready);
    }

    #[test]
    fn test_status_update_stamps_updated_at_from_mutation() {
        let p = projector();
        p.apply_remote(&add_order("o1")).unwrap();
        p.apply_remote(&status("o1", "preparing", 777)).unwrap();
        assert_eq!(p.order("o1").unwrap().unwrap().updated_at, Some(777));
    }

    #[test]
    fn test_modify_rejected_once_past_pending() {
        let p = projector();
        p.apply_remote(&add_order("o1")).unwrap();
        p.apply_remote(&status("o1", "preparing", 200)).unwrap();
        let outcome = p.apply_remote(&modify("o1", 9, "late edit")).unwrap();
        assert_eq!(outcome, ApplyOutcome::Dropped("order is past pending"));
        assert_eq!(p.order("o1").unwrap().unwrap().items[0].qty, 1);
    }

    #[test]
    fn test_remote_cart_mutations_are_ignored() {
        let p = projector();
        let m = Mutation::authored(MutationKind::CartAdd, json!({ "productId": "p1" }), 1);
        assert!(matches!(p.apply_remote(&m).unwrap(), ApplyOutcome::Dropped(_)));
        assert!(p.cart().unwrap().is_empty());

        p.apply_local(&m).unwrap();
        p.apply_local(&m).unwrap();
        assert_eq!(p.cart().unwrap().get("p1"), Some(&2));
    }

    #[test]
    fn test_local_cart_remove_decrements_then_deletes() {
        let p = projector();
        let add = Mutation::authored(MutationKind::CartAdd, json!({ "productId": "p1" }), 1);
        let remove = Mutation::authored(MutationKind::CartRemove, json!({ "productId": "p1" }), 2);
        p.apply_local(&add).unwrap();
        p.apply_local(&add).unwrap();
        p.apply_local(&remove).unwrap();
        assert_eq!(p.cart().unwrap().get("p1"), Some(&1));
        p.apply_local(&remove).unwrap();
        assert!(p.cart().unwrap().is_empty());
        assert_eq!(
            p.apply_local(&remove).unwrap(),
            ApplyOutcome::Dropped("product not in cart")
        );
    }

    #[test]
    fn test_malformed_remote_payload_is_dropped_not_fatal() {
        let p = projector();
        let m = Mutation {
            id: "bad".into(),
            kind: MutationKind::AddOrder,
            payload: json!({ "nope": true }),
            authored_at: 1,
            server_assigned_at: Some(2),
        };
        assert_eq!(
            p.apply_remote(&m).unwrap(),
            ApplyOutcome::Dropped("malformed payload")
        );
        assert!(p.apply_local(&m).is_err());
    }

    #[test]
    fn test_subscribers_get_current_state_then_full_collection() {
        let p = projector();
        p.apply_remote(&add_order("o1")).unwrap();

        let mut rx = p.subscribe_orders();
        assert_eq!(rx.borrow().len(), 1);

        p.apply_remote(&add_order("o2")).unwrap();
        assert!(rx.has_changed().unwrap());
        let ids: Vec<String> = rx.borrow_and_update().iter().map(|o| o.id.clone()).collect();
        assert_eq!(ids, vec!["o1", "o2"]);

        // Duplicate apply does not notify.
        p.apply_remote(&add_order("o2")).unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_replace_products_preserves_order() {
        let p = projector();
        let mut rx = p.subscribe_products();
        p.replace_products(&[
            Product { id: "b".into(), name: "B".into(), price: 1.0 },
            Product { id: "a".into(), name: "A".into(), price: 2.0 },
        ])
        .unwrap();
        let ids: Vec<String> = rx.borrow_and_update().iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
