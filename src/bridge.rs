//! Background delivery bridge.
//!
//! A second, independent path to the server. The bridge is an actor that
//! owns its own durable queue (a separate SQLite file) and talks to the
//! rest of the terminal only through channels: pages hand it every locally
//! authored mutation with a fire-and-forget [`BridgeClient::enqueue`], and
//! it broadcasts whatever it pulls back to every open page. Pages fold those
//! through [`StateProjector::apply_remote`], which is idempotent, so it does
//! not matter that the foreground reconciler delivers the same changes too.
//!
//! Delivery is best-effort. A flush happens when a wake-up is pending and the
//! connectivity signal is online; a failed flush keeps the wake-up pending
//! and is retried on the next retry tick, enqueue, or reconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::SyncTransport;
use crate::config::Role;
use crate::error::PosError;
use crate::models::{Mutation, SyncRequest};
use crate::network::NetworkMonitor;
use crate::outbox::ChangeLog;
use crate::projector::StateProjector;

const BROADCAST_CAPACITY: usize = 64;

pub type Response<T> = oneshot::Sender<Result<T, PosError>>;

#[derive(Debug)]
pub enum BridgeMessage {
    Enqueue(Mutation),
    /// Push now if online, regardless of any pending wake-up.
    Flush { respond_to: Response<usize> },
}

pub struct BridgeActor {
    receiver: mpsc::UnboundedReceiver<BridgeMessage>,
    store: ChangeLog,
    transport: Arc<dyn SyncTransport>,
    online: watch::Receiver<bool>,
    changes_tx: broadcast::Sender<Vec<Mutation>>,
    role: Role,
    retry_every: Duration,
    wake_requested: bool,
}

impl BridgeActor {
    pub fn new(
        store: ChangeLog,
        transport: Arc<dyn SyncTransport>,
        network: &NetworkMonitor,
        role: Role,
        retry_every: Duration,
    ) -> (Self, BridgeClient) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (changes_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let client = BridgeClient {
            sender,
            changes_tx: changes_tx.clone(),
        };
        let actor = Self {
            receiver,
            store,
            transport,
            online: network.subscribe(),
            changes_tx,
            role,
            retry_every,
            // Anything left from a previous run needs delivering.
            wake_requested: true,
        };
        (actor, client)
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(role = %self.role, "Background bridge started");
        let mut retry = tokio::time::interval(self.retry_every);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = self.receiver.recv() => match msg {
                    Some(BridgeMessage::Enqueue(mutation)) => {
                        match self.store.append(&mutation) {
                            Ok(true) => {
                                self.wake_requested = true;
                                self.flush_if_ready().await;
                            }
                            Ok(false) => {}
                            Err(e) => warn!(id = %mutation.id, error = %e, "Bridge failed to queue mutation"),
                        }
                    }
                    Some(BridgeMessage::Flush { respond_to }) => {
                        let online = *self.online.borrow();
                        let result = if online {
                            self.flush().await
                        } else {
                            Ok(0)
                        };
                        let _ = respond_to.send(result);
                    }
                    None => break,
                },
                changed = self.online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *self.online.borrow_and_update();
                    if online {
                        debug!(wake = self.wake_requested, "Bridge saw connectivity return");
                        self.flush_if_ready().await;
                    }
                }
                _ = retry.tick(), if self.wake_requested => {
                    self.flush_if_ready().await;
                }
            }
        }
        info!("Background bridge stopped");
    }

    async fn flush_if_ready(&mut self) {
        let online = *self.online.borrow();
        if !self.wake_requested || !online {
            return;
        }
        if let Err(e) = self.flush().await {
            warn!(error = %e, "Bridge flush failed; will retry");
        }
    }

    /// Push the whole queue with a zero watermark and broadcast what comes
    /// back. Returns the number of acknowledged entries.
    async fn flush(&mut self) -> Result<usize, PosError> {
        let changes = self.store.pending()?;
        if changes.is_empty() {
            self.wake_requested = false;
            return Ok(0);
        }

        let request = SyncRequest {
            changes,
            last_sync_at: 0,
            role: self.role.as_str().to_string(),
        };
        let response = self.transport.exchange(&request).await?;

        let acknowledged = self.store.acknowledge(&response.accepted_ids)?;
        self.wake_requested = !self.store.is_empty()?;

        if !response.server_changes.is_empty() {
            // No open pages is fine.
            let pages = self.changes_tx.send(response.server_changes).unwrap_or(0);
            debug!(pages, "Bridge broadcast pulled changes");
        }

        info!(
            pushed = request.changes.len(),
            acknowledged,
            "Bridge flush complete"
        );
        Ok(acknowledged)
    }
}

#[derive(Clone)]
pub struct BridgeClient {
    sender: mpsc::UnboundedSender<BridgeMessage>,
    changes_tx: broadcast::Sender<Vec<Mutation>>,
}

impl BridgeClient {
    /// Hand a mutation to the bridge without waiting for it.
    pub fn enqueue(&self, mutation: Mutation) -> Result<(), PosError> {
        if mutation.kind.is_local_only() {
            return Ok(());
        }
        self.sender
            .send(BridgeMessage::Enqueue(mutation))
            .map_err(|_| PosError::BridgeClosed)
    }

    pub async fn flush(&self) -> Result<usize, PosError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(BridgeMessage::Flush { respond_to })
            .map_err(|_| PosError::BridgeClosed)?;
        response.await.map_err(|_| PosError::BridgeClosed)?
    }

    pub fn subscribe_server_changes(&self) -> broadcast::Receiver<Vec<Mutation>> {
        self.changes_tx.subscribe()
    }
}

/// Feed bridge broadcasts into a page's projector until cancelled.
pub fn spawn_page_listener(
    client: &BridgeClient,
    projector: Arc<StateProjector>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = client.subscribe_server_changes();
    tokio::spawn(async move {
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = rx.recv() => batch,
            };
            match batch {
                Ok(mut changes) => {
                    changes.sort_by_key(|m| m.server_assigned_at.unwrap_or(0));
                    for mutation in &changes {
                        if let Err(e) = projector.apply_remote(mutation) {
                            warn!(id = %mutation.id, error = %e, "Page failed to absorb bridge change");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Page listener lagged; the next sync round will catch up");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{self, Schema};
    use crate::models::MutationKind;
    use crate::server::MemoryServer;
    use serde_json::json;

    struct Harness {
        client: BridgeClient,
        store: ChangeLog,
        server: Arc<MemoryServer>,
        network: NetworkMonitor,
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    }

    fn harness(online: bool) -> Harness {
        let server = Arc::new(MemoryServer::new(Arc::new(ManualClock::new(1_000))));
        let store = ChangeLog::bridge(Arc::new(db::open_in_memory(Schema::Bridge).unwrap()));
        let network = NetworkMonitor::new(online);
        let (actor, client) = BridgeActor::new(
            store.clone(),
            server.clone(),
            &network,
            Role::Cashier,
            Duration::from_secs(30),
        );
        let cancel = CancellationToken::new();
        let handle = actor.spawn(cancel.clone());
        Harness {
            client,
            store,
            server,
            network,
            cancel,
            handle,
        }
    }

    fn add_order(id: &str) -> Mutation {
        Mutation::authored(
            MutationKind::AddOrder,
            json!({ "id": id, "items": [], "status": "pending", "createdAt": 1 }),
            1,
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_enqueue_is_delivered_and_removed() {
        let h = harness(true);
        h.client.enqueue(add_order("o1")).unwrap();
        settle().await;
        assert_eq!(h.server.orders().len(), 1);
        assert!(h.store.is_empty().unwrap());
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_enqueue_waits_for_connectivity() {
        let h = harness(false);
        h.client.enqueue(add_order("o1")).unwrap();
        h.client.enqueue(add_order("o2")).unwrap();
        settle().await;
        assert_eq!(h.server.exchange_count(), 0);
        assert_eq!(h.store.len().unwrap(), 2);

        h.network.set_online(true);
        settle().await;
        assert_eq!(h.server.orders().len(), 2);
        assert!(h.store.is_empty().unwrap());
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_queue_sends_nothing() {
        let h = harness(true);
        settle().await;
        assert_eq!(h.client.flush().await.unwrap(), 0);
        h.network.set_online(false);
        h.network.set_online(true);
        settle().await;
        assert_eq!(h.server.exchange_count(), 0);
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_retries_on_next_tick() {
        let h = harness(true);
        h.server.set_reachable(false);
        h.client.enqueue(add_order("o1")).unwrap();
        settle().await;
        assert_eq!(h.store.len().unwrap(), 1);

        h.server.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(h.store.is_empty().unwrap());
        assert_eq!(h.server.orders().len(), 1);
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pages_absorb_broadcast_changes() {
        let h = harness(true);
        let terminal = Arc::new(db::open_in_memory(Schema::Terminal).unwrap());
        let projector = Arc::new(StateProjector::new(terminal).unwrap());
        let listener = spawn_page_listener(&h.client, projector.clone(), h.cancel.clone());

        h.server.push_foreign(add_order("from-elsewhere")).unwrap();
        h.client.enqueue(add_order("mine")).unwrap();
        settle().await;

        let ids: Vec<String> = projector.orders().unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"from-elsewhere".to_string()));

        h.cancel.cancel();
        h.handle.await.unwrap();
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_bridge_reports_error() {
        let h = harness(true);
        h.cancel.cancel();
        h.handle.await.unwrap();
        assert!(matches!(
            h.client.enqueue(add_order("late")),
            Err(PosError::BridgeClosed)
        ));
    }
}
