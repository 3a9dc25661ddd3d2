//! Online/offline signal.
//!
//! The flag is advisory: it gates whether the reconciler bothers to try and
//! wakes the background bridge when connectivity returns. A round that
//! starts while online can still fail, and that is handled as any other
//! transient error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::SyncTransport;

#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        Self {
            tx: Arc::new(watch::channel(initially_online).0),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the flag. Subscribers are only woken on an actual change.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            if online {
                info!("Network restored");
            } else {
                info!("Network offline; deferring remote sync and keeping queue pending");
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Periodically probe the server and feed the result into the flag.
    pub fn spawn_probe(
        &self,
        transport: Arc<dyn SyncTransport>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let online = transport.probe().await;
                        monitor.set_online(online);
                    }
                }
            }
            info!("Network probe stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::server::MemoryServer;

    #[test]
    fn test_set_online_notifies_only_on_change() {
        let monitor = NetworkMonitor::new(true);
        let mut rx = monitor.subscribe();
        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());
        monitor.set_online(false);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
        assert!(!monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_tracks_server_reachability() {
        let server = Arc::new(MemoryServer::new(Arc::new(ManualClock::new(0))));
        let monitor = NetworkMonitor::new(true);
        let cancel = CancellationToken::new();
        let handle = monitor.spawn_probe(server.clone(), Duration::from_secs(10), cancel.clone());

        server.set_reachable(false);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!monitor.is_online());

        server.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(monitor.is_online());

        cancel.cancel();
        handle.await.unwrap();
    }
}
