//! Foreground sync reconciler.
//!
//! One round pushes the whole outbox, pulls everything the server logged
//! after our watermark, and folds it into local state. The local side of a
//! round (acknowledge, apply, watermark) commits in a single SQLite
//! transaction, so a failed round leaves the outbox, entity state and
//! watermark exactly as they were and the next tick simply retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::SyncTransport;
use crate::clock::Clock;
use crate::config::Role;
use crate::error::PosError;
use crate::models::{Mutation, SyncRequest, SyncStatus};
use crate::network::NetworkMonitor;
use crate::outbox::ChangeLog;
use crate::projector::{ApplyOutcome, Changed, Origin, StateProjector};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Offline, or another round was already running.
    Skipped,
    Synced {
        pushed: usize,
        acknowledged: usize,
        applied: usize,
        last_sync_at: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub status: SyncStatus,
    pub is_online: bool,
    pub pending_changes: usize,
    /// Queued rows that can no longer be decoded and are never sent.
    pub unreadable_changes: usize,
    pub last_sync_at: i64,
    pub last_error: Option<String>,
    pub last_success_at: Option<i64>,
}

#[derive(Default)]
struct RoundRecord {
    last_error: Option<String>,
    last_success_at: Option<i64>,
}

pub struct SyncReconciler {
    projector: Arc<StateProjector>,
    outbox: ChangeLog,
    transport: Arc<dyn SyncTransport>,
    network: NetworkMonitor,
    role: Role,
    clock: Arc<dyn Clock>,
    status_tx: watch::Sender<SyncStatus>,
    in_flight: AtomicBool,
    record: Mutex<RoundRecord>,
}

impl SyncReconciler {
    pub fn new(
        projector: Arc<StateProjector>,
        outbox: ChangeLog,
        transport: Arc<dyn SyncTransport>,
        network: NetworkMonitor,
        role: Role,
        clock: Arc<dyn Clock>,
    ) -> Self {
        debug_assert!(
            Arc::ptr_eq(projector.db(), outbox.db()),
            "outbox and projector must share the terminal store"
        );
        Self {
            projector,
            outbox,
            transport,
            network,
            role,
            clock,
            status_tx: watch::channel(SyncStatus::Idle).0,
            in_flight: AtomicBool::new(false),
            record: Mutex::new(RoundRecord::default()),
        }
    }

    pub fn status(&self) -> SyncStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub fn last_sync_at(&self) -> Result<i64, PosError> {
        read_watermark(&*self.projector.db().lock()?)
    }

    pub fn summary(&self) -> Result<SyncSummary, PosError> {
        let (last_error, last_success_at) = {
            let record = self.record.lock()?;
            (record.last_error.clone(), record.last_success_at)
        };
        Ok(SyncSummary {
            status: self.status(),
            is_online: self.network.is_online(),
            pending_changes: self.outbox.len()?,
            unreadable_changes: self.outbox.unreadable()?,
            last_sync_at: self.last_sync_at()?,
            last_error,
            last_success_at,
        })
    }

    /// Run a round right now instead of waiting for the next tick.
    pub async fn sync_now(&self) -> Result<RoundOutcome, PosError> {
        self.run_round().await
    }

    /// Spawn the periodic loop. The first round runs immediately.
    pub fn start(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = every.as_secs(), role = %self.role, "Sync loop started");
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.run_round().await {
                            Ok(RoundOutcome::Synced { applied, pushed, .. }) if applied > 0 || pushed > 0 => {
                                info!(pushed, applied, "Sync cycle complete");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Sync cycle failed"),
                        }
                    }
                }
            }
            info!("Sync loop stopped");
        })
    }

    pub async fn run_round(&self) -> Result<RoundOutcome, PosError> {
        if !self.network.is_online() {
            debug!("Offline; sync round skipped");
            return Ok(RoundOutcome::Skipped);
        }
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("Sync round already in flight");
            return Ok(RoundOutcome::Skipped);
        }

        let _round = RoundGuard { reconciler: self };
        self.set_status(SyncStatus::Syncing);
        let result = self.exchange_and_commit().await;

        match &result {
            Ok(_) => {
                if let Ok(mut record) = self.record.lock() {
                    record.last_error = None;
                    record.last_success_at = Some(self.clock.now_ms());
                }
                self.set_status(SyncStatus::Idle);
            }
            Err(e) => {
                if let Ok(mut record) = self.record.lock() {
                    record.last_error = Some(e.to_string());
                }
                self.set_status(SyncStatus::Error);
            }
        }
        result
    }

    async fn exchange_and_commit(&self) -> Result<RoundOutcome, PosError> {
        let (changes, last_sync_at) = {
            let conn = self.projector.db().lock()?;
            (self.outbox.pending_in(&conn)?, read_watermark(&conn)?)
        };

        let request = SyncRequest {
            changes,
            last_sync_at,
            role: self.role.as_str().to_string(),
        };
        let response = self.transport.exchange(&request).await?;

        let server_changes = order_for_apply(response.server_changes)?;

        let (acknowledged, applied, watermark, changed) = {
            let mut conn = self.projector.db().lock()?;
            let tx = conn.transaction()?;

            let acknowledged = self.outbox.acknowledge_in(&tx, &response.accepted_ids)?;

            let mut applied = 0;
            let mut changed = Changed::default();
            let mut max_seen = last_sync_at;
            for mutation in &server_changes {
                let (outcome, touched) = self.projector.apply_in(&tx, mutation, Origin::Remote)?;
                if outcome == ApplyOutcome::Applied {
                    applied += 1;
                }
                changed.merge(touched);
                max_seen = max_seen.max(mutation.server_assigned_at.unwrap_or(0));
            }

            let watermark = read_watermark(&tx)?.max(max_seen);
            write_watermark(&tx, watermark)?;
            tx.commit()?;
            (acknowledged, applied, watermark, changed)
        };

        self.projector.publish(changed)?;

        debug!(
            pushed = request.changes.len(),
            acknowledged,
            pulled = server_changes.len(),
            applied,
            last_sync_at = watermark,
            "Sync round committed"
        );

        Ok(RoundOutcome::Synced {
            pushed: request.changes.len(),
            acknowledged,
            applied,
            last_sync_at: watermark,
        })
    }

    fn set_status(&self, status: SyncStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

/// Releases the in-flight slot however the round ends. A round dropped
/// mid-exchange (timeout, `select!`) leaves nothing committed, so it is
/// reported as a failed round.
struct RoundGuard<'a> {
    reconciler: &'a SyncReconciler,
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        let r = self.reconciler;
        if r.status() == SyncStatus::Syncing {
            warn!("Sync round cancelled before completing");
            if let Ok(mut record) = r.record.lock() {
                record.last_error = Some("sync round cancelled".to_string());
            }
            r.set_status(SyncStatus::Error);
        }
        r.in_flight.store(false, Ordering::SeqCst);
    }
}

/// Validate and sort pulled changes by server time. `sort_by_key` is stable,
/// so equal stamps keep the server's log order.
fn order_for_apply(mut changes: Vec<Mutation>) -> Result<Vec<Mutation>, PosError> {
    if let Some(bad) = changes.iter().find(|m| m.server_assigned_at.is_none()) {
        return Err(PosError::Protocol(format!(
            "server change {} has no server timestamp",
            bad.id
        )));
    }
    changes.sort_by_key(|m| m.server_assigned_at.unwrap_or(0));
    Ok(changes)
}

pub(crate) fn read_watermark(conn: &Connection) -> Result<i64, PosError> {
    Ok(conn.query_row(
        "SELECT last_sync_at FROM sync_meta WHERE id = 1",
        [],
        |row| row.get(0),
    )?)
}

fn write_watermark(conn: &Connection, value: i64) -> Result<(), PosError> {
    conn.execute(
        "UPDATE sync_meta SET last_sync_at = ?1, updated_at = datetime('now') WHERE id = 1",
        params![value],
    )?;
    Ok(())
}
