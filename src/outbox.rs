//! Append-only change log.
//!
//! The outbox is the source of truth for "did I tell the server yet": a
//! mutation is written here before any network attempt and only removed
//! once the server lists its id in `acceptedIds`. The background bridge
//! keeps a second instance of the same log in its own database.

use std::sync::Arc;

use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use crate::db::DbState;
use crate::error::PosError;
use crate::models::{Mutation, MutationKind};

const OUTBOX_TABLE: &str = "change_queue";
const BRIDGE_TABLE: &str = "bridge_queue";

#[derive(Clone)]
pub struct ChangeLog {
    db: Arc<DbState>,
    table: &'static str,
}

impl ChangeLog {
    /// The terminal's outbox.
    pub fn outbox(db: Arc<DbState>) -> Self {
        Self {
            db,
            table: OUTBOX_TABLE,
        }
    }

    /// The bridge's private copy, stored in the bridge database.
    pub fn bridge(db: Arc<DbState>) -> Self {
        Self {
            db,
            table: BRIDGE_TABLE,
        }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    /// Durably record a mutation.
    ///
    /// Returns `false` without writing when the id is already queued or the
    /// kind is local-only.
    pub fn append(&self, mutation: &Mutation) -> Result<bool, PosError> {
        if mutation.kind.is_local_only() {
            debug!(id = %mutation.id, kind = %mutation.kind, "Local-only mutation kept out of change log");
            return Ok(false);
        }

        let conn = self.db.lock()?;
        self.append_in(&conn, mutation)
    }

    /// Same as [`append`](Self::append) inside a caller-owned transaction, so
    /// a local effect and its log entry commit together.
    pub fn append_in(&self, conn: &Connection, mutation: &Mutation) -> Result<bool, PosError> {
        if mutation.kind.is_local_only() {
            return Ok(false);
        }

        let payload = serde_json::to_string(&mutation.payload)?;
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (id, kind, payload, authored_at, server_assigned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                self.table
            ),
            params![
                mutation.id,
                mutation.kind.as_str(),
                payload,
                mutation.authored_at,
                mutation.server_assigned_at
            ],
        )?;

        if inserted == 0 {
            debug!(id = %mutation.id, table = self.table, "Duplicate mutation ignored");
            return Ok(false);
        }

        debug!(id = %mutation.id, kind = %mutation.kind, table = self.table, "Mutation appended");
        Ok(true)
    }

    /// Everything not yet acknowledged, in append order.
    pub fn pending(&self) -> Result<Vec<Mutation>, PosError> {
        let conn = self.db.lock()?;
        self.pending_in(&conn)
    }

    pub fn pending_in(&self, conn: &Connection) -> Result<Vec<Mutation>, PosError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, kind, payload, authored_at, server_assigned_at
             FROM {} ORDER BY seq ASC",
            self.table
        ))?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<i64>>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, kind, payload, authored_at, server_assigned_at) = row?;
            match serde_json::from_str(&payload) {
                Ok(payload) => out.push(Mutation {
                    id,
                    kind: MutationKind::parse(&kind),
                    payload,
                    authored_at,
                    server_assigned_at,
                }),
                Err(e) => warn!(
                    id = %id,
                    table = self.table,
                    error = %e,
                    "Skipping unreadable change log row; it stays queued and is counted in the sync summary"
                ),
            }
        }
        Ok(out)
    }

    /// Remove every entry whose id is in `ids`. Unknown ids are ignored.
    pub fn acknowledge(&self, ids: &[String]) -> Result<usize, PosError> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let removed = self.acknowledge_in(&tx, ids)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Same as [`acknowledge`](Self::acknowledge) inside a caller-owned transaction.
    pub fn acknowledge_in(&self, conn: &Connection, ids: &[String]) -> Result<usize, PosError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut stmt = conn.prepare(&format!("DELETE FROM {} WHERE id = ?1", self.table))?;
        let mut removed = 0;
        for id in ids {
            removed += stmt.execute(params![id])?;
        }
        if removed > 0 {
            info!(removed, table = self.table, "Acknowledged mutations removed");
        }
        Ok(removed)
    }

    pub fn len(&self) -> Result<usize, PosError> {
        let conn = self.db.lock()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    /// Rows whose payload no longer parses. [`pending`](Self::pending) skips
    /// them, so they are never pushed or acknowledged and need an operator.
    pub fn unreadable(&self) -> Result<usize, PosError> {
        let conn = self.db.lock()?;
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE json_valid(payload) = 0",
                self.table
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool, PosError> {
        Ok(self.len()? == 0)
    }
}
