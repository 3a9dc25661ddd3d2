//! Diagnostics.
//!
//! Provides:
//! - **About info**: version, git SHA, platform
//! - **Terminal health**: sync summary, print queue counts, schema version
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::db::DbState;
use crate::error::PosError;
use crate::models::PrintJob;
use crate::reconciler::SyncSummary;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix used by the rolling appender.
pub const LOG_FILE_PREFIX: &str = "pos";

pub fn about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub role: String,
    pub schema_version: i64,
    pub sync: SyncSummary,
    /// Print jobs by status.
    pub print_jobs: BTreeMap<String, usize>,
}

pub fn health_report(
    db: &DbState,
    role: &str,
    sync: SyncSummary,
    jobs: &[PrintJob],
) -> Result<HealthReport, PosError> {
    let schema_version: i64 = db.lock()?.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    let mut print_jobs = BTreeMap::new();
    for job in jobs {
        *print_jobs.entry(job.status.as_str().to_string()).or_insert(0) += 1;
    }

    Ok(HealthReport {
        role: role.to_string(),
        schema_version,
        sync,
        print_jobs,
    })
}

/// Keep only the newest [`MAX_LOG_FILES`] log files in `log_dir`.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(std::path::PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, Schema};
    use crate::models::{PrintDestination, PrintJobStatus, SyncStatus};

    #[test]
    fn test_about_info_has_required_fields() {
        let info = about_info();
        assert!(info["version"].is_string());
        assert!(info["gitSha"].is_string());
        assert!(info["platform"].is_string());
    }

    #[test]
    fn test_health_report_counts_jobs_by_status() {
        let db = db::open_in_memory(Schema::Terminal).unwrap();
        let job = |id: &str, status| PrintJob {
            id: id.into(),
            order_id: "o1".into(),
            destination: PrintDestination::Receipt,
            priority: 1,
            content: String::new(),
            attempts: 0,
            status,
            seq: 1,
            created_at: 0,
            started_at: None,
            finished_at: None,
            last_error: None,
        };
        let sync = SyncSummary {
            status: SyncStatus::Idle,
            is_online: true,
            pending_changes: 0,
            unreadable_changes: 0,
            last_sync_at: 0,
            last_error: None,
            last_success_at: None,
        };
        let report = health_report(
            &db,
            "cashier",
            sync,
            &[
                job("a", PrintJobStatus::Queued),
                job("b", PrintJobStatus::Queued),
                job("c", PrintJobStatus::Error),
            ],
        )
        .unwrap();
        assert_eq!(report.schema_version, 2);
        assert_eq!(report.print_jobs.get("queued"), Some(&2));
        assert_eq!(report.print_jobs.get("error"), Some(&1));

        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["sync"]["status"], "idle");
        assert_eq!(v["printJobs"]["queued"], 2);
    }

    #[test]
    fn test_prune_keeps_newest_logs() {
        let dir = std::env::temp_dir().join(format!("pos-logs-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        for i in 0..(MAX_LOG_FILES + 3) {
            fs::write(dir.join(format!("pos.2026-01-{:02}", i + 1)), "x").unwrap();
        }
        fs::write(dir.join("unrelated.txt"), "keep").unwrap();

        assert_eq!(prune_old_logs(&dir), 3);
        let remaining = fs::read_dir(&dir).unwrap().count();
        assert_eq!(remaining, MAX_LOG_FILES + 1);
        let _ = fs::remove_dir_all(dir);
    }
}
