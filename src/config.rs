//! Terminal configuration.
//!
//! Read once from the environment at process start. Every field has a
//! default so an unconfigured terminal still boots as a `generic` role
//! pointed at a local server.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::PrintDestination;

pub const DEFAULT_API_URL: &str = "http://localhost:5000";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 15;
const DEFAULT_PRINT_INTERVAL_SECS: u64 = 6;
const DEFAULT_PRINT_LATENCY_MS: u64 = 3_000;
const DEFAULT_DONE_GRACE_MS: u64 = 2_000;
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Cashier,
    Kitchen,
    Serving,
    Manager,
    Generic,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Cashier => "cashier",
            Role::Kitchen => "kitchen",
            Role::Serving => "serving",
            Role::Manager => "manager",
            Role::Generic => "generic",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cashier" => Some(Role::Cashier),
            "kitchen" => Some(Role::Kitchen),
            "serving" => Some(Role::Serving),
            "manager" => Some(Role::Manager),
            "generic" => Some(Role::Generic),
            _ => None,
        }
    }

    /// Print destinations this terminal is physically able to serve.
    pub fn print_destinations(&self) -> &'static [PrintDestination] {
        match self {
            Role::Cashier | Role::Serving => &[PrintDestination::Receipt],
            Role::Kitchen => &[PrintDestination::Kitchen],
            Role::Manager | Role::Generic => {
                &[PrintDestination::Receipt, PrintDestination::Kitchen]
            }
        }
    }

    pub fn can_print(&self, destination: PrintDestination) -> bool {
        self.print_destinations().contains(&destination)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    pub role: Role,
    pub api_base_url: String,
    pub data_dir: PathBuf,
    pub sync_interval: Duration,
    pub print_interval: Duration,
    /// Simulated device I/O time per print job.
    pub print_latency: Duration,
    /// How long a `done` job stays visible before it is deleted.
    pub done_grace: Duration,
    pub probe_interval: Duration,
    pub log_json: bool,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            role: Role::Generic,
            api_base_url: DEFAULT_API_URL.to_string(),
            data_dir: default_data_dir(),
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            print_interval: Duration::from_secs(DEFAULT_PRINT_INTERVAL_SECS),
            print_latency: Duration::from_millis(DEFAULT_PRINT_LATENCY_MS),
            done_grace: Duration::from_millis(DEFAULT_DONE_GRACE_MS),
            probe_interval: Duration::from_secs(DEFAULT_PROBE_INTERVAL_SECS),
            log_json: false,
        }
    }
}

impl TerminalConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let role = match env::var("POS_ROLE") {
            Ok(raw) => Role::parse(&raw).unwrap_or_else(|| {
                warn!(role = %raw, "Unknown POS_ROLE, falling back to generic");
                Role::Generic
            }),
            Err(_) => defaults.role,
        };

        let api_base_url = env::var("POS_API_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| normalize_api_url(&v))
            .unwrap_or(defaults.api_base_url);

        let data_dir = env::var("POS_DATA_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        Self {
            role,
            api_base_url,
            data_dir,
            sync_interval: env_secs("POS_SYNC_INTERVAL_SECS").unwrap_or(defaults.sync_interval),
            print_interval: env_secs("POS_PRINT_INTERVAL_SECS").unwrap_or(defaults.print_interval),
            print_latency: env_millis("POS_PRINT_LATENCY_MS").unwrap_or(defaults.print_latency),
            done_grace: env_millis("POS_DONE_GRACE_MS").unwrap_or(defaults.done_grace),
            probe_interval: env_secs("POS_PROBE_INTERVAL_SECS").unwrap_or(defaults.probe_interval),
            log_json: env::var("POS_LOG_JSON")
                .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
        }
    }

    /// Terminal database. Named per role so several terminals can share a
    /// data dir on one machine.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}_pos.db", self.role))
    }

    pub fn bridge_db_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}_bridge.db", self.role))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "Ignoring malformed numeric setting");
            None
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    env_u64(key).filter(|v| *v > 0).map(Duration::from_secs)
}

fn env_millis(key: &str) -> Option<Duration> {
    env_u64(key).map(Duration::from_millis)
}

fn default_data_dir() -> PathBuf {
    let base = env::var("XDG_DATA_HOME")
        .or_else(|_| env::var("LOCALAPPDATA"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(env::var("HOME").unwrap_or_else(|_| ".".into()))
                .join(".local")
                .join("share")
        });
    base.join("pos-sync")
}

/// Normalise the server URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
pub fn normalize_api_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}
