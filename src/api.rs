//! Origin server API client.
//!
//! [`SyncTransport`] is the seam between the engine and the server: the
//! reconciler and the background bridge only ever talk through it. The
//! production implementation is [`HttpTransport`] (JSON over HTTP); tests
//! and local demos use the in-process [`crate::server::MemoryServer`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::config::normalize_api_url;
use crate::error::PosError;
use crate::models::{Product, SyncRequest, SyncResponse};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// One push+pull exchange. The server persists every incoming change
    /// before computing the response.
    async fn exchange(&self, request: &SyncRequest) -> Result<SyncResponse, PosError>;

    /// Current product catalogue, used to seed an empty product cache.
    async fn fetch_products(&self) -> Result<Vec<Product>, PosError>;

    /// Advisory reachability check.
    async fn probe(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> PosError {
    if err.is_connect() {
        return PosError::Http(format!("Cannot reach server at {url}"));
    }
    if err.is_timeout() {
        return PosError::Http(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return PosError::Http(format!("Invalid server URL: {url}"));
    }
    if err.is_decode() {
        return PosError::Protocol(format!("Invalid JSON from {url}: {err}"));
    }
    PosError::Http(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> PosError {
    match status.as_u16() {
        404 => PosError::Protocol("Sync endpoint not found".to_string()),
        s if s >= 500 => PosError::Http(format!("Server error (HTTP {s})")),
        s => PosError::Protocol(format!("Unexpected response from server (HTTP {s})")),
    }
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

pub struct HttpTransport {
    base: String,
    client: Client,
    probe_client: Client,
}

impl HttpTransport {
    pub fn new(api_base_url: &str) -> Result<Self, PosError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| PosError::Http(format!("Failed to create HTTP client: {e}")))?;
        let probe_client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| PosError::Http(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base: normalize_api_url(api_base_url),
            client,
            probe_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn exchange(&self, request: &SyncRequest) -> Result<SyncResponse, PosError> {
        let url = format!("{}/sync", self.base);
        let started = Instant::now();

        let resp = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if !body.trim().is_empty() {
                warn!(status = status.as_u16(), body = %body.trim(), "Sync request rejected");
            }
            return Err(status_error(status));
        }

        let body: SyncResponse = resp
            .json()
            .await
            .map_err(|e| friendly_error(&self.base, &e))?;

        debug!(
            pushed = request.changes.len(),
            accepted = body.accepted_ids.len(),
            pulled = body.server_changes.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "Sync exchange completed"
        );
        Ok(body)
    }

    async fn fetch_products(&self) -> Result<Vec<Product>, PosError> {
        let url = format!("{}/products", self.base);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base, &e))?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }
        resp.json()
            .await
            .map_err(|e| friendly_error(&self.base, &e))
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/products", self.base);
        match self.probe_client.head(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
