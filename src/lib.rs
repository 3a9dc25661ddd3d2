//! pos-sync: local-first order sync and print scheduling for POS terminals.
//!
//! Each terminal keeps its own SQLite store. Local edits are applied
//! immediately, recorded in an outbox and exchanged with the origin server by
//! the reconciler loop. A background bridge pushes them eagerly when online,
//! and the print scheduler drains the shared print queue for the printers this
//! terminal's role owns.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod bridge;
pub mod clock;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod menu;
pub mod models;
pub mod network;
pub mod outbox;
pub mod print;
pub mod projector;
pub mod reconciler;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod service;

use crate::api::HttpTransport;
use crate::clock::SystemClock;
use crate::config::TerminalConfig;
use crate::print::FileRenderer;
use crate::runtime::TerminalRuntime;

/// Console plus daily rolling file logging. The returned guard flushes the
/// file writer when dropped.
pub fn init_tracing(config: &TerminalConfig) -> anyhow::Result<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pos_sync_lib=debug"));

    let log_dir = config.log_dir();
    diagnostics::prune_old_logs(&log_dir);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("creating log dir {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let (json_layer, text_layer) = if config.log_json {
        (Some(fmt::layer().json().with_writer(non_blocking)), None)
    } else {
        let layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true);
        (None, Some(layer))
    };
    let console_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(guard)
}

/// Process entry point: run one terminal until Ctrl-C.
pub fn run() -> anyhow::Result<()> {
    let config = TerminalConfig::from_env();
    let _guard = init_tracing(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        sha = env!("BUILD_GIT_SHA"),
        role = %config.role,
        data_dir = %config.data_dir.display(),
        "Starting pos-sync"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async move {
        let transport = Arc::new(HttpTransport::new(&config.api_base_url)?);
        let renderer = Arc::new(FileRenderer::new(&config.data_dir));
        let terminal =
            TerminalRuntime::start(config, transport, Arc::new(SystemClock), renderer).await?;

        tokio::signal::ctrl_c()
            .await
            .context("waiting for Ctrl-C")?;

        terminal.shutdown().await;
        info!("pos-sync stopped");
        Ok(())
    })
}
