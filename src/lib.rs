//! Faultline -- deduplicate recurring production errors into signatures and
//! diagnose the ones that matter.
//!
//! This crate provides the signature lifecycle, the fingerprint and triage
//! engines, the poll/investigate control loop, and the management API.

pub mod api;
pub mod budget;
pub mod config;
pub mod daemon;
pub mod diagnose;
pub mod investigate;
pub mod manage;
pub mod notify;
pub mod poll;
pub mod signature;
pub mod storage;
pub mod telemetry;
pub mod triage;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::budget::BudgetLedger;
use crate::config::FaultlineConfig;
use crate::daemon::{DaemonContext, DaemonSettings, RetryPolicy};
use crate::diagnose::HttpDiagnosisClient;
use crate::investigate::{Investigator, InvestigatorSettings};
use crate::manage::ManagementService;
use crate::notify::NotificationSink;
use crate::poll::PollService;
use crate::signature::Fingerprinter;
use crate::storage::{Pool, SignatureStore, SqliteSignatureStore, SqliteSpendJournal};
use crate::telemetry::HttpTelemetrySource;

/// Open the configured database, creating its directory if needed.
pub fn open_storage(config: &FaultlineConfig) -> Result<Pool> {
    let db_path = &config.storage.db_path;
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }
    let path = db_path
        .to_str()
        .with_context(|| format!("database path is not valid UTF-8: {}", db_path.display()))?;
    tracing::info!(db_path = %path, "Initializing database");
    storage::open_pool(path)
}

/// Wire the HTTP adapters and SQLite store into a daemon context.
pub fn build_daemon(config: &FaultlineConfig, pool: Pool, token: CancellationToken) -> Result<DaemonContext> {
    let store: Arc<dyn SignatureStore> = Arc::new(SqliteSignatureStore::new(pool.clone()));
    let journal = Arc::new(SqliteSpendJournal::new(pool));
    let budget = Arc::new(BudgetLedger::with_journal(config.budget.clone(), journal, Utc::now()));

    let telemetry = Arc::new(HttpTelemetrySource::new(&config.telemetry)?);
    let diagnoser = Arc::new(HttpDiagnosisClient::new(&config.diagnosis)?);
    let notifier: Arc<dyn NotificationSink> = Arc::from(notify::from_config(&config.notify)?);

    let poll = PollService::new(
        store.clone(),
        Fingerprinter::new(config.poll.max_stack_frames),
        config.triage.clone(),
    );
    let investigator = Investigator::new(
        store.clone(),
        telemetry.clone(),
        diagnoser,
        notifier,
        budget,
        InvestigatorSettings::from_config(config),
    );

    Ok(DaemonContext {
        store,
        telemetry,
        poll,
        investigator,
        retry: RetryPolicy::from_config(&config.retry),
        settings: DaemonSettings::from_config(config),
        token,
    })
}

/// Start the Faultline daemon: control loop and management API, until
/// Ctrl-C.
pub async fn serve(config: FaultlineConfig) -> Result<()> {
    let token = CancellationToken::new();
    let pool = open_storage(&config)?;
    let ctx = build_daemon(&config, pool, token.clone())?;

    let state = api::state::AppState {
        manage: ManagementService::new(ctx.store.clone()),
        budget: Some(ctx.investigator.budget()),
    };

    let signal_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl-C, shutting down"),
        }
        signal_token.cancel();
    });

    let daemon = tokio::spawn(async move {
        daemon::run(&ctx).await;
    });

    if config.api.enabled {
        let addr: std::net::SocketAddr = config
            .api
            .bind
            .parse()
            .with_context(|| format!("invalid API bind address '{}'", config.api.bind))?;
        let app = api::router(state);

        tracing::info!(%addr, "Faultline API listening");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let shutdown = token.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
    }

    daemon.await.context("daemon task panicked")?;
    tracing::info!("Faultline stopped");
    Ok(())
}
