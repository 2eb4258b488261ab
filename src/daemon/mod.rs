//! The control loop: reconcile, poll, investigate, sleep.
//!
//! Everything the loop touches lives in an explicit [`DaemonContext`], and
//! shutdown is the context's [`CancellationToken`]. One tick runs at a time
//! and investigations within a tick run one after another.

pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FaultlineConfig;
use crate::investigate::{reconcile_stale_leases, InvestigateError, Investigator};
use crate::poll::{merge_backlog, PollService};
use crate::storage::SignatureStore;
use crate::telemetry::TelemetrySource;

pub use retry::{RetryPolicy, Transient};

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub interval: Duration,
    pub lookback: Duration,
    pub max_per_cycle: usize,
    pub stale_after: chrono::Duration,
}

impl DaemonSettings {
    pub fn from_config(config: &FaultlineConfig) -> Self {
        Self {
            interval: config.poll.interval(),
            lookback: config.telemetry.lookback(),
            max_per_cycle: config.investigation.max_per_cycle,
            stale_after: config.investigation.stale_after(),
        }
    }
}

pub struct DaemonContext {
    pub store: Arc<dyn SignatureStore>,
    pub telemetry: Arc<dyn TelemetrySource>,
    pub poll: PollService,
    pub investigator: Investigator,
    pub retry: RetryPolicy,
    pub settings: DaemonSettings,
    pub token: CancellationToken,
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub leases_released: usize,
    /// The poll failed after retries; nothing was investigated.
    pub poll_failed: bool,
    pub events: usize,
    pub event_failures: usize,
    /// Signatures past the notify threshold in this batch, logged at warning.
    pub high_priority: usize,
    /// This batch's candidates plus stored `NEW` signatures triage flags.
    pub candidates: usize,
    pub diagnosed: usize,
    pub failed: usize,
    pub budget_exhausted: bool,
    pub interrupted: bool,
}

/// Run ticks every `settings.interval` until the token is cancelled.
pub async fn run(ctx: &DaemonContext) {
    info!(
        interval_secs = ctx.settings.interval.as_secs(),
        lookback_secs = ctx.settings.lookback.as_secs(),
        max_per_cycle = ctx.settings.max_per_cycle,
        "daemon loop started"
    );

    let mut interval = tokio::time::interval(ctx.settings.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.token.cancelled() => break,
            _ = interval.tick() => {}
        }
        let report = tick(ctx).await;
        debug!(?report, "tick complete");
        if report.interrupted {
            break;
        }
    }

    info!("daemon loop stopped");
}

pub async fn tick(ctx: &DaemonContext) -> TickReport {
    let mut report = TickReport::default();

    match reconcile_stale_leases(ctx.store.as_ref(), ctx.settings.stale_after, Utc::now()) {
        Ok(r) => report.leases_released = r.released.len(),
        Err(e) => error!(error = %e, "stale lease reconciliation failed"),
    }

    let poll = &ctx.poll;
    let telemetry = ctx.telemetry.as_ref();
    let token = &ctx.token;
    let lookback = ctx.settings.lookback;
    let cycle = match ctx
        .retry
        .run("poll", token, move || poll.poll(telemetry, lookback, token))
        .await
    {
        Ok(cycle) => cycle,
        Err(e) => {
            error!(error = %e, "poll failed, skipping this tick");
            report.poll_failed = true;
            return report;
        }
    };

    report.events = cycle.received;
    report.event_failures = cycle.failures.len();
    report.high_priority = cycle.notify.len();
    report.interrupted = cycle.interrupted;

    if cycle.is_degraded() {
        warn!(
            processed = cycle.processed(),
            failed = cycle.failures.len(),
            "poll cycle partially failed"
        );
    }
    info!(
        events = cycle.received,
        created = cycle.created,
        updated = cycle.updated,
        regressed = cycle.regressed,
        candidates = cycle.candidates.len(),
        "poll cycle complete"
    );
    for hot in &cycle.notify {
        warn!(key = %hot.key.short(), priority = hot.priority, "high-priority signature");
    }

    let mut candidates = cycle.candidates;
    match ctx.poll.backlog() {
        Ok(backlog) => merge_backlog(&mut candidates, backlog),
        Err(e) => warn!(error = %e, "could not list pending signatures, using this batch only"),
    }
    report.candidates = candidates.len();

    for candidate in candidates.iter().take(ctx.settings.max_per_cycle) {
        if token.is_cancelled() {
            report.interrupted = true;
            break;
        }

        match ctx.investigator.investigate(&candidate.key, token).await {
            Ok(_) => report.diagnosed += 1,
            Err(InvestigateError::BudgetExhausted(_)) => {
                report.budget_exhausted = true;
                break;
            }
            Err(InvestigateError::Interrupted { .. }) => {
                report.interrupted = true;
                break;
            }
            Err(
                e @ (InvestigateError::LeaseHeld { .. }
                | InvestigateError::NotEligible { .. }
                | InvestigateError::NotFound { .. }),
            ) => debug!(error = %e, "candidate skipped"),
            Err(InvestigateError::PersistDiagnosis { key, diagnosis, source }) => {
                warn!(key = %key.short(), error = %source, "retrying diagnosis persistence");
                let investigator = &ctx.investigator;
                let key = &key;
                let diagnosis = diagnosis.as_ref();
                match ctx
                    .retry
                    .run("persist diagnosis", token, move || async move {
                        investigator.persist_diagnosis(key, diagnosis.clone())
                    })
                    .await
                {
                    Ok(signature) => {
                        info!(key = %key.short(), "diagnosis persisted on retry");
                        investigator.announce(&signature, diagnosis, token).await;
                        report.diagnosed += 1;
                    }
                    Err(e) => {
                        error!(
                            key = %key.short(),
                            root_cause = %diagnosis.root_cause(),
                            cost_usd = diagnosis.cost_usd(),
                            error = %e,
                            "diagnosis lost after retries"
                        );
                        report.failed += 1;
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "investigation failed");
                report.failed += 1;
            }
        }
    }

    report
}
