//! Investigator: run one diagnosis for one signature.
//!
//! The `INVESTIGATING` status is the lease. It is persisted before anything
//! expensive happens, and every exit path either attaches the diagnosis or
//! hands the lease back, unless the store itself fails, in which case the
//! error says exactly which write was lost:
//!
//! * claim failed: [`InvestigateError::ClaimFailed`], nothing was spent.
//! * diagnosis failed and the revert failed: [`InvestigateError::Stuck`],
//!   left for [`reconcile_stale_leases`].
//! * diagnosis succeeded but could not be attached:
//!   [`InvestigateError::PersistDiagnosis`], which carries the diagnosis so
//!   [`Investigator::persist_diagnosis`] can retry the write.

pub mod reconcile;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::budget::{BudgetExhausted, BudgetLedger, Reservation};
use crate::config::FaultlineConfig;
use crate::daemon::RetryPolicy;
use crate::diagnose::{DiagnoseError, DiagnosisCapability, DiagnosisContext};
use crate::notify::{NotificationSink, NotifyError};
use crate::signature::{Diagnosis, Signature, SignatureError, SignatureKey, SignatureStatus};
use crate::storage::{transition, SignatureStore, StoreError, UpdateError};
use crate::telemetry::{TelemetrySource, TraceTree};

pub use reconcile::{reconcile_stale_leases, ReconcileReport};

#[derive(Debug, Error)]
pub enum InvestigateError {
    #[error(transparent)]
    BudgetExhausted(#[from] BudgetExhausted),
    #[error("signature {} is already under investigation (since {since})", .key.short())]
    LeaseHeld {
        key: SignatureKey,
        since: chrono::DateTime<Utc>,
    },
    #[error("signature {} is not eligible for investigation: {reason}", .key.short())]
    NotEligible {
        key: SignatureKey,
        reason: SignatureError,
    },
    #[error("signature {} not found", .key.short())]
    NotFound { key: SignatureKey },
    #[error("could not claim signature {} for investigation: {source}", .key.short())]
    ClaimFailed {
        key: SignatureKey,
        #[source]
        source: StoreError,
    },
    #[error("diagnosis of signature {} failed: {source}", .key.short())]
    Diagnosis {
        key: SignatureKey,
        #[source]
        source: DiagnoseError,
    },
    #[error("signature {} left INVESTIGATING after {cause}: {source}", .key.short())]
    Stuck {
        key: SignatureKey,
        cause: String,
        #[source]
        source: StoreError,
    },
    #[error("diagnosis of signature {} completed but was not persisted: {source}", .key.short())]
    PersistDiagnosis {
        key: SignatureKey,
        diagnosis: Box<Diagnosis>,
        #[source]
        source: UpdateError,
    },
    #[error("investigation of signature {} interrupted by shutdown", .key.short())]
    Interrupted { key: SignatureKey },
}

#[derive(Debug, Clone)]
pub struct InvestigatorSettings {
    pub max_traces: usize,
    pub trace_timeout: Duration,
    pub diagnosis_timeout: Duration,
    /// Applied to unreachable-capability failures and to notification.
    pub retry: RetryPolicy,
}

impl Default for InvestigatorSettings {
    fn default() -> Self {
        Self {
            max_traces: 3,
            trace_timeout: Duration::from_secs(10),
            diagnosis_timeout: Duration::from_secs(300),
            retry: RetryPolicy::none(),
        }
    }
}

impl InvestigatorSettings {
    pub fn from_config(config: &FaultlineConfig) -> Self {
        Self {
            max_traces: config.investigation.max_traces,
            trace_timeout: config.investigation.trace_timeout(),
            diagnosis_timeout: config.diagnosis.timeout(),
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

#[derive(Debug)]
pub struct InvestigationReport {
    pub run_id: Uuid,
    /// The signature as persisted, `DIAGNOSED`.
    pub signature: Signature,
    pub diagnosis: Diagnosis,
    /// Trace ids that could not be resolved.
    pub context_gaps: Vec<String>,
    /// Set when the notification sink failed; the diagnosis is kept.
    pub notify_error: Option<NotifyError>,
}

pub struct Investigator {
    store: Arc<dyn SignatureStore>,
    telemetry: Arc<dyn TelemetrySource>,
    diagnoser: Arc<dyn DiagnosisCapability>,
    notifier: Arc<dyn NotificationSink>,
    budget: Arc<BudgetLedger>,
    settings: InvestigatorSettings,
}

impl Investigator {
    pub fn new(
        store: Arc<dyn SignatureStore>,
        telemetry: Arc<dyn TelemetrySource>,
        diagnoser: Arc<dyn DiagnosisCapability>,
        notifier: Arc<dyn NotificationSink>,
        budget: Arc<BudgetLedger>,
        settings: InvestigatorSettings,
    ) -> Self {
        Self {
            store,
            telemetry,
            diagnoser,
            notifier,
            budget,
            settings,
        }
    }

    pub fn budget(&self) -> Arc<BudgetLedger> {
        self.budget.clone()
    }

    pub async fn investigate(
        &self,
        key: &SignatureKey,
        token: &CancellationToken,
    ) -> Result<InvestigationReport, InvestigateError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("investigation", run_id = %run_id, key = %key.short());
        self.run(run_id, key, token).instrument(span).await
    }

    async fn run(
        &self,
        run_id: Uuid,
        key: &SignatureKey,
        token: &CancellationToken,
    ) -> Result<InvestigationReport, InvestigateError> {
        let reservation = self.budget.reserve(Utc::now()).await?;

        let signature = match self.claim(key) {
            Ok(signature) => signature,
            Err(e) => {
                self.budget.release(reservation).await;
                return Err(e);
            }
        };
        info!(
            service = %signature.service(),
            occurrences = signature.occurrence_count(),
            "investigation started"
        );

        if token.is_cancelled() {
            return self.checkpoint(key, reservation).await;
        }

        let (traces, context_gaps) = self.gather_traces(&signature).await;
        if !context_gaps.is_empty() {
            warn!(
                requested = traces.len() + context_gaps.len(),
                unresolved = ?context_gaps,
                "proceeding with partial trace context"
            );
        }

        if token.is_cancelled() {
            return self.checkpoint(key, reservation).await;
        }

        let context = DiagnosisContext::new(&signature, traces, context_gaps.clone());
        let diagnoser = self.diagnoser.as_ref();
        let context = &context;
        let max_cost = reservation.amount();
        let timeout = self.settings.diagnosis_timeout;
        let outcome = self
            .settings
            .retry
            .run("diagnose", token, move || async move {
                match tokio::time::timeout(timeout, diagnoser.diagnose(context, max_cost)).await {
                    Ok(result) => result,
                    Err(_) => Err(DiagnoseError::Timeout(timeout)),
                }
            })
            .await;

        match outcome {
            Ok(diagnosis) => {
                let diagnosis = diagnosis.with_context_gaps(context_gaps.clone());
                self.budget
                    .settle(reservation, key, diagnosis.cost_usd(), "diagnosed", Utc::now())
                    .await;
                let signature = match self.persist_diagnosis(key, diagnosis.clone()) {
                    Ok(signature) => signature,
                    Err(source) => {
                        error!(
                            cost_usd = diagnosis.cost_usd(),
                            error = %source,
                            "diagnosis produced but could not be persisted"
                        );
                        return Err(InvestigateError::PersistDiagnosis {
                            key: key.clone(),
                            diagnosis: Box::new(diagnosis),
                            source,
                        });
                    }
                };
                info!(
                    confidence = %diagnosis.confidence(),
                    cost_usd = diagnosis.cost_usd(),
                    context_complete = diagnosis.context_complete(),
                    "signature diagnosed"
                );

                let notify_error = self.announce(&signature, &diagnosis, token).await;
                Ok(InvestigationReport {
                    run_id,
                    signature,
                    diagnosis,
                    context_gaps,
                    notify_error,
                })
            }
            Err(failure) => {
                let charge = failure.charge(reservation.amount());
                self.budget
                    .settle(reservation, key, charge, failure.kind(), Utc::now())
                    .await;
                let reason = format!("diagnosis failed ({}): {}", failure.kind(), failure);
                warn!(kind = failure.kind(), error = %failure, "diagnosis failed, reverting to NEW");
                self.revert(key, &reason)?;
                Err(InvestigateError::Diagnosis {
                    key: key.clone(),
                    source: failure,
                })
            }
        }
    }

    /// Attach a completed diagnosis. Also the retry path for
    /// [`InvestigateError::PersistDiagnosis`]: a lease released in the
    /// meantime is re-taken so the paid-for diagnosis is not lost.
    pub fn persist_diagnosis(&self, key: &SignatureKey, diagnosis: Diagnosis) -> Result<Signature, UpdateError> {
        transition(self.store.as_ref(), key, |signature| {
            if signature.status() == SignatureStatus::New {
                signature.begin_investigation(Utc::now())?;
            }
            signature.complete_investigation(diagnosis.clone())
        })
    }

    /// Send a persisted diagnosis to the notification sink, retrying
    /// unreachable or 5xx sinks. Failure is logged and returned, never undone.
    pub async fn announce(
        &self,
        signature: &Signature,
        diagnosis: &Diagnosis,
        token: &CancellationToken,
    ) -> Option<NotifyError> {
        let notifier = self.notifier.as_ref();
        match self
            .settings
            .retry
            .run("notify", token, move || notifier.notify(signature, diagnosis))
            .await
        {
            Ok(()) => None,
            Err(e) => {
                warn!(key = %signature.key().short(), error = %e, "notification failed, diagnosis kept");
                Some(e)
            }
        }
    }

    fn claim(&self, key: &SignatureKey) -> Result<Signature, InvestigateError> {
        let now = Utc::now();
        transition(self.store.as_ref(), key, |signature| signature.begin_investigation(now)).map_err(|e| match e {
            UpdateError::Store(source) => {
                error!(error = %source, "failed to persist investigation lease, diagnosis skipped");
                InvestigateError::ClaimFailed {
                    key: key.clone(),
                    source,
                }
            }
            UpdateError::Rejected(SignatureError::Absent) => InvestigateError::NotFound { key: key.clone() },
            UpdateError::Rejected(SignatureError::LeaseHeld { since }) => InvestigateError::LeaseHeld {
                key: key.clone(),
                since,
            },
            UpdateError::Rejected(reason) => InvestigateError::NotEligible {
                key: key.clone(),
                reason,
            },
        })
    }

    /// Most recent sample traces first, each fetch under its own timeout.
    async fn gather_traces(&self, signature: &Signature) -> (Vec<TraceTree>, Vec<String>) {
        let mut traces = Vec::new();
        let mut gaps = Vec::new();
        for trace_id in signature
            .sample_trace_ids()
            .iter()
            .rev()
            .take(self.settings.max_traces)
        {
            match tokio::time::timeout(self.settings.trace_timeout, self.telemetry.fetch_trace(trace_id)).await {
                Ok(Ok(Some(tree))) => traces.push(tree),
                Ok(Ok(None)) => {
                    warn!(trace_id = %trace_id, "trace not found");
                    gaps.push(trace_id.clone());
                }
                Ok(Err(e)) => {
                    warn!(trace_id = %trace_id, error = %e, "trace fetch failed");
                    gaps.push(trace_id.clone());
                }
                Err(_) => {
                    warn!(trace_id = %trace_id, timeout = ?self.settings.trace_timeout, "trace fetch timed out");
                    gaps.push(trace_id.clone());
                }
            }
        }
        (traces, gaps)
    }

    /// Hand the lease back because of shutdown.
    async fn checkpoint(
        &self,
        key: &SignatureKey,
        reservation: Reservation,
    ) -> Result<InvestigationReport, InvestigateError> {
        self.budget.release(reservation).await;
        info!("shutdown requested, releasing investigation lease");
        self.revert(key, "investigation interrupted by shutdown")?;
        Err(InvestigateError::Interrupted { key: key.clone() })
    }

    /// `INVESTIGATING -> NEW`. Only a store failure is an error: a lease that
    /// is already gone needs no revert.
    fn revert(&self, key: &SignatureKey, reason: &str) -> Result<(), InvestigateError> {
        match transition(self.store.as_ref(), key, |signature| signature.abandon_investigation(reason)) {
            Ok(_) => Ok(()),
            Err(UpdateError::Rejected(e)) => {
                warn!(error = %e, "lease no longer held, nothing to revert");
                Ok(())
            }
            Err(UpdateError::Store(source)) => {
                error!(
                    cause = reason,
                    error = %source,
                    "failed to revert signature, it stays INVESTIGATING until reconciled"
                );
                Err(InvestigateError::Stuck {
                    key: key.clone(),
                    cause: reason.to_string(),
                    source,
                })
            }
        }
    }
}
