//! Poll service: fold a batch of error events into signatures and pick the
//! ones worth investigating.
//!
//! Each event is one transactional read-modify-write on the store, so events
//! for the same key are applied one after another and never race. A failure
//! on one event is recorded and the batch moves on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::signature::{
    ErrorEvent, FingerprintError, Fingerprinter, Occurrence, Signature, SignatureError, SignatureKey,
    SignatureStatus,
};
use crate::storage::{SignatureFilter, SignatureStore, StoreError, UpdateError};
use crate::telemetry::{TelemetryError, TelemetrySource};
use crate::triage::{self, TriagePolicy};

#[derive(Debug, Error)]
pub enum PollError {
    #[error("malformed event: {0}")]
    Fingerprint(#[from] FingerprintError),
    #[error("stored signature rejected the occurrence: {0}")]
    Rejected(SignatureError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<UpdateError> for PollError {
    fn from(e: UpdateError) -> Self {
        match e {
            UpdateError::Rejected(e) => PollError::Rejected(e),
            UpdateError::Store(e) => PollError::Store(e),
        }
    }
}

/// One event that could not be folded in.
#[derive(Debug)]
pub struct EventFailure {
    /// Position of the event in the batch.
    pub index: usize,
    /// Known once the event fingerprinted.
    pub key: Option<SignatureKey>,
    pub error: PollError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub key: SignatureKey,
    pub priority: f64,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub received: usize,
    pub created: usize,
    pub updated: usize,
    /// Resolved signatures that came back.
    pub regressed: usize,
    pub failures: Vec<EventFailure>,
    /// Signatures to investigate, highest priority first, one entry per key.
    pub candidates: Vec<Candidate>,
    /// Signatures whose priority crossed the notify threshold. Surfaced as a
    /// warning and a tick counter; the notification sink only receives fresh
    /// diagnoses.
    pub notify: Vec<Candidate>,
    /// Shutdown was requested before the batch finished.
    pub interrupted: bool,
    /// Events left unprocessed because of shutdown.
    pub skipped: usize,
}

impl CycleReport {
    pub fn processed(&self) -> usize {
        self.created + self.updated
    }

    /// Some events failed even though the cycle completed.
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

enum Applied {
    Created,
    Updated(Occurrence),
}

pub struct PollService {
    store: Arc<dyn SignatureStore>,
    fingerprinter: Fingerprinter,
    policy: TriagePolicy,
}

impl PollService {
    pub fn new(store: Arc<dyn SignatureStore>, fingerprinter: Fingerprinter, policy: TriagePolicy) -> Self {
        Self {
            store,
            fingerprinter,
            policy,
        }
    }

    pub fn policy(&self) -> &TriagePolicy {
        &self.policy
    }

    /// Fetch recent errors and fold them in.
    pub async fn poll(
        &self,
        source: &dyn TelemetrySource,
        lookback: Duration,
        token: &CancellationToken,
    ) -> Result<CycleReport, TelemetryError> {
        let events = source.fetch_recent_errors(lookback).await?;
        Ok(self.run_cycle(events, token))
    }

    pub fn run_cycle(&self, events: Vec<ErrorEvent>, token: &CancellationToken) -> CycleReport {
        self.run_cycle_at(events, token, Utc::now())
    }

    /// [`run_cycle`](Self::run_cycle) with triage evaluated at `now`.
    pub fn run_cycle_at(&self, events: Vec<ErrorEvent>, token: &CancellationToken, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport {
            received: events.len(),
            ..CycleReport::default()
        };
        // Latest triage outcome per key; later events supersede earlier ones.
        let mut decisions: HashMap<SignatureKey, triage::TriageDecision> = HashMap::new();

        for (index, event) in events.iter().enumerate() {
            if token.is_cancelled() {
                report.interrupted = true;
                report.skipped = events.len() - index;
                info!(
                    processed = index,
                    skipped = report.skipped,
                    "shutdown requested, stopping poll cycle"
                );
                break;
            }

            match self.apply(event) {
                Ok((signature, applied)) => {
                    match applied {
                        Applied::Created => report.created += 1,
                        Applied::Updated(occurrence) => {
                            report.updated += 1;
                            if occurrence.regressed {
                                report.regressed += 1;
                                warn!(
                                    key = %signature.key().short(),
                                    service = %signature.service(),
                                    "resolved signature recurred, reopened"
                                );
                            }
                        }
                    }
                    let decision = triage::decide(&signature, &self.policy, now);
                    decisions.insert(signature.key().clone(), decision);
                }
                Err((key, err)) => {
                    error!(
                        index,
                        key = key.as_ref().map(|k| k.short()).unwrap_or("-"),
                        service = %event.service,
                        error = %err,
                        "failed to process error event"
                    );
                    report.failures.push(EventFailure {
                        index,
                        key,
                        error: err,
                    });
                }
            }
        }

        for (key, decision) in decisions {
            let candidate = Candidate {
                key,
                priority: decision.priority,
            };
            if decision.notify {
                report.notify.push(candidate.clone());
            }
            if decision.investigate {
                report.candidates.push(candidate);
            }
        }
        sort_by_priority(&mut report.candidates);
        sort_by_priority(&mut report.notify);

        debug!(
            received = report.received,
            created = report.created,
            updated = report.updated,
            failed = report.failures.len(),
            candidates = report.candidates.len(),
            "poll cycle complete"
        );
        report
    }

    /// Stored `NEW` signatures that triage flags at `now`, highest priority
    /// first. Covers retriaged signatures and failed diagnoses that saw no
    /// event in the current batch.
    pub fn backlog_at(&self, now: DateTime<Utc>) -> Result<Vec<Candidate>, StoreError> {
        let pending = self.store.list(&SignatureFilter::status(SignatureStatus::New))?;
        let mut candidates: Vec<Candidate> = pending
            .iter()
            .filter_map(|signature| {
                let decision = triage::decide(signature, &self.policy, now);
                decision.investigate.then(|| Candidate {
                    key: signature.key().clone(),
                    priority: decision.priority,
                })
            })
            .collect();
        sort_by_priority(&mut candidates);
        Ok(candidates)
    }

    pub fn backlog(&self) -> Result<Vec<Candidate>, StoreError> {
        self.backlog_at(Utc::now())
    }

    fn apply(&self, event: &ErrorEvent) -> Result<(Signature, Applied), (Option<SignatureKey>, PollError)> {
        let fp = self
            .fingerprinter
            .fingerprint(event)
            .map_err(|e| (None, PollError::from(e)))?;

        let mut applied = None;
        let signature = self
            .store
            .update(&fp.key, &mut |current| {
                Ok(match current {
                    None => {
                        applied = Some(Applied::Created);
                        Signature::first_sighting(&fp, event)
                    }
                    Some(mut signature) => {
                        let occurrence =
                            signature.record_occurrence(event.timestamp, event.trace_id.as_deref());
                        applied = Some(Applied::Updated(occurrence));
                        signature
                    }
                })
            })
            .map_err(|e| (Some(fp.key.clone()), PollError::from(e)))?;

        let applied = applied.unwrap_or(Applied::Created);
        Ok((signature, applied))
    }
}

/// Add `backlog` entries whose key is not already in `candidates`, then
/// restore priority order.
pub fn merge_backlog(candidates: &mut Vec<Candidate>, backlog: Vec<Candidate>) {
    for entry in backlog {
        if !candidates.iter().any(|c| c.key == entry.key) {
            candidates.push(entry);
        }
    }
    sort_by_priority(candidates);
}

fn sort_by_priority(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.priority
            .total_cmp(&a.priority)
            .then_with(|| a.key.cmp(&b.key))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{open_in_memory, transition, Mutation, SqliteSignatureStore, StoreOp};

    fn event(message: &str, at: DateTime<Utc>) -> ErrorEvent {
        ErrorEvent {
            error_type: "PaymentDeclined".into(),
            message: message.into(),
            service: "billing".into(),
            stack: vec![],
            trace_id: None,
            span_id: None,
            timestamp: at,
        }
    }

    fn service(store: Arc<dyn SignatureStore>) -> PollService {
        PollService::new(store, Fingerprinter::default(), TriagePolicy::default())
    }

    fn sqlite() -> Arc<SqliteSignatureStore> {
        Arc::new(SqliteSignatureStore::new(open_in_memory().unwrap()))
    }

    #[test]
    fn test_uuid_variants_collapse_into_one_signature() {
        let store = sqlite();
        let now = Utc::now();
        let events = vec![
            event("order 3f2b8c1e-0d9a-4e57-9b1c-1a2b3c4d5e6f declined", now - chrono::Duration::minutes(4)),
            event("order 7A1C9E22-55B0-4F0D-8E3A-ABCDEF012345 declined", now - chrono::Duration::minutes(2)),
            event("order 00000000-1111-2222-3333-444444444444 declined", now),
        ];
        let report = service(store.clone()).run_cycle_at(events, &CancellationToken::new(), now);

        assert_eq!(report.created, 1);
        assert_eq!(report.updated, 2);
        assert!(!report.is_degraded());

        let all = store.list(&SignatureFilter::default()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].occurrence_count(), 3);
        assert_eq!(all[0].status(), SignatureStatus::New);

        assert_eq!(report.candidates.len(), 1);
        assert_eq!(&report.candidates[0].key, all[0].key());
    }

    #[test]
    fn test_malformed_event_does_not_abort_cycle() {
        let store = sqlite();
        let now = Utc::now();
        let mut bad = event("whatever", now);
        bad.service = "  ".into();
        let report = service(store.clone()).run_cycle_at(
            vec![event("first", now), bad, event("first", now)],
            &CancellationToken::new(),
            now,
        );

        assert_eq!(report.processed(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert!(report.failures[0].key.is_none());
        assert!(matches!(report.failures[0].error, PollError::Fingerprint(_)));
    }

    struct BrokenStore;

    impl SignatureStore for BrokenStore {
        fn get(&self, key: &SignatureKey) -> Result<Option<Signature>, StoreError> {
            Err(StoreError::new(StoreOp::Read, Some(key), "disk I/O error"))
        }

        fn upsert(&self, signature: &Signature) -> Result<(), StoreError> {
            Err(StoreError::new(StoreOp::Update, Some(signature.key()), "disk I/O error"))
        }

        fn list(&self, _filter: &SignatureFilter) -> Result<Vec<Signature>, StoreError> {
            Err(StoreError::new(StoreOp::List, None, "disk I/O error"))
        }

        fn update(&self, key: &SignatureKey, _mutate: Mutation<'_>) -> Result<Signature, UpdateError> {
            Err(StoreError::new(StoreOp::Read, Some(key), "disk I/O error").into())
        }
    }

    #[test]
    fn test_store_failures_are_aggregated_per_event() {
        let now = Utc::now();
        let report = service(Arc::new(BrokenStore)).run_cycle_at(
            vec![event("a", now), event("b 1", now)],
            &CancellationToken::new(),
            now,
        );
        assert_eq!(report.processed(), 0);
        assert_eq!(report.failures.len(), 2);
        for failure in &report.failures {
            assert!(failure.key.is_some());
            match &failure.error {
                PollError::Store(e) => assert_eq!(e.op, StoreOp::Read),
                other => panic!("unexpected error {other:?}"),
            }
        }
    }

    #[test]
    fn test_cancelled_cycle_skips_remaining_events() {
        let store = sqlite();
        let token = CancellationToken::new();
        token.cancel();
        let now = Utc::now();
        let report = service(store.clone()).run_cycle_at(vec![event("a", now), event("b", now)], &token, now);
        assert!(report.interrupted);
        assert_eq!(report.skipped, 2);
        assert!(store.list(&SignatureFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_candidates_sorted_by_priority() {
        let store = sqlite();
        let now = Utc::now();
        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(event("card expired", now));
        }
        for _ in 0..40 {
            events.push(event("gateway unreachable", now));
        }
        let report = service(store).run_cycle_at(events, &CancellationToken::new(), now);
        assert_eq!(report.candidates.len(), 2);
        assert!(report.candidates[0].priority > report.candidates[1].priority);
    }

    #[test]
    fn test_backlog_includes_retriaged_signature_without_new_events() {
        let store = sqlite();
        let now = Utc::now();
        let poll = service(store.clone());
        let events = vec![event("card expired", now), event("card expired", now), event("card expired", now)];
        let first = poll.run_cycle_at(events, &CancellationToken::new(), now);
        let key = first.candidates[0].key.clone();

        transition(store.as_ref(), &key, |s| s.mute().map(|_| ())).unwrap();
        assert!(poll.backlog_at(now).unwrap().is_empty());
        transition(store.as_ref(), &key, |s| s.retriage().map(|_| ())).unwrap();

        let quiet = poll.run_cycle_at(Vec::new(), &CancellationToken::new(), now);
        assert!(quiet.candidates.is_empty());
        let backlog = poll.backlog_at(now).unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].key, key);
    }

    #[test]
    fn test_backlog_skips_signatures_below_min_occurrences() {
        let store = sqlite();
        let now = Utc::now();
        let poll = service(store);
        poll.run_cycle_at(vec![event("card expired", now)], &CancellationToken::new(), now);
        assert!(poll.backlog_at(now).unwrap().is_empty());
    }

    #[test]
    fn test_merge_backlog_dedupes_and_orders() {
        let key = |c: char| c.to_string().repeat(SignatureKey::LEN).parse::<SignatureKey>().unwrap();
        let mut candidates = vec![Candidate {
            key: key('a'),
            priority: 50.0,
        }];
        merge_backlog(
            &mut candidates,
            vec![
                Candidate {
                    key: key('b'),
                    priority: 90.0,
                },
                Candidate {
                    key: key('a'),
                    priority: 10.0,
                },
            ],
        );
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].key, key('b'));
        assert_eq!(candidates[1].priority, 50.0);
    }
}
