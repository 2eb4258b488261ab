//! Signatures: the durable identity of one recurring class of errors.
//!
//! A [`Signature`] only changes through its transition methods. Status and
//! diagnosis live together in [`SignatureState`], so a `DIAGNOSED` signature
//! without a diagnosis (or a `NEW` one with a diagnosis) cannot be built.
//! Muting or resolving a diagnosed signature keeps the diagnosis attached;
//! retriage and regressions move it into `history`.

pub mod diagnosis;
pub mod fingerprint;

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use diagnosis::{Confidence, Diagnosis, DiagnosisError, Evidence};
pub use fingerprint::{Fingerprint, FingerprintError, Fingerprinter};

/// Recent trace ids kept per signature for evidence gathering.
pub const MAX_SAMPLE_TRACES: usize = 5;

/// Longest sample message kept on a signature, in characters.
pub const MAX_SAMPLE_MESSAGE: usize = 4096;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

/// A raw error as reported by the telemetry backend. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub error_type: String,
    pub message: String,
    pub service: String,
    /// Innermost frame first.
    #[serde(default)]
    pub stack: Vec<StackFrame>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Keys and statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid signature key '{0}': expected {len} hex characters", len = SignatureKey::LEN)]
pub struct InvalidKey(pub String);

/// Lowercase hex SHA-256 digest identifying a signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SignatureKey(String);

impl SignatureKey {
    pub const LEN: usize = 64;

    pub(crate) fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for logs and tables.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl FromStr for SignatureKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() != Self::LEN || !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(InvalidKey(s.to_string()));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for SignatureKey {
    type Error = InvalidKey;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SignatureKey> for String {
    fn from(key: SignatureKey) -> Self {
        key.0
    }
}

impl std::fmt::Display for SignatureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureStatus {
    New,
    Investigating,
    Diagnosed,
    Muted,
    Resolved,
}

impl SignatureStatus {
    pub const ALL: [SignatureStatus; 5] = [
        SignatureStatus::New,
        SignatureStatus::Investigating,
        SignatureStatus::Diagnosed,
        SignatureStatus::Muted,
        SignatureStatus::Resolved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureStatus::New => "NEW",
            SignatureStatus::Investigating => "INVESTIGATING",
            SignatureStatus::Diagnosed => "DIAGNOSED",
            SignatureStatus::Muted => "MUTED",
            SignatureStatus::Resolved => "RESOLVED",
        }
    }
}

impl std::fmt::Display for SignatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureStatus {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SignatureError::Invalid(format!("unknown status '{}'", s)))
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignatureError {
    #[error("signature does not exist")]
    Absent,
    #[error("cannot {action} a signature in status {from}")]
    IllegalTransition {
        from: SignatureStatus,
        action: &'static str,
    },
    #[error("investigation lease held since {since}")]
    LeaseHeld { since: DateTime<Utc> },
    #[error("investigation lease taken at {since} is not stale yet")]
    LeaseFresh { since: DateTime<Utc> },
    #[error("invalid signature record: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Status together with whatever the status owns.
#[derive(Debug, Clone, PartialEq)]
pub enum SignatureState {
    New,
    Investigating {
        since: DateTime<Utc>,
    },
    Diagnosed {
        diagnosis: Diagnosis,
    },
    Muted {
        diagnosis: Option<Diagnosis>,
    },
    Resolved {
        diagnosis: Option<Diagnosis>,
        at: DateTime<Utc>,
    },
}

impl SignatureState {
    pub fn status(&self) -> SignatureStatus {
        match self {
            SignatureState::New => SignatureStatus::New,
            SignatureState::Investigating { .. } => SignatureStatus::Investigating,
            SignatureState::Diagnosed { .. } => SignatureStatus::Diagnosed,
            SignatureState::Muted { .. } => SignatureStatus::Muted,
            SignatureState::Resolved { .. } => SignatureStatus::Resolved,
        }
    }

    pub fn diagnosis(&self) -> Option<&Diagnosis> {
        match self {
            SignatureState::Diagnosed { diagnosis } => Some(diagnosis),
            SignatureState::Muted { diagnosis } | SignatureState::Resolved { diagnosis, .. } => {
                diagnosis.as_ref()
            }
            SignatureState::New | SignatureState::Investigating { .. } => None,
        }
    }

    fn into_diagnosis(self) -> Option<Diagnosis> {
        match self {
            SignatureState::Diagnosed { diagnosis } => Some(diagnosis),
            SignatureState::Muted { diagnosis } | SignatureState::Resolved { diagnosis, .. } => {
                diagnosis
            }
            SignatureState::New | SignatureState::Investigating { .. } => None,
        }
    }
}

/// What a call to [`Signature::record_occurrence`] changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    /// `last_seen` moved forward.
    pub advanced: bool,
    /// A resolved signature came back and was reopened.
    pub regressed: bool,
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SignatureRecord", into = "SignatureRecord")]
pub struct Signature {
    key: SignatureKey,
    error_type: String,
    service: String,
    message_template: String,
    sample_message: String,
    occurrence_count: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    sample_trace_ids: Vec<String>,
    state: SignatureState,
    history: Vec<Diagnosis>,
    last_failure: Option<String>,
}

impl Signature {
    /// Build the signature for the first event seen with this fingerprint.
    pub fn first_sighting(fingerprint: &Fingerprint, event: &ErrorEvent) -> Self {
        let mut signature = Self {
            key: fingerprint.key.clone(),
            error_type: event.error_type.trim().to_string(),
            service: event.service.trim().to_string(),
            message_template: fingerprint.message_template.clone(),
            sample_message: event.message.chars().take(MAX_SAMPLE_MESSAGE).collect(),
            occurrence_count: 1,
            first_seen: event.timestamp,
            last_seen: event.timestamp,
            sample_trace_ids: Vec::new(),
            state: SignatureState::New,
            history: Vec::new(),
            last_failure: None,
        };
        if let Some(trace_id) = event.trace_id.as_deref() {
            signature.remember_trace(trace_id);
        }
        signature
    }

    pub fn key(&self) -> &SignatureKey {
        &self.key
    }

    pub fn error_type(&self) -> &str {
        &self.error_type
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn message_template(&self) -> &str {
        &self.message_template
    }

    pub fn sample_message(&self) -> &str {
        &self.sample_message
    }

    pub fn occurrence_count(&self) -> u64 {
        self.occurrence_count
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    pub fn sample_trace_ids(&self) -> &[String] {
        &self.sample_trace_ids
    }

    pub fn state(&self) -> &SignatureState {
        &self.state
    }

    pub fn status(&self) -> SignatureStatus {
        self.state.status()
    }

    pub fn diagnosis(&self) -> Option<&Diagnosis> {
        self.state.diagnosis()
    }

    /// Diagnoses displaced by retriage or regression, oldest first.
    pub fn history(&self) -> &[Diagnosis] {
        &self.history
    }

    /// Why the most recent investigation did not produce a diagnosis.
    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    pub fn investigating_since(&self) -> Option<DateTime<Utc>> {
        match self.state {
            SignatureState::Investigating { since } => Some(since),
            _ => None,
        }
    }

    /// Count one more sighting. `last_seen` only ever moves forward and
    /// `first_seen` only ever moves back, so out-of-order events keep
    /// `last_seen >= first_seen`. A resolved signature seen again after its
    /// resolution is reopened as `NEW`.
    pub fn record_occurrence(&mut self, seen_at: DateTime<Utc>, trace_id: Option<&str>) -> Occurrence {
        self.occurrence_count = self.occurrence_count.saturating_add(1);

        let advanced = seen_at > self.last_seen;
        if advanced {
            self.last_seen = seen_at;
        }
        if seen_at < self.first_seen {
            self.first_seen = seen_at;
        }
        if let Some(trace_id) = trace_id {
            self.remember_trace(trace_id);
        }

        let regressed = match &self.state {
            SignatureState::Resolved { at, .. } => seen_at > *at,
            _ => false,
        };
        if regressed {
            self.reopen();
        }

        Occurrence {
            advanced,
            regressed,
        }
    }

    /// Take the investigation lease: `NEW -> INVESTIGATING`.
    pub fn begin_investigation(&mut self, now: DateTime<Utc>) -> Result<(), SignatureError> {
        match &self.state {
            SignatureState::New => {
                self.state = SignatureState::Investigating { since: now };
                Ok(())
            }
            SignatureState::Investigating { since } => Err(SignatureError::LeaseHeld { since: *since }),
            other => Err(SignatureError::IllegalTransition {
                from: other.status(),
                action: "investigate",
            }),
        }
    }

    /// `INVESTIGATING -> DIAGNOSED`, attaching the diagnosis in the same step.
    pub fn complete_investigation(&mut self, diagnosis: Diagnosis) -> Result<(), SignatureError> {
        match &self.state {
            SignatureState::Investigating { .. } => {
                self.state = SignatureState::Diagnosed { diagnosis };
                self.last_failure = None;
                Ok(())
            }
            other => Err(SignatureError::IllegalTransition {
                from: other.status(),
                action: "attach a diagnosis to",
            }),
        }
    }

    /// `INVESTIGATING -> NEW` after a failed diagnosis attempt.
    pub fn abandon_investigation(&mut self, reason: impl Into<String>) -> Result<(), SignatureError> {
        match &self.state {
            SignatureState::Investigating { .. } => {
                self.state = SignatureState::New;
                self.last_failure = Some(reason.into());
                Ok(())
            }
            other => Err(SignatureError::IllegalTransition {
                from: other.status(),
                action: "abandon the investigation of",
            }),
        }
    }

    /// `INVESTIGATING -> NEW` for a lease nobody has touched in `stale_after`.
    pub fn release_stale_lease(
        &mut self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<(), SignatureError> {
        match &self.state {
            SignatureState::Investigating { since } if now - *since >= stale_after => {
                let held = now - *since;
                self.state = SignatureState::New;
                self.last_failure = Some(format!(
                    "investigation lease expired after {}s",
                    held.num_seconds()
                ));
                Ok(())
            }
            SignatureState::Investigating { since } => Err(SignatureError::LeaseFresh { since: *since }),
            other => Err(SignatureError::IllegalTransition {
                from: other.status(),
                action: "release the lease of",
            }),
        }
    }

    /// Returns `Ok(false)` when already muted.
    pub fn mute(&mut self) -> Result<bool, SignatureError> {
        match &self.state {
            SignatureState::Muted { .. } => Ok(false),
            SignatureState::Investigating { since } => Err(SignatureError::LeaseHeld { since: *since }),
            _ => {
                let previous = std::mem::replace(&mut self.state, SignatureState::New);
                self.state = SignatureState::Muted {
                    diagnosis: previous.into_diagnosis(),
                };
                Ok(true)
            }
        }
    }

    /// Returns `Ok(false)` when already resolved.
    pub fn resolve(&mut self, now: DateTime<Utc>) -> Result<bool, SignatureError> {
        match &self.state {
            SignatureState::Resolved { .. } => Ok(false),
            SignatureState::Investigating { since } => Err(SignatureError::LeaseHeld { since: *since }),
            _ => {
                let previous = std::mem::replace(&mut self.state, SignatureState::New);
                self.state = SignatureState::Resolved {
                    diagnosis: previous.into_diagnosis(),
                    at: now,
                };
                Ok(true)
            }
        }
    }

    /// Send the signature back to `NEW` so triage can pick it up again.
    /// Returns `Ok(false)` when it is already `NEW`.
    pub fn retriage(&mut self) -> Result<bool, SignatureError> {
        match &self.state {
            SignatureState::New => Ok(false),
            SignatureState::Investigating { since } => Err(SignatureError::LeaseHeld { since: *since }),
            _ => {
                self.reopen();
                self.last_failure = None;
                Ok(true)
            }
        }
    }

    fn reopen(&mut self) {
        let previous = std::mem::replace(&mut self.state, SignatureState::New);
        if let Some(diagnosis) = previous.into_diagnosis() {
            self.history.push(diagnosis);
        }
    }

    fn remember_trace(&mut self, trace_id: &str) {
        let trace_id = trace_id.trim();
        if trace_id.is_empty() {
            return;
        }
        self.sample_trace_ids.retain(|t| t != trace_id);
        self.sample_trace_ids.push(trace_id.to_string());
        if self.sample_trace_ids.len() > MAX_SAMPLE_TRACES {
            self.sample_trace_ids.remove(0);
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted form
// ---------------------------------------------------------------------------

/// Flat form of a [`Signature`] used by stores and the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub key: SignatureKey,
    pub status: SignatureStatus,
    pub error_type: String,
    pub service: String,
    pub message_template: String,
    pub sample_message: String,
    pub occurrence_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub sample_trace_ids: Vec<String>,
    #[serde(default)]
    pub diagnosis: Option<Diagnosis>,
    #[serde(default)]
    pub investigating_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<Diagnosis>,
    #[serde(default)]
    pub last_failure: Option<String>,
}

impl From<Signature> for SignatureRecord {
    fn from(s: Signature) -> Self {
        let status = s.state.status();
        let investigating_since = s.investigating_since();
        let resolved_at = match &s.state {
            SignatureState::Resolved { at, .. } => Some(*at),
            _ => None,
        };
        Self {
            key: s.key,
            status,
            error_type: s.error_type,
            service: s.service,
            message_template: s.message_template,
            sample_message: s.sample_message,
            occurrence_count: s.occurrence_count,
            first_seen: s.first_seen,
            last_seen: s.last_seen,
            sample_trace_ids: s.sample_trace_ids,
            diagnosis: s.state.into_diagnosis(),
            investigating_since,
            resolved_at,
            history: s.history,
            last_failure: s.last_failure,
        }
    }
}

impl TryFrom<SignatureRecord> for Signature {
    type Error = SignatureError;

    fn try_from(r: SignatureRecord) -> Result<Self, Self::Error> {
        if r.occurrence_count == 0 {
            return Err(SignatureError::Invalid("occurrence_count must be at least 1".into()));
        }
        if r.last_seen < r.first_seen {
            return Err(SignatureError::Invalid(format!(
                "last_seen {} precedes first_seen {}",
                r.last_seen, r.first_seen
            )));
        }

        let state = match (r.status, r.diagnosis) {
            (SignatureStatus::New, None) => SignatureState::New,
            (SignatureStatus::Investigating, None) => SignatureState::Investigating {
                since: r.investigating_since.ok_or_else(|| {
                    SignatureError::Invalid("INVESTIGATING without investigating_since".into())
                })?,
            },
            (SignatureStatus::Diagnosed, Some(diagnosis)) => SignatureState::Diagnosed { diagnosis },
            (SignatureStatus::Muted, diagnosis) => SignatureState::Muted { diagnosis },
            (SignatureStatus::Resolved, diagnosis) => SignatureState::Resolved {
                diagnosis,
                at: r.resolved_at.ok_or_else(|| {
                    SignatureError::Invalid("RESOLVED without resolved_at".into())
                })?,
            },
            (SignatureStatus::Diagnosed, None) => {
                return Err(SignatureError::Invalid("DIAGNOSED without a diagnosis".into()))
            }
            (status, Some(_)) => {
                return Err(SignatureError::Invalid(format!(
                    "{} signature cannot carry a diagnosis",
                    status
                )))
            }
        };

        Ok(Self {
            key: r.key,
            error_type: r.error_type,
            service: r.service,
            message_template: r.message_template,
            sample_message: r.sample_message,
            occurrence_count: r.occurrence_count,
            first_seen: r.first_seen,
            last_seen: r.last_seen,
            sample_trace_ids: r.sample_trace_ids,
            state,
            history: r.history,
            last_failure: r.last_failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(minute: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::minutes(minute)
    }

    fn sample() -> Signature {
        let event = ErrorEvent {
            error_type: "IOError".into(),
            message: "disk full".into(),
            service: "ingest".into(),
            stack: vec![],
            trace_id: Some("t-1".into()),
            span_id: None,
            timestamp: at(0),
        };
        let fp = Fingerprinter::default().fingerprint(&event).unwrap();
        Signature::first_sighting(&fp, &event)
    }

    fn diagnosis() -> Diagnosis {
        Diagnosis::new(
            "volume too small",
            vec![Evidence::new("log", "ENOSPC")],
            "grow the volume",
            Confidence::High,
            0.05,
            at(5),
        )
        .unwrap()
    }

    fn assert_invariants(s: &Signature) {
        assert!(s.occurrence_count() >= 1);
        assert!(s.last_seen() >= s.first_seen());
        match s.status() {
            SignatureStatus::New | SignatureStatus::Investigating => assert!(s.diagnosis().is_none()),
            SignatureStatus::Diagnosed => assert!(s.diagnosis().is_some()),
            SignatureStatus::Muted | SignatureStatus::Resolved => {}
        }
    }

    #[test]
    fn test_first_sighting() {
        let s = sample();
        assert_eq!(s.status(), SignatureStatus::New);
        assert_eq!(s.occurrence_count(), 1);
        assert_eq!(s.first_seen(), s.last_seen());
        assert_eq!(s.sample_trace_ids(), ["t-1".to_string()]);
        assert_invariants(&s);
    }

    #[test]
    fn test_out_of_order_occurrences_keep_invariants() {
        let mut s = sample();
        let o = s.record_occurrence(at(10), None);
        assert!(o.advanced);
        let o = s.record_occurrence(at(3), None);
        assert!(!o.advanced);
        assert_eq!(s.last_seen(), at(10));
        s.record_occurrence(at(-4), None);
        assert_eq!(s.first_seen(), at(-4));
        assert_eq!(s.last_seen(), at(10));
        assert_eq!(s.occurrence_count(), 4);
        assert_invariants(&s);
    }

    #[test]
    fn test_sample_traces_are_bounded_and_distinct() {
        let mut s = sample();
        for i in 0..10 {
            s.record_occurrence(at(i), Some(&format!("t-{}", i % 7)));
        }
        assert_eq!(s.sample_trace_ids().len(), MAX_SAMPLE_TRACES);
        assert_eq!(s.sample_trace_ids().last().unwrap(), "t-2");
    }

    #[test]
    fn test_investigation_lifecycle() {
        let mut s = sample();
        s.begin_investigation(at(1)).unwrap();
        assert_eq!(s.status(), SignatureStatus::Investigating);
        assert!(matches!(s.begin_investigation(at(2)), Err(SignatureError::LeaseHeld { .. })));
        assert_invariants(&s);

        s.complete_investigation(diagnosis()).unwrap();
        assert_eq!(s.status(), SignatureStatus::Diagnosed);
        assert_eq!(s.diagnosis().unwrap().root_cause(), "volume too small");
        assert_invariants(&s);
    }

    #[test]
    fn test_abandon_reverts_to_new() {
        let mut s = sample();
        s.begin_investigation(at(1)).unwrap();
        s.abandon_investigation("diagnosis timed out").unwrap();
        assert_eq!(s.status(), SignatureStatus::New);
        assert_eq!(s.last_failure(), Some("diagnosis timed out"));
        assert!(s.abandon_investigation("again").is_err());
    }

    #[test]
    fn test_diagnosis_requires_lease() {
        let mut s = sample();
        assert!(matches!(
            s.complete_investigation(diagnosis()),
            Err(SignatureError::IllegalTransition { from: SignatureStatus::New, .. })
        ));
        assert!(s.diagnosis().is_none());
    }

    #[test]
    fn test_stale_lease_release() {
        let mut s = sample();
        s.begin_investigation(at(0)).unwrap();
        assert!(matches!(
            s.release_stale_lease(at(5), Duration::minutes(30)),
            Err(SignatureError::LeaseFresh { .. })
        ));
        s.release_stale_lease(at(30), Duration::minutes(30)).unwrap();
        assert_eq!(s.status(), SignatureStatus::New);
        assert!(s.last_failure().unwrap().contains("expired"));
    }

    #[test]
    fn test_mute_is_idempotent_and_keeps_diagnosis() {
        let mut s = sample();
        s.begin_investigation(at(1)).unwrap();
        s.complete_investigation(diagnosis()).unwrap();
        assert!(s.mute().unwrap());
        assert!(!s.mute().unwrap());
        assert_eq!(s.status(), SignatureStatus::Muted);
        assert!(s.diagnosis().is_some());
    }

    #[test]
    fn test_management_transitions_refuse_held_lease() {
        let mut s = sample();
        s.begin_investigation(at(1)).unwrap();
        assert!(matches!(s.mute(), Err(SignatureError::LeaseHeld { .. })));
        assert!(matches!(s.resolve(at(2)), Err(SignatureError::LeaseHeld { .. })));
        assert!(matches!(s.retriage(), Err(SignatureError::LeaseHeld { .. })));
    }

    #[test]
    fn test_retriage_moves_diagnosis_to_history() {
        let mut s = sample();
        s.begin_investigation(at(1)).unwrap();
        s.complete_investigation(diagnosis()).unwrap();
        assert!(s.resolve(at(6)).unwrap());
        assert!(!s.resolve(at(7)).unwrap());
        assert!(s.retriage().unwrap());
        assert_eq!(s.status(), SignatureStatus::New);
        assert!(s.diagnosis().is_none());
        assert_eq!(s.history().len(), 1);
        assert!(!s.retriage().unwrap());
        assert_invariants(&s);
    }

    #[test]
    fn test_resolved_signature_regresses_on_recurrence() {
        let mut s = sample();
        s.resolve(at(10)).unwrap();
        let o = s.record_occurrence(at(8), None);
        assert!(!o.regressed);
        assert_eq!(s.status(), SignatureStatus::Resolved);
        let o = s.record_occurrence(at(11), None);
        assert!(o.regressed);
        assert_eq!(s.status(), SignatureStatus::New);
    }

    #[test]
    fn test_record_round_trip_rechecks_invariants() {
        let mut s = sample();
        s.begin_investigation(at(1)).unwrap();
        s.complete_investigation(diagnosis()).unwrap();
        let record = SignatureRecord::from(s.clone());
        assert_eq!(Signature::try_from(record.clone()).unwrap(), s);

        let mut bad = record.clone();
        bad.status = SignatureStatus::New;
        assert!(Signature::try_from(bad).is_err());

        let mut bad = record.clone();
        bad.diagnosis = None;
        assert!(Signature::try_from(bad).is_err());

        let mut bad = record.clone();
        bad.occurrence_count = 0;
        assert!(Signature::try_from(bad).is_err());

        let mut bad = record;
        bad.first_seen = bad.last_seen + Duration::seconds(1);
        assert!(Signature::try_from(bad).is_err());
    }

    #[test]
    fn test_key_parsing() {
        let key = sample().key().clone();
        let upper = key.as_str().to_ascii_uppercase();
        assert_eq!(upper.parse::<SignatureKey>().unwrap(), key);
        assert!("abc".parse::<SignatureKey>().is_err());
        assert!("z".repeat(64).parse::<SignatureKey>().is_err());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("muted".parse::<SignatureStatus>().unwrap(), SignatureStatus::Muted);
        assert!("gone".parse::<SignatureStatus>().is_err());
    }
}
