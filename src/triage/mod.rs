//! Triage: decide which signatures deserve a (costly) diagnosis.
//!
//! [`decide`] is a pure function of the signature, the policy and the current
//! time. Priority mixes a saturating frequency component, a bucketed recency
//! component and a per-error-type weight.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::saturating_delta;
use crate::signature::{Signature, SignatureStatus};

/// How long ago a signature was last seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecencyBucket {
    /// Within `recent_window` (inclusive).
    Recent,
    /// Within `stale_after` (inclusive).
    Today,
    Stale,
}

impl RecencyBucket {
    pub fn weight(&self) -> f64 {
        match self {
            RecencyBucket::Recent => 1.0,
            RecencyBucket::Today => 0.5,
            RecencyBucket::Stale => 0.0,
        }
    }
}

/// Weight applied when the error type contains `needle` (case-insensitive).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityRule {
    pub needle: String,
    pub weight: f64,
}

/// Thresholds and weights for [`decide`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriagePolicy {
    /// Occurrences needed before a signature may be investigated.
    pub min_occurrences: u64,
    /// Occurrence count at which the frequency component saturates.
    pub frequency_saturation: u64,
    /// Share of the score taken by frequency; the rest goes to recency.
    pub frequency_share: f64,
    pub recent_window_secs: u64,
    pub stale_after_secs: u64,
    pub investigate_threshold: f64,
    pub notify_threshold: f64,
    pub default_weight: f64,
    /// First matching rule wins.
    pub severity_rules: Vec<SeverityRule>,
}

impl Default for TriagePolicy {
    fn default() -> Self {
        Self {
            min_occurrences: 3,
            frequency_saturation: 100,
            frequency_share: 0.6,
            recent_window_secs: 3600,
            stale_after_secs: 86_400,
            investigate_threshold: 40.0,
            notify_threshold: 70.0,
            default_weight: 1.0,
            severity_rules: vec![
                SeverityRule {
                    needle: "panic".to_string(),
                    weight: 1.5,
                },
                SeverityRule {
                    needle: "outofmemory".to_string(),
                    weight: 1.5,
                },
                SeverityRule {
                    needle: "timeout".to_string(),
                    weight: 1.2,
                },
                SeverityRule {
                    needle: "warning".to_string(),
                    weight: 0.5,
                },
            ],
        }
    }
}

impl TriagePolicy {
    pub fn recent_window(&self) -> Duration {
        saturating_delta(self.recent_window_secs)
    }

    pub fn stale_after(&self) -> Duration {
        saturating_delta(self.stale_after_secs)
    }

    /// Saturating frequency component in `[0, 1]`, non-decreasing in `count`.
    pub fn frequency(&self, count: u64) -> f64 {
        let saturation = self.frequency_saturation.max(1) as f64;
        ((count as f64).ln_1p() / saturation.ln_1p()).min(1.0)
    }

    pub fn recency(&self, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> RecencyBucket {
        // A last_seen in the future (clock skew) counts as "just now".
        let age = (now - last_seen).max(Duration::zero());
        if age <= self.recent_window() {
            RecencyBucket::Recent
        } else if age <= self.stale_after() {
            RecencyBucket::Today
        } else {
            RecencyBucket::Stale
        }
    }

    pub fn weight_for(&self, error_type: &str) -> f64 {
        let error_type = error_type.to_ascii_lowercase();
        self.severity_rules
            .iter()
            .find(|rule| error_type.contains(&rule.needle.to_ascii_lowercase()))
            .map(|rule| rule.weight)
            .unwrap_or(self.default_weight)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TriageDecision {
    pub investigate: bool,
    pub notify: bool,
    pub priority: f64,
    pub recency: RecencyBucket,
}

pub fn decide(signature: &Signature, policy: &TriagePolicy, now: DateTime<Utc>) -> TriageDecision {
    let recency = policy.recency(signature.last_seen(), now);
    let frequency = policy.frequency(signature.occurrence_count());
    let share = policy.frequency_share.clamp(0.0, 1.0);
    let weight = policy.weight_for(signature.error_type()).max(0.0);
    let priority = weight * (share * frequency + (1.0 - share) * recency.weight()) * 100.0;

    let (investigate, notify) = match signature.status() {
        SignatureStatus::New => (
            signature.occurrence_count() >= policy.min_occurrences
                && recency != RecencyBucket::Stale
                && priority >= policy.investigate_threshold,
            priority >= policy.notify_threshold,
        ),
        SignatureStatus::Diagnosed => (false, priority >= policy.notify_threshold),
        SignatureStatus::Investigating | SignatureStatus::Muted | SignatureStatus::Resolved => {
            (false, false)
        }
    };

    TriageDecision {
        investigate,
        notify,
        priority,
        recency,
    }
}
