//! Diagnosis values produced by the diagnosis capability.
//!
//! A [`Diagnosis`] is immutable once built and can only be built through
//! [`Diagnosis::new`], which rejects a diagnosis without supporting evidence.
//! Deserialization goes through the same constructor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DiagnosisError {
    #[error("diagnosis must cite at least one piece of evidence")]
    EmptyEvidence,
    #[error("diagnosis cost must be a finite, non-negative amount (got {0})")]
    InvalidCost(f64),
}

/// How sure the diagnosis capability is about its root cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::Low => write!(f, "low"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::High => write!(f, "high"),
        }
    }
}

/// One item supporting a root cause, e.g. a log line or a failing span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// Where the evidence came from (`trace:<id>`, `stack`, `log`, ...).
    pub source: String,
    pub detail: String,
}

impl Evidence {
    pub fn new(source: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DiagnosisRecord", into = "DiagnosisRecord")]
pub struct Diagnosis {
    root_cause: String,
    evidence: Vec<Evidence>,
    suggested_fix: String,
    confidence: Confidence,
    cost_usd: f64,
    created_at: DateTime<Utc>,
    context_gaps: Vec<String>,
}

impl Diagnosis {
    pub fn new(
        root_cause: impl Into<String>,
        evidence: Vec<Evidence>,
        suggested_fix: impl Into<String>,
        confidence: Confidence,
        cost_usd: f64,
        created_at: DateTime<Utc>,
    ) -> Result<Self, DiagnosisError> {
        if evidence.is_empty() {
            return Err(DiagnosisError::EmptyEvidence);
        }
        if !cost_usd.is_finite() || cost_usd < 0.0 {
            return Err(DiagnosisError::InvalidCost(cost_usd));
        }
        Ok(Self {
            root_cause: root_cause.into(),
            evidence,
            suggested_fix: suggested_fix.into(),
            confidence,
            cost_usd,
            created_at,
            context_gaps: Vec::new(),
        })
    }

    /// Record the trace ids that could not be resolved while gathering context.
    pub fn with_context_gaps(mut self, gaps: Vec<String>) -> Self {
        self.context_gaps = gaps;
        self
    }

    pub fn root_cause(&self) -> &str {
        &self.root_cause
    }

    pub fn evidence(&self) -> &[Evidence] {
        &self.evidence
    }

    pub fn suggested_fix(&self) -> &str {
        &self.suggested_fix
    }

    pub fn confidence(&self) -> Confidence {
        self.confidence
    }

    pub fn cost_usd(&self) -> f64 {
        self.cost_usd
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn context_gaps(&self) -> &[String] {
        &self.context_gaps
    }

    /// True when every requested trace resolved while gathering context.
    pub fn context_complete(&self) -> bool {
        self.context_gaps.is_empty()
    }
}

/// Flat serialized form of a [`Diagnosis`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisRecord {
    pub root_cause: String,
    pub evidence: Vec<Evidence>,
    pub suggested_fix: String,
    pub confidence: Confidence,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub context_gaps: Vec<String>,
}

impl TryFrom<DiagnosisRecord> for Diagnosis {
    type Error = DiagnosisError;

    fn try_from(record: DiagnosisRecord) -> Result<Self, Self::Error> {
        Ok(Diagnosis::new(
            record.root_cause,
            record.evidence,
            record.suggested_fix,
            record.confidence,
            record.cost_usd,
            record.created_at,
        )?
        .with_context_gaps(record.context_gaps))
    }
}

impl From<Diagnosis> for DiagnosisRecord {
    fn from(d: Diagnosis) -> Self {
        Self {
            root_cause: d.root_cause,
            evidence: d.evidence,
            suggested_fix: d.suggested_fix,
            confidence: d.confidence,
            cost_usd: d.cost_usd,
            created_at: d.created_at,
            context_gaps: d.context_gaps,
        }
    }
}
