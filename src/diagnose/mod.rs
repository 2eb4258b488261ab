//! Diagnosis capability port: the expensive root-cause analysis.
//!
//! The capability receives a [`DiagnosisContext`] assembled by the
//! investigator and a hard cost ceiling for the call. Failures are split by
//! kind so the investigator can charge the budget correctly and operators can
//! tell a slow capability from a broken one.

pub mod http;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::signature::{Diagnosis, DiagnosisError, Signature, SignatureKey};
use crate::telemetry::TraceTree;

pub use http::HttpDiagnosisClient;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DiagnoseError {
    #[error("diagnosis timed out after {0:?}")]
    Timeout(Duration),
    #[error("diagnosis cost ${cost_usd:.4} exceeded the ${ceiling_usd:.4} ceiling")]
    CostExceeded { cost_usd: f64, ceiling_usd: f64 },
    #[error("unparseable diagnosis response: {0}")]
    Parse(String),
    #[error("diagnosis rejected: {0}")]
    Invalid(#[from] DiagnosisError),
    #[error("diagnosis capability unavailable: {0}")]
    Unavailable(String),
}

impl DiagnoseError {
    pub fn kind(&self) -> &'static str {
        match self {
            DiagnoseError::Timeout(_) => "timeout",
            DiagnoseError::CostExceeded { .. } => "cost_exceeded",
            DiagnoseError::Parse(_) => "parse",
            DiagnoseError::Invalid(_) => "invalid",
            DiagnoseError::Unavailable(_) => "unavailable",
        }
    }

    /// What the failed attempt costs against a reservation of `reserved`.
    /// Unknown cost is charged in full; a request that never reached the
    /// capability costs nothing.
    pub fn charge(&self, reserved: f64) -> f64 {
        match self {
            DiagnoseError::CostExceeded { cost_usd, .. } => *cost_usd,
            DiagnoseError::Unavailable(_) => 0.0,
            DiagnoseError::Timeout(_) | DiagnoseError::Parse(_) | DiagnoseError::Invalid(_) => reserved,
        }
    }
}

/// Everything the capability gets to look at for one signature.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosisContext {
    pub key: SignatureKey,
    pub error_type: String,
    pub service: String,
    pub message_template: String,
    pub sample_message: String,
    pub occurrence_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub traces: Vec<TraceTree>,
    /// Trace ids that were requested but could not be resolved.
    pub context_gaps: Vec<String>,
    /// Root causes of earlier diagnoses this signature outlived.
    pub previous_root_causes: Vec<String>,
}

impl DiagnosisContext {
    pub fn new(signature: &Signature, traces: Vec<TraceTree>, context_gaps: Vec<String>) -> Self {
        Self {
            key: signature.key().clone(),
            error_type: signature.error_type().to_string(),
            service: signature.service().to_string(),
            message_template: signature.message_template().to_string(),
            sample_message: signature.sample_message().to_string(),
            occurrence_count: signature.occurrence_count(),
            first_seen: signature.first_seen(),
            last_seen: signature.last_seen(),
            traces,
            context_gaps,
            previous_root_causes: signature
                .history()
                .iter()
                .map(|d| d.root_cause().to_string())
                .collect(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.context_gaps.is_empty()
    }
}

#[async_trait::async_trait]
pub trait DiagnosisCapability: Send + Sync {
    /// Produce a diagnosis costing at most `max_cost_usd`.
    async fn diagnose(&self, context: &DiagnosisContext, max_cost_usd: f64) -> Result<Diagnosis, DiagnoseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charges_by_kind() {
        assert_eq!(DiagnoseError::Timeout(Duration::from_secs(5)).charge(0.5), 0.5);
        assert_eq!(DiagnoseError::Parse("eof".into()).charge(0.5), 0.5);
        assert_eq!(DiagnoseError::Unavailable("refused".into()).charge(0.5), 0.0);
        assert_eq!(
            DiagnoseError::CostExceeded {
                cost_usd: 0.75,
                ceiling_usd: 0.5
            }
            .charge(0.5),
            0.75
        );
    }

    #[test]
    fn test_kinds_are_distinct() {
        let errors = [
            DiagnoseError::Timeout(Duration::from_secs(1)),
            DiagnoseError::CostExceeded {
                cost_usd: 1.0,
                ceiling_usd: 0.5,
            },
            DiagnoseError::Parse(String::new()),
            DiagnoseError::Invalid(DiagnosisError::EmptyEvidence),
            DiagnoseError::Unavailable(String::new()),
        ];
        let mut kinds: Vec<_> = errors.iter().map(|e| e.kind()).collect();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), errors.len());
    }
}
