//! Telemetry source port: where error events and traces come from.

pub mod http;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signature::ErrorEvent;

pub use http::HttpTelemetrySource;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TelemetryError {
    #[error("telemetry backend timed out after {0:?}")]
    Timeout(Duration),
    #[error("telemetry backend unreachable: {0}")]
    Unreachable(String),
    #[error("telemetry backend returned HTTP {status} for {url}")]
    Status { status: u16, url: String },
    #[error("malformed telemetry response: {0}")]
    Decode(String),
}

impl TelemetryError {
    /// Worth retrying: timeouts, connection failures, 5xx and 429.
    pub fn is_transient(&self) -> bool {
        match self {
            TelemetryError::Timeout(_) | TelemetryError::Unreachable(_) => true,
            TelemetryError::Status { status, .. } => *status >= 500 || *status == 429,
            TelemetryError::Decode(_) => false,
        }
    }
}

/// One span of a distributed trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSpan {
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    pub service: String,
    pub operation: String,
    #[serde(default)]
    pub duration_ms: f64,
    /// Error message recorded on the span, if it failed.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceTree {
    pub trace_id: String,
    #[serde(default)]
    pub spans: Vec<TraceSpan>,
}

impl TraceTree {
    pub fn failed_spans(&self) -> impl Iterator<Item = &TraceSpan> {
        self.spans.iter().filter(|s| s.error.is_some())
    }
}

#[async_trait::async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Errors reported within the last `lookback`.
    async fn fetch_recent_errors(&self, lookback: Duration) -> Result<Vec<ErrorEvent>, TelemetryError>;

    /// `Ok(None)` when the backend does not know the trace.
    async fn fetch_trace(&self, trace_id: &str) -> Result<Option<TraceTree>, TelemetryError>;
}
