use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DiagnoseError, DiagnosisCapability, DiagnosisContext};
use crate::config::DiagnosisConfig;
use crate::signature::{Confidence, Diagnosis, Evidence};

#[derive(Serialize)]
struct DiagnoseRequest<'a> {
    context: &'a DiagnosisContext,
    max_cost_usd: f64,
}

#[derive(Deserialize)]
struct DiagnoseResponse {
    root_cause: String,
    #[serde(default)]
    evidence: Vec<Evidence>,
    suggested_fix: String,
    confidence: Confidence,
    cost_usd: f64,
}

/// Diagnosis capability behind a single JSON endpoint:
/// `POST {endpoint}` with `{context, max_cost_usd}`.
pub struct HttpDiagnosisClient {
    client: Client,
    endpoint: String,
    api_token: Option<String>,
    timeout: Duration,
}

impl HttpDiagnosisClient {
    pub fn new(config: &DiagnosisConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context("failed to build diagnosis HTTP client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_token: config.api_token.clone(),
            timeout: config.timeout(),
        })
    }
}

#[async_trait::async_trait]
impl DiagnosisCapability for HttpDiagnosisClient {
    async fn diagnose(&self, context: &DiagnosisContext, max_cost_usd: f64) -> Result<Diagnosis, DiagnoseError> {
        let mut request = self.client.post(&self.endpoint).json(&DiagnoseRequest {
            context,
            max_cost_usd,
        });
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DiagnoseError::Timeout(self.timeout)
            } else {
                DiagnoseError::Unavailable(e.to_string())
            }
        })?;

        match resp.status() {
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                return Err(DiagnoseError::Timeout(self.timeout))
            }
            status if !status.is_success() => {
                return Err(DiagnoseError::Unavailable(format!("HTTP {}", status.as_u16())))
            }
            _ => {}
        }

        let body = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                DiagnoseError::Timeout(self.timeout)
            } else {
                DiagnoseError::Parse(e.to_string())
            }
        })?;
        let parsed: DiagnoseResponse =
            serde_json::from_str(&body).map_err(|e| DiagnoseError::Parse(e.to_string()))?;

        if !parsed.cost_usd.is_finite() || parsed.cost_usd > max_cost_usd {
            return Err(DiagnoseError::CostExceeded {
                cost_usd: parsed.cost_usd,
                ceiling_usd: max_cost_usd,
            });
        }

        debug!(
            key = %context.key.short(),
            cost_usd = parsed.cost_usd,
            confidence = %parsed.confidence,
            "diagnosis received"
        );
        Ok(Diagnosis::new(
            parsed.root_cause,
            parsed.evidence,
            parsed.suggested_fix,
            parsed.confidence,
            parsed.cost_usd,
            Utc::now(),
        )?)
    }
}
