use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::{TelemetryError, TelemetrySource, TraceTree};
use crate::config::TelemetryConfig;
use crate::signature::ErrorEvent;

/// Telemetry source speaking the backend's JSON API:
/// `GET /api/v1/errors?lookback_secs=N` and `GET /api/v1/traces/{id}`.
pub struct HttpTelemetrySource {
    client: Client,
    base_url: String,
    api_token: Option<String>,
    timeout: Duration,
}

impl HttpTelemetrySource {
    pub fn new(config: &TelemetryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("failed to build telemetry HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            timeout: config.request_timeout(),
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn classify(&self, err: reqwest::Error) -> TelemetryError {
        if err.is_timeout() {
            TelemetryError::Timeout(self.timeout)
        } else if err.is_decode() {
            TelemetryError::Decode(err.to_string())
        } else {
            TelemetryError::Unreachable(err.to_string())
        }
    }
}

#[async_trait::async_trait]
impl TelemetrySource for HttpTelemetrySource {
    async fn fetch_recent_errors(&self, lookback: Duration) -> Result<Vec<ErrorEvent>, TelemetryError> {
        let url = format!("{}/api/v1/errors?lookback_secs={}", self.base_url, lookback.as_secs());
        let resp = self.get(&url).send().await.map_err(|e| self.classify(e))?;
        if !resp.status().is_success() {
            return Err(TelemetryError::Status {
                status: resp.status().as_u16(),
                url,
            });
        }
        let events: Vec<ErrorEvent> = resp.json().await.map_err(|e| self.classify(e))?;
        debug!(count = events.len(), lookback_secs = lookback.as_secs(), "fetched error events");
        Ok(events)
    }

    async fn fetch_trace(&self, trace_id: &str) -> Result<Option<TraceTree>, TelemetryError> {
        let url = format!("{}/api/v1/traces/{}", self.base_url, trace_id);
        let resp = self.get(&url).send().await.map_err(|e| self.classify(e))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let tree: TraceTree = resp.json().await.map_err(|e| self.classify(e))?;
                Ok(Some(tree))
            }
            status => Err(TelemetryError::Status {
                status: status.as_u16(),
                url,
            }),
        }
    }
}
