//! Notification sinks for freshly persisted diagnoses.
//!
//! A sink failure never rolls back the diagnosis it was reporting.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::NotifyConfig;
use crate::signature::{Confidence, Diagnosis, Evidence, Signature};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NotifyError {
    #[error("notification target unreachable: {0}")]
    Unreachable(String),
    #[error("notification target returned HTTP {0}")]
    Status(u16),
}

#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, signature: &Signature, diagnosis: &Diagnosis) -> Result<(), NotifyError>;
}

/// Writes each diagnosis to the log. Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait::async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, signature: &Signature, diagnosis: &Diagnosis) -> Result<(), NotifyError> {
        info!(
            key = %signature.key().short(),
            service = %signature.service(),
            error_type = %signature.error_type(),
            occurrences = signature.occurrence_count(),
            confidence = %diagnosis.confidence(),
            root_cause = %diagnosis.root_cause(),
            suggested_fix = %diagnosis.suggested_fix(),
            "signature diagnosed"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    key: &'a str,
    service: &'a str,
    error_type: &'a str,
    message_template: &'a str,
    occurrence_count: u64,
    root_cause: &'a str,
    suggested_fix: &'a str,
    confidence: Confidence,
    evidence: &'a [Evidence],
    context_complete: bool,
}

/// POSTs a JSON summary of each diagnosis.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, signature: &Signature, diagnosis: &Diagnosis) -> Result<(), NotifyError> {
        let payload = WebhookPayload {
            key: signature.key().as_str(),
            service: signature.service(),
            error_type: signature.error_type(),
            message_template: signature.message_template(),
            occurrence_count: signature.occurrence_count(),
            root_cause: diagnosis.root_cause(),
            suggested_fix: diagnosis.suggested_fix(),
            confidence: diagnosis.confidence(),
            evidence: diagnosis.evidence(),
            context_complete: diagnosis.context_complete(),
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Unreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Webhook when configured, log otherwise.
pub fn from_config(config: &NotifyConfig) -> Result<Box<dyn NotificationSink>> {
    match &config.webhook_url {
        Some(url) => Ok(Box::new(WebhookNotifier::new(
            url.clone(),
            Duration::from_secs(config.timeout_secs),
        )?)),
        None => Ok(Box::new(LogNotifier)),
    }
}
