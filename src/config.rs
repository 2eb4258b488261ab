//! TOML configuration for the Faultline daemon.
//!
//! Layered: compiled-in defaults, then a TOML file (explicit path,
//! `FAULTLINE_CONFIG`, or `/etc/faultline/faultline.toml`), then a handful of
//! environment overrides. [`FaultlineConfig::validate`] runs before anything
//! starts, so an inverted budget never reaches the daemon loop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::triage::TriagePolicy;

pub const CONFIG_ENV: &str = "FAULTLINE_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/faultline/faultline.toml";

/// Upper bound for any age window (ten years).
pub const MAX_WINDOW_SECS: u64 = 10 * 365 * 86_400;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("per-diagnosis budget (${per_diagnosis:.2}) exceeds the daily ceiling (${daily_ceiling:.2})")]
    BudgetInverted { per_diagnosis: f64, daily_ceiling: f64 },
    #[error("{field} must be a finite, non-negative amount")]
    InvalidAmount { field: &'static str },
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },
    #[error("{field} is not a valid URL: {value}")]
    InvalidUrl { field: &'static str, value: String },
    #[error("retry jitter must be within [0, 1], got {0}")]
    InvalidJitter(f64),
    #[error("{field} must be at most {max} seconds")]
    OutOfRange { field: &'static str, max: u64 },
    #[error("triage.recent_window_secs ({recent}) exceeds triage.stale_after_secs ({stale})")]
    WindowInverted { recent: u64, stale: u64 },
}

/// Converts a seconds count to a signed delta, saturating instead of panicking.
pub fn saturating_delta(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultlineConfig {
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub triage: TriagePolicy,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub diagnosis: DiagnosisConfig,
    #[serde(default)]
    pub investigation: InvestigationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FaultlineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded faultline configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `FAULTLINE_CONFIG` environment variable.
    /// 2. `/etc/faultline/faultline.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "FAULTLINE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Startup entry point: an explicit path must load, otherwise fall back.
    /// Environment overrides are applied and the result validated.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    /// Apply `FAULTLINE_*` overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FAULTLINE_DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FAULTLINE_TELEMETRY_URL") {
            self.telemetry.base_url = v;
        }
        if let Some(v) = lookup("FAULTLINE_TELEMETRY_TOKEN") {
            self.telemetry.api_token = Some(v);
        }
        if let Some(v) = lookup("FAULTLINE_DIAGNOSIS_URL") {
            self.diagnosis.endpoint = v;
        }
        if let Some(v) = lookup("FAULTLINE_DIAGNOSIS_TOKEN") {
            self.diagnosis.api_token = Some(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.budget.validate()?;

        for (field, value) in [
            ("poll.interval_secs", self.poll.interval_secs),
            ("telemetry.lookback_secs", self.telemetry.lookback_secs),
            ("telemetry.request_timeout_secs", self.telemetry.request_timeout_secs),
            ("diagnosis.timeout_secs", self.diagnosis.timeout_secs),
            ("investigation.stale_after_secs", self.investigation.stale_after_secs),
            ("investigation.trace_timeout_secs", self.investigation.trace_timeout_secs),
            ("notify.timeout_secs", self.notify.timeout_secs),
            ("triage.recent_window_secs", self.triage.recent_window_secs),
            ("triage.stale_after_secs", self.triage.stale_after_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive { field });
            }
        }
        for (field, value) in [
            ("triage.recent_window_secs", self.triage.recent_window_secs),
            ("triage.stale_after_secs", self.triage.stale_after_secs),
            ("investigation.stale_after_secs", self.investigation.stale_after_secs),
        ] {
            if value > MAX_WINDOW_SECS {
                return Err(ConfigError::OutOfRange {
                    field,
                    max: MAX_WINDOW_SECS,
                });
            }
        }
        if self.triage.recent_window_secs > self.triage.stale_after_secs {
            return Err(ConfigError::WindowInverted {
                recent: self.triage.recent_window_secs,
                stale: self.triage.stale_after_secs,
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::NotPositive {
                field: "retry.max_attempts",
            });
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::InvalidJitter(self.retry.jitter));
        }

        check_url("telemetry.base_url", &self.telemetry.base_url)?;
        check_url("diagnosis.endpoint", &self.diagnosis.endpoint)?;
        if let Some(url) = &self.notify.webhook_url {
            check_url("notify.webhook_url", url)?;
        }
        Ok(())
    }
}

fn check_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    reqwest::Url::parse(value)
        .map(|_| ())
        .map_err(|_| ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Observability backend the daemon polls for errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub request_timeout_secs: u64,
    /// How far back each poll looks for errors.
    pub lookback_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8126".to_string(),
            api_token: None,
            request_timeout_secs: 10,
            lookback_secs: 300,
        }
    }
}

impl TelemetryConfig {
    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Poll
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_secs: u64,
    /// Stack frames that participate in the fingerprint.
    pub max_stack_frames: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_stack_frames: crate::signature::fingerprint::DEFAULT_MAX_FRAMES,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Ceiling for a single diagnosis call, in USD.
    pub per_diagnosis_usd: f64,
    /// Ceiling for all diagnoses within one UTC day, in USD.
    pub daily_ceiling_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            per_diagnosis_usd: 0.50,
            daily_ceiling_usd: 20.0,
        }
    }
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.per_diagnosis_usd.is_finite() || self.per_diagnosis_usd < 0.0 {
            return Err(ConfigError::InvalidAmount {
                field: "budget.per_diagnosis_usd",
            });
        }
        if !self.daily_ceiling_usd.is_finite() || self.daily_ceiling_usd < 0.0 {
            return Err(ConfigError::InvalidAmount {
                field: "budget.daily_ceiling_usd",
            });
        }
        if self.per_diagnosis_usd > self.daily_ceiling_usd {
            return Err(ConfigError::BudgetInverted {
                per_diagnosis: self.per_diagnosis_usd,
                daily_ceiling: self.daily_ceiling_usd,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Diagnosis and investigation
// ---------------------------------------------------------------------------

/// Remote diagnosis service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosisConfig {
    pub endpoint: String,
    pub api_token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8790/v1/diagnose".to_string(),
            api_token: None,
            timeout_secs: 300,
        }
    }
}

impl DiagnosisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvestigationConfig {
    /// Investigations started per daemon tick.
    pub max_per_cycle: usize,
    /// Traces fetched as context for one diagnosis.
    pub max_traces: usize,
    pub trace_timeout_secs: u64,
    /// Leases older than this are released by the reconciliation sweep.
    pub stale_after_secs: u64,
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        Self {
            max_per_cycle: 3,
            max_traces: 3,
            trace_timeout_secs: 10,
            stale_after_secs: 1800,
        }
    }
}

impl InvestigationConfig {
    pub fn trace_timeout(&self) -> Duration {
        Duration::from_secs(self.trace_timeout_secs)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        saturating_delta(self.stale_after_secs)
    }
}

// ---------------------------------------------------------------------------
// Storage, notifications, retry, API, logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/faultline.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// POST target for diagnosis notifications. Logged only when unset.
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of each delay randomized, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8088".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = FaultlineConfig::default();
        cfg.validate().unwrap();

        assert_eq!(cfg.poll.interval_secs, 60);
        assert_eq!(cfg.poll.max_stack_frames, 5);
        assert_eq!(cfg.telemetry.lookback_secs, 300);
        assert_eq!(cfg.budget.per_diagnosis_usd, 0.50);
        assert_eq!(cfg.budget.daily_ceiling_usd, 20.0);
        assert_eq!(cfg.investigation.stale_after_secs, 1800);
        assert_eq!(cfg.storage.db_path, PathBuf::from("data/faultline.db"));
        assert!(cfg.notify.webhook_url.is_none());
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.triage.min_occurrences, 3);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[telemetry]
base_url = "https://apm.internal:8443"
api_token = "secret"
lookback_secs = 600

[poll]
interval_secs = 30

[triage]
min_occurrences = 5
notify_threshold = 90.0
severity_rules = [{ needle = "fatal", weight = 2.0 }]

[budget]
per_diagnosis_usd = 1.25
daily_ceiling_usd = 50.0

[diagnosis]
endpoint = "https://diag.internal/v1/diagnose"
timeout_secs = 120

[storage]
db_path = "/var/lib/faultline/faultline.db"

[notify]
webhook_url = "https://hooks.internal/faultline"

[logging]
level = "debug"
json = true
"#;

        let cfg: FaultlineConfig = toml::from_str(toml_str).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.telemetry.base_url, "https://apm.internal:8443");
        assert_eq!(cfg.telemetry.api_token.as_deref(), Some("secret"));
        assert_eq!(cfg.telemetry.lookback_secs, 600);
        assert_eq!(cfg.telemetry.request_timeout_secs, 10);
        assert_eq!(cfg.poll.interval_secs, 30);
        assert_eq!(cfg.triage.min_occurrences, 5);
        assert_eq!(cfg.triage.notify_threshold, 90.0);
        assert_eq!(cfg.triage.severity_rules.len(), 1);
        assert_eq!(cfg.triage.frequency_saturation, 100);
        assert_eq!(cfg.budget.per_diagnosis_usd, 1.25);
        assert_eq!(cfg.diagnosis.timeout_secs, 120);
        assert_eq!(cfg.storage.db_path, PathBuf::from("/var/lib/faultline/faultline.db"));
        assert_eq!(cfg.notify.webhook_url.as_deref(), Some("https://hooks.internal/faultline"));
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: FaultlineConfig = toml::from_str("").unwrap();
        let defaults = FaultlineConfig::default();
        assert_eq!(cfg.poll.interval_secs, defaults.poll.interval_secs);
        assert_eq!(cfg.budget, defaults.budget);
        assert_eq!(cfg.triage, defaults.triage);
    }

    #[test]
    fn test_per_diagnosis_above_daily_is_rejected() {
        let mut cfg = FaultlineConfig::default();
        cfg.budget.per_diagnosis_usd = 25.0;
        cfg.budget.daily_ceiling_usd = 10.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::BudgetInverted { .. })));

        cfg.budget.per_diagnosis_usd = 10.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_negative_budget_is_rejected() {
        let mut cfg = FaultlineConfig::default();
        cfg.budget.daily_ceiling_usd = -1.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidAmount { .. })));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let mut cfg = FaultlineConfig::default();
        cfg.poll.interval_secs = 0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::NotPositive {
                field: "poll.interval_secs"
            })
        );
    }

    #[test]
    fn test_zero_triage_windows_are_rejected() {
        let mut cfg = FaultlineConfig::default();
        cfg.triage.recent_window_secs = 0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::NotPositive {
                field: "triage.recent_window_secs"
            })
        );

        let mut cfg = FaultlineConfig::default();
        cfg.triage.stale_after_secs = 0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::NotPositive {
                field: "triage.stale_after_secs"
            })
        );
    }

    #[test]
    fn test_huge_windows_are_rejected() {
        let mut cfg = FaultlineConfig::default();
        cfg.triage.recent_window_secs = 100_000_000_000_000_000;
        cfg.triage.stale_after_secs = u64::MAX;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::OutOfRange {
                field: "triage.recent_window_secs",
                max: MAX_WINDOW_SECS,
            })
        );

        let mut cfg = FaultlineConfig::default();
        cfg.triage.stale_after_secs = MAX_WINDOW_SECS + 1;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::OutOfRange {
                field: "triage.stale_after_secs",
                max: MAX_WINDOW_SECS,
            })
        );

        let mut cfg = FaultlineConfig::default();
        cfg.investigation.stale_after_secs = u64::MAX;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::OutOfRange {
                field: "investigation.stale_after_secs",
                max: MAX_WINDOW_SECS,
            })
        );
    }

    #[test]
    fn test_recent_window_beyond_stale_is_rejected() {
        let mut cfg = FaultlineConfig::default();
        cfg.triage.recent_window_secs = 7_200;
        cfg.triage.stale_after_secs = 3_600;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::WindowInverted {
                recent: 7_200,
                stale: 3_600
            })
        );

        cfg.triage.stale_after_secs = 7_200;
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn test_saturating_delta_never_panics() {
        assert_eq!(saturating_delta(90), chrono::Duration::seconds(90));
        assert_eq!(saturating_delta(u64::MAX), chrono::Duration::MAX);
        assert_eq!(saturating_delta(100_000_000_000_000_000), chrono::Duration::MAX);

        let cfg = InvestigationConfig {
            stale_after_secs: u64::MAX,
            ..InvestigationConfig::default()
        };
        assert_eq!(cfg.stale_after(), chrono::Duration::MAX);
    }

    #[test]
    fn test_bad_url_is_rejected() {
        let mut cfg = FaultlineConfig::default();
        cfg.diagnosis.endpoint = "not a url".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = FaultlineConfig::default();
        cfg.apply_overrides(|name| match name {
            "FAULTLINE_DB_PATH" => Some("/tmp/f.db".to_string()),
            "FAULTLINE_DIAGNOSIS_URL" => Some("http://diag:9000/run".to_string()),
            _ => None,
        });
        assert_eq!(cfg.storage.db_path, PathBuf::from("/tmp/f.db"));
        assert_eq!(cfg.diagnosis.endpoint, "http://diag:9000/run");
        assert_eq!(cfg.telemetry.base_url, TelemetryConfig::default().base_url);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faultline.toml");
        std::fs::write(&path, "[budget]\nper_diagnosis_usd = 5.0\ndaily_ceiling_usd = 1.0\n").unwrap();

        let cfg = FaultlineConfig::load(&path).unwrap();
        assert_eq!(cfg.budget.per_diagnosis_usd, 5.0);
        assert!(FaultlineConfig::resolve(Some(&path)).is_err());
    }
}
