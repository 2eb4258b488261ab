//! Diagnosis budget: a ceiling per diagnosis call and a cumulative ceiling per
//! UTC day.
//!
//! Every investigation reserves the per-call ceiling up front and settles the
//! reservation with the actual cost afterwards. Once spent plus outstanding
//! reservations would pass the daily ceiling, further reservations fail with
//! [`BudgetExhausted`] until the next UTC day. When a [`SpendJournal`] is
//! attached, spend survives restarts.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::BudgetConfig;
use crate::signature::SignatureKey;
use crate::storage::StoreError;

/// Tolerance for floating point sums of dollar amounts.
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Error)]
#[error(
    "diagnosis budget exhausted: ${spent:.4} spent and ${reserved:.4} reserved of ${ceiling:.4}, resets at {resets_at}"
)]
pub struct BudgetExhausted {
    pub spent: f64,
    pub reserved: f64,
    pub ceiling: f64,
    pub resets_at: DateTime<Utc>,
}

/// One settled diagnosis attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SpendEntry {
    pub key: SignatureKey,
    pub cost_usd: f64,
    pub outcome: &'static str,
    pub spent_at: DateTime<Utc>,
}

/// Durable record of diagnosis spend.
pub trait SpendJournal: Send + Sync {
    fn record(&self, entry: &SpendEntry) -> Result<(), StoreError>;

    fn total_since(&self, since: DateTime<Utc>) -> Result<f64, StoreError>;
}

/// Budget held for one in-flight diagnosis.
#[derive(Debug)]
#[must_use = "a reservation must be settled or released"]
pub struct Reservation {
    amount: f64,
    period_start: DateTime<Utc>,
}

impl Reservation {
    pub fn amount(&self) -> f64 {
        self.amount
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub period_start: DateTime<Utc>,
    pub spent_usd: f64,
    pub reserved_usd: f64,
    pub ceiling_usd: f64,
    pub remaining_usd: f64,
}

struct LedgerInner {
    period_start: DateTime<Utc>,
    spent: f64,
    reserved: f64,
    /// Exhaustion is logged once per period.
    exhaustion_logged: bool,
}

pub struct BudgetLedger {
    inner: Mutex<LedgerInner>,
    config: BudgetConfig,
    journal: Option<Arc<dyn SpendJournal>>,
}

fn period_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

impl BudgetLedger {
    /// In-memory ledger starting empty at `now`.
    pub fn new(config: BudgetConfig, now: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                period_start: period_start(now),
                spent: 0.0,
                reserved: 0.0,
                exhaustion_logged: false,
            }),
            config,
            journal: None,
        }
    }

    /// Ledger seeded from, and writing to, a spend journal.
    pub fn with_journal(config: BudgetConfig, journal: Arc<dyn SpendJournal>, now: DateTime<Utc>) -> Self {
        let start = period_start(now);
        let spent = Self::seed(&config, journal.as_ref(), start);
        info!(spent_usd = spent, ceiling_usd = config.daily_ceiling_usd, "budget ledger loaded");
        Self {
            inner: Mutex::new(LedgerInner {
                period_start: start,
                spent,
                reserved: 0.0,
                exhaustion_logged: false,
            }),
            config,
            journal: Some(journal),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// An unreadable journal counts as a spent budget.
    fn seed(config: &BudgetConfig, journal: &dyn SpendJournal, since: DateTime<Utc>) -> f64 {
        match journal.total_since(since) {
            Ok(total) => total,
            Err(e) => {
                error!(error = %e, "spend journal unreadable, refusing diagnoses for this period");
                config.daily_ceiling_usd
            }
        }
    }

    fn roll_period(&self, inner: &mut LedgerInner, now: DateTime<Utc>) {
        let start = period_start(now);
        if start <= inner.period_start {
            return;
        }
        info!(
            old_period = %inner.period_start.to_rfc3339(),
            new_period = %start.to_rfc3339(),
            "resetting diagnosis budget"
        );
        inner.period_start = start;
        inner.reserved = 0.0;
        inner.exhaustion_logged = false;
        inner.spent = match &self.journal {
            Some(journal) => Self::seed(&self.config, journal.as_ref(), start),
            None => 0.0,
        };
    }

    /// Hold the per-call ceiling for one diagnosis.
    pub async fn reserve(&self, now: DateTime<Utc>) -> Result<Reservation, BudgetExhausted> {
        let mut inner = self.inner.lock().await;
        self.roll_period(&mut inner, now);

        let amount = self.config.per_diagnosis_usd;
        if inner.spent + inner.reserved + amount > self.config.daily_ceiling_usd + EPSILON {
            let exhausted = BudgetExhausted {
                spent: inner.spent,
                reserved: inner.reserved,
                ceiling: self.config.daily_ceiling_usd,
                resets_at: inner.period_start + Duration::days(1),
            };
            if !inner.exhaustion_logged {
                warn!(
                    spent_usd = exhausted.spent,
                    reserved_usd = exhausted.reserved,
                    ceiling_usd = exhausted.ceiling,
                    resets_at = %exhausted.resets_at.to_rfc3339(),
                    "budget exhausted, investigations blocked until reset"
                );
                inner.exhaustion_logged = true;
            }
            return Err(exhausted);
        }

        inner.reserved += amount;
        Ok(Reservation {
            amount,
            period_start: inner.period_start,
        })
    }

    /// Give a reservation back without spending anything.
    pub async fn release(&self, reservation: Reservation) {
        let mut inner = self.inner.lock().await;
        if reservation.period_start == inner.period_start {
            inner.reserved = (inner.reserved - reservation.amount).max(0.0);
        }
    }

    /// Replace a reservation with the actual cost of the attempt.
    pub async fn settle(
        &self,
        reservation: Reservation,
        key: &SignatureKey,
        cost_usd: f64,
        outcome: &'static str,
        now: DateTime<Utc>,
    ) {
        let cost_usd = if cost_usd.is_finite() { cost_usd.max(0.0) } else { reservation.amount };
        if cost_usd > reservation.amount + EPSILON {
            warn!(
                key = %key.short(),
                cost_usd,
                ceiling_usd = reservation.amount,
                "diagnosis cost exceeded the per-call ceiling"
            );
        }

        let mut inner = self.inner.lock().await;
        self.roll_period(&mut inner, now);
        if reservation.period_start == inner.period_start {
            inner.reserved = (inner.reserved - reservation.amount).max(0.0);
        }
        inner.spent += cost_usd;

        if let Some(journal) = &self.journal {
            let entry = SpendEntry {
                key: key.clone(),
                cost_usd,
                outcome,
                spent_at: now,
            };
            if let Err(e) = journal.record(&entry) {
                warn!(key = %key.short(), error = %e, "failed to journal diagnosis spend");
            }
        }
    }

    pub async fn snapshot(&self, now: DateTime<Utc>) -> BudgetSnapshot {
        let mut inner = self.inner.lock().await;
        self.roll_period(&mut inner, now);
        BudgetSnapshot {
            period_start: inner.period_start,
            spent_usd: inner.spent,
            reserved_usd: inner.reserved,
            ceiling_usd: self.config.daily_ceiling_usd,
            remaining_usd: (self.config.daily_ceiling_usd - inner.spent - inner.reserved).max(0.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
