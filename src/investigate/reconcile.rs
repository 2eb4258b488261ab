//! Sweep for investigation leases whose owner went away.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, warn};

use crate::signature::{SignatureKey, SignatureStatus};
use crate::storage::{transition, SignatureFilter, SignatureStore, StoreError, UpdateError};

#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// `INVESTIGATING` signatures looked at.
    pub examined: usize,
    pub released: Vec<SignatureKey>,
    pub failures: Vec<(SignatureKey, StoreError)>,
}

/// Revert every lease older than `stale_after` to `NEW`. Only the listing
/// failing aborts the sweep; per-key failures are collected.
pub fn reconcile_stale_leases(
    store: &dyn SignatureStore,
    stale_after: Duration,
    now: DateTime<Utc>,
) -> Result<ReconcileReport, StoreError> {
    let leased = store.list(&SignatureFilter::status(SignatureStatus::Investigating))?;
    let mut report = ReconcileReport {
        examined: leased.len(),
        ..ReconcileReport::default()
    };

    for signature in leased {
        let stale = signature
            .investigating_since()
            .is_some_and(|since| now - since >= stale_after);
        if !stale {
            continue;
        }

        let key = signature.key().clone();
        match transition(store, &key, |s| s.release_stale_lease(now, stale_after)) {
            Ok(_) => {
                warn!(key = %key.short(), "released stale investigation lease");
                report.released.push(key);
            }
            // Completed or released by someone else since the listing.
            Err(UpdateError::Rejected(e)) => debug!(key = %key.short(), reason = %e, "lease no longer stale"),
            Err(UpdateError::Store(e)) => {
                error!(key = %key.short(), error = %e, "failed to release stale lease");
                report.failures.push((key, e));
            }
        }
    }

    Ok(report)
}
