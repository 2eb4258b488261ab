//! Operator actions on existing signatures.
//!
//! Store failures always surface as [`ManageError::Store`]; they are never
//! folded into `NotFound` or a no-op success.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::signature::{Signature, SignatureError, SignatureKey, SignatureStatus};
use crate::storage::{transition, SignatureFilter, SignatureStore, StoreError, UpdateError};

#[derive(Debug, Error)]
pub enum ManageError {
    #[error("signature {} not found", .0.short())]
    NotFound(SignatureKey),
    #[error("signature {} cannot change right now: {reason}", .key.short())]
    Conflict {
        key: SignatureKey,
        reason: SignatureError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a management action.
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub signature: Signature,
    /// False when the signature was already in the requested state.
    pub changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Mute,
    Resolve,
    Retriage,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Mute => "mute",
            Action::Resolve => "resolve",
            Action::Retriage => "retriage",
        }
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mute" => Ok(Action::Mute),
            "resolve" => Ok(Action::Resolve),
            "retriage" => Ok(Action::Retriage),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

#[derive(Clone)]
pub struct ManagementService {
    store: Arc<dyn SignatureStore>,
}

impl ManagementService {
    pub fn new(store: Arc<dyn SignatureStore>) -> Self {
        Self { store }
    }

    /// `NEW|DIAGNOSED|RESOLVED -> MUTED`. Muting a muted signature is a no-op.
    pub fn mute(&self, key: &SignatureKey) -> Result<Transition, ManageError> {
        self.apply(key, Action::Mute)
    }

    /// `NEW|DIAGNOSED|MUTED -> RESOLVED`. Resolving twice is a no-op.
    pub fn resolve(&self, key: &SignatureKey) -> Result<Transition, ManageError> {
        self.apply(key, Action::Resolve)
    }

    /// `DIAGNOSED|MUTED|RESOLVED -> NEW`, so triage considers it again.
    pub fn retriage(&self, key: &SignatureKey) -> Result<Transition, ManageError> {
        self.apply(key, Action::Retriage)
    }

    pub fn apply(&self, key: &SignatureKey, action: Action) -> Result<Transition, ManageError> {
        let now = Utc::now();
        let mut changed = false;
        let mut previous = None;
        let signature = transition(self.store.as_ref(), key, |signature| {
            previous = Some(signature.status());
            changed = match action {
                Action::Mute => signature.mute()?,
                Action::Resolve => signature.resolve(now)?,
                Action::Retriage => signature.retriage()?,
            };
            Ok(())
        })
        .map_err(|e| match e {
            UpdateError::Store(e) => ManageError::Store(e),
            UpdateError::Rejected(SignatureError::Absent) => ManageError::NotFound(key.clone()),
            UpdateError::Rejected(reason) => ManageError::Conflict {
                key: key.clone(),
                reason,
            },
        })?;

        if changed {
            info!(
                key = %key.short(),
                action = action.as_str(),
                from = previous.map(|s| s.as_str()).unwrap_or("-"),
                to = %signature.status(),
                "signature updated"
            );
        }
        Ok(Transition { signature, changed })
    }

    pub fn details(&self, key: &SignatureKey) -> Result<Signature, ManageError> {
        self.store.get(key)?.ok_or_else(|| ManageError::NotFound(key.clone()))
    }

    pub fn list(&self, filter: &SignatureFilter) -> Result<Vec<Signature>, ManageError> {
        Ok(self.store.list(filter)?)
    }

    /// Signature counts per status, in lifecycle order.
    pub fn summary(&self) -> Result<Vec<(SignatureStatus, usize)>, ManageError> {
        let all = self.store.list(&SignatureFilter::default())?;
        Ok(SignatureStatus::ALL
            .into_iter()
            .map(|status| (status, all.iter().filter(|s| s.status() == status).count()))
            .collect())
    }
}
