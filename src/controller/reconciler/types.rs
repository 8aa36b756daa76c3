//! # Reconciler Types
//!
//! Shared controller context, error type and reconcile outcome.

use super::clone::CloneReconciler;
use super::profile::ProfileReconciler;
use super::validation::ScheduleError;
use crate::config::ControllerConfig;
use crate::constants;
use crate::controller::backoff::FibonacciBackoff;
use crate::database::DatabaseError;
use crate::masking::MaskingError;
use crate::provider::StorageError;
use crate::store::{ObjectKey, StoreError};
use kube_runtime::controller::Action;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Per-resource error backoff, kept by the error policy
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl BackoffState {
    pub fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::new(
                constants::DEFAULT_BACKOFF_MIN_SECS,
                constants::DEFAULT_BACKOFF_MAX_SECS,
            ),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconciler errors. Every variant is retried by the error policy.
#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Masking(#[from] MaskingError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("source profile {0} does not exist")]
    MissingProfile(ObjectKey),
    #[error("secret {key} has no key '{field}'")]
    MissingSecretKey { key: ObjectKey, field: String },
    #[error("snapshot cleanup for {key} failed: {source}")]
    SnapshotCleanup {
        key: ObjectKey,
        #[source]
        source: StorageError,
    },
    #[error("status of {key} still conflicts after {attempts} attempts")]
    ConflictRetriesExhausted { key: ObjectKey, attempts: u32 },
}

/// What the caller should do after a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileOutcome {
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    /// Nothing to do until the resource changes again
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    pub fn into_action(self) -> Action {
        match self.requeue_after {
            Some(after) => Action::requeue(after),
            None => Action::await_change(),
        }
    }
}

/// Controller context shared by both watch loops
pub struct Reconciler {
    pub clones: CloneReconciler,
    pub profiles: Arc<ProfileReconciler>,
    pub config: ControllerConfig,
    /// Error backoff per `kind/namespace/name`
    pub backoff_states: Mutex<HashMap<String, BackoffState>>,
}

impl Reconciler {
    pub fn new(
        clones: CloneReconciler,
        profiles: Arc<ProfileReconciler>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            clones,
            profiles,
            config,
            backoff_states: Mutex::new(HashMap::new()),
        }
    }

    /// Forget the error history of a resource after it reconciled cleanly
    pub fn reset_backoff(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(resource_key);
        }
    }
}
