//! # Clone Teardown
//!
//! Finalizer-driven deletion and TTL expiry.

use super::{CloneReconciler, Progress};
use crate::controller::reconciler::status;
use crate::controller::reconciler::types::{ReconcileOutcome, ReconcilerError};
use crate::crd::{ClonePhase, DataClone};
use crate::observability;
use crate::store::{ChildKind, ObjectKey};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

impl CloneReconciler {
    /// Delete every child object, then release the finalizer.
    ///
    /// Children go in reverse creation order. A child that is already gone counts as
    /// deleted, so an interrupted teardown simply runs again.
    pub(super) async fn finalize(
        &self,
        clone: DataClone,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcilerError> {
        let key = ObjectKey::for_resource(&clone);
        if !status::has_finalizer(&clone) {
            debug!("DataClone {} has no finalizer, nothing to clean up", key);
            return Ok(ReconcileOutcome::done());
        }

        let clone = if clone.phase() == ClonePhase::Deleting {
            clone
        } else {
            match self
                .transition(&clone, ClonePhase::Deleting, now, |_| {})
                .await?
            {
                Progress::Advanced(updated) => updated,
                _ => return Ok(ReconcileOutcome::done()),
            }
        };

        info!("🧹 Deleting resources of DataClone {}", key);
        for kind in ChildKind::ALL.into_iter().rev() {
            match self.store.delete_child(kind, &key).await {
                Ok(()) => debug!("Deleted {} {}", kind, key),
                Err(e) if e.is_not_found() => debug!("{} {} already gone", kind, key),
                Err(e) => return Err(e.into()),
            }
        }

        status::remove_finalizer(self.store.as_ref(), &clone, self.retries()).await?;
        info!("DataClone {} released", key);
        Ok(ReconcileOutcome::done())
    }

    /// Delete a Ready clone whose TTL has elapsed, otherwise requeue for the remainder
    pub(super) async fn check_expiry(
        &self,
        clone: DataClone,
        key: &ObjectKey,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcilerError> {
        let expires_at = clone
            .status
            .as_ref()
            .and_then(|s| s.expires_at.as_deref())
            .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
            .map(|at| at.with_timezone(&Utc));
        let Some(expires_at) = expires_at else {
            return Ok(ReconcileOutcome::done());
        };

        if let Ok(remaining) = (expires_at - now).to_std() {
            if !remaining.is_zero() {
                debug!("DataClone {} expires in {:?}", key, remaining);
                return Ok(ReconcileOutcome::requeue(remaining));
            }
        }

        info!("⌛ DataClone {} expired at {}, deleting", key, expires_at);
        self.store.delete_clone(key).await?;
        observability::metrics::increment_clones_expired(&key.namespace);

        // With the finalizer present the delete only marks the clone
        match self.store.get_clone(key).await? {
            Some(marked) => self.finalize(marked, now).await,
            None => Ok(ReconcileOutcome::done()),
        }
    }
}
