//! # DataProfile Reconciler
//!
//! Keeps one cron trigger per profile in sync with `spec.schedule`, takes a snapshot
//! whenever the trigger fires and prunes old snapshots down to the retention count.
//!
//! Retention runs on every reconcile as well as after every fire. The reconcile
//! requeues itself after the resync interval so pruning catches up even when no fire
//! happens.
//!
//! A `CreatingSnapshot` phase with no fire running for the profile belongs to a fire
//! that never finished (the controller restarted mid-snapshot). Reconcile moves it
//! back to `Pending` and marks `SnapshotCreated` as interrupted.

pub mod retention;
pub mod scheduler;

pub use retention::{enforce_retention, select_for_eviction, RetentionOutcome};
pub use scheduler::{FireCallback, Registration, SnapshotScheduler};

use super::status::{self, profile_status_mut, rfc3339};
use super::types::{ReconcileOutcome, ReconcilerError};
use crate::config::ControllerConfig;
use crate::constants::{
    CONDITION_SCHEDULE_VALID, CONDITION_SNAPSHOT_CLEANUP, CONDITION_SNAPSHOT_CREATED,
};
use crate::crd::{find_condition, set_condition, Condition, DataProfile, ProfilePhase};
use crate::observability;
use crate::provider::{SnapshotHandle, StorageError, StorageProvider};
use crate::store::{ObjectKey, ObjectStore};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, error, info, warn};

pub struct ProfileReconciler {
    store: Arc<dyn ObjectStore>,
    storage: Arc<dyn StorageProvider>,
    config: ControllerConfig,
    scheduler: SnapshotScheduler,
    /// Snapshot fires in progress per profile. A replaced trigger may still be
    /// finishing its last fire while the new one starts.
    firing: Mutex<HashMap<ObjectKey, usize>>,
}

/// Counts a fire as running until dropped
struct FiringGuard<'a> {
    firing: &'a Mutex<HashMap<ObjectKey, usize>>,
    key: ObjectKey,
}

impl<'a> FiringGuard<'a> {
    fn enter(firing: &'a Mutex<HashMap<ObjectKey, usize>>, key: &ObjectKey) -> Self {
        *firing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default() += 1;
        Self {
            firing,
            key: key.clone(),
        }
    }
}

impl Drop for FiringGuard<'_> {
    fn drop(&mut self) {
        let mut firing = self.firing.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = firing.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                firing.remove(&self.key);
            }
        }
    }
}

/// SnapshotCleanup condition for a retention result
fn cleanup_condition(
    result: &Result<RetentionOutcome, StorageError>,
    now: DateTime<Utc>,
) -> Condition {
    match result {
        Ok(outcome) => Condition::new(
            CONDITION_SNAPSHOT_CLEANUP,
            true,
            "Success",
            format!("retaining {} snapshot(s)", outcome.kept.len()),
            now,
        ),
        Err(e) => Condition::new(CONDITION_SNAPSHOT_CLEANUP, false, "Error", e.to_string(), now),
    }
}

fn schedule_was_invalid(profile: &DataProfile) -> bool {
    profile
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, CONDITION_SCHEDULE_VALID))
        .is_some_and(|c| !c.is_true())
}

impl ProfileReconciler {
    /// Build the reconciler together with its scheduler.
    ///
    /// Triggers hold only a weak reference back, so dropping the reconciler stops
    /// every trigger.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        storage: Arc<dyn StorageProvider>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let this = this.clone();
            let callback: FireCallback = Arc::new(move |key, at| {
                let this = this.clone();
                Box::pin(async move {
                    if let Some(reconciler) = this.upgrade() {
                        reconciler.fire_snapshot(&key, at).await;
                    }
                })
            });
            Self {
                store,
                storage,
                config,
                scheduler: SnapshotScheduler::new(callback),
                firing: Mutex::new(HashMap::new()),
            }
        })
    }

    pub fn scheduler(&self) -> &SnapshotScheduler {
        &self.scheduler
    }

    fn retries(&self) -> u32 {
        self.config.status_conflict_retries
    }

    /// Whether a snapshot fire for `key` is running right now
    pub fn is_firing(&self, key: &ObjectKey) -> bool {
        self.firing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Reconcile the profile stored under `key` as of `now`
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcilerError> {
        let Some(profile) = self.store.get_profile(key).await? else {
            if self.scheduler.deregister(key) {
                debug!("DataProfile {} is gone, trigger removed", key);
            }
            return Ok(ReconcileOutcome::done());
        };

        if profile.metadata.deletion_timestamp.is_some() {
            self.scheduler.deregister(key);
            status::remove_finalizer(self.store.as_ref(), &profile, self.retries()).await?;
            info!("DataProfile {} released", key);
            return Ok(ReconcileOutcome::done());
        }

        let Some(profile) =
            status::add_finalizer(self.store.as_ref(), &profile, self.retries()).await?
        else {
            return Ok(ReconcileOutcome::done());
        };

        let expression = profile.spec.schedule.trim();
        let schedule = if expression.is_empty() {
            self.scheduler.deregister(key);
            Condition::new(
                CONDITION_SCHEDULE_VALID,
                true,
                "Unscheduled",
                "no schedule set",
                now,
            )
        } else {
            match self.scheduler.ensure(key, expression) {
                Ok(_) => Condition::new(
                    CONDITION_SCHEDULE_VALID,
                    true,
                    "Scheduled",
                    format!("snapshots follow '{expression}'"),
                    now,
                ),
                Err(e) => {
                    warn!("❌ DataProfile {} has an invalid schedule: {}", key, e);
                    observability::metrics::increment_schedule_errors();
                    let condition = Condition::new(
                        CONDITION_SCHEDULE_VALID,
                        false,
                        "InvalidSchedule",
                        e.to_string(),
                        now,
                    );
                    self.write_if_changed(&profile, |p: &mut DataProfile| {
                        let generation = p.metadata.generation;
                        let status = profile_status_mut(p);
                        status.phase = Some(ProfilePhase::Failed);
                        status.observed_generation = generation;
                        set_condition(&mut status.conditions, condition.clone());
                    })
                    .await?;
                    return Ok(ReconcileOutcome::done());
                }
            }
        };

        let retention =
            enforce_retention(self.storage.as_ref(), key, profile.retention_count()).await;
        let cleanup = cleanup_condition(&retention, now);
        let newest = retention
            .as_ref()
            .ok()
            .and_then(|outcome| outcome.newest())
            .map(|handle| rfc3339(handle.created_at));
        let recovering = schedule_was_invalid(&profile);

        self.write_if_changed(&profile, |p: &mut DataProfile| {
            let generation = p.metadata.generation;
            let status = profile_status_mut(p);
            match status.phase {
                None => status.phase = Some(ProfilePhase::Pending),
                Some(ProfilePhase::Failed) if recovering => {
                    status.phase = Some(ProfilePhase::Pending);
                }
                Some(ProfilePhase::CreatingSnapshot) if !self.is_firing(key) => {
                    status.phase = Some(ProfilePhase::Pending);
                    set_condition(
                        &mut status.conditions,
                        Condition::new(
                            CONDITION_SNAPSHOT_CREATED,
                            false,
                            "Interrupted",
                            "snapshot fire did not finish, waiting for the next one",
                            now,
                        ),
                    );
                }
                Some(_) => {}
            }
            status.observed_generation = generation;
            set_condition(&mut status.conditions, schedule.clone());
            set_condition(&mut status.conditions, cleanup.clone());
            if newest.is_some() {
                status.last_snapshot_time.clone_from(&newest);
            }
        })
        .await?;

        if let Err(source) = retention {
            return Err(ReconcilerError::SnapshotCleanup {
                key: key.clone(),
                source,
            });
        }
        Ok(ReconcileOutcome::requeue(self.config.profile_resync_interval))
    }

    /// Write a status mutation unless it would not change anything
    async fn write_if_changed<F>(
        &self,
        profile: &DataProfile,
        mutate: F,
    ) -> Result<Option<DataProfile>, ReconcilerError>
    where
        F: Fn(&mut DataProfile) + Send + Sync,
    {
        let mut desired = profile.clone();
        mutate(&mut desired);
        if desired.status == profile.status {
            return Ok(Some(profile.clone()));
        }
        status::update_status(self.store.as_ref(), profile, self.retries(), mutate).await
    }

    /// Take the snapshot for one trigger fire.
    ///
    /// Runs outside any reconcile, so failures are recorded on the profile and logged
    /// rather than returned.
    pub async fn fire_snapshot(&self, key: &ObjectKey, at: DateTime<Utc>) -> Option<SnapshotHandle> {
        let _running = FiringGuard::enter(&self.firing, key);
        match self.try_fire(key, at).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Snapshot of DataProfile {} for {} failed: {}", key, at, e);
                None
            }
        }
    }

    async fn try_fire(
        &self,
        key: &ObjectKey,
        at: DateTime<Utc>,
    ) -> Result<Option<SnapshotHandle>, ReconcilerError> {
        let profile = match self.store.get_profile(key).await? {
            Some(profile) if profile.metadata.deletion_timestamp.is_none() => profile,
            _ => {
                info!("DataProfile {} is gone, dropping its trigger", key);
                self.scheduler.deregister(key);
                return Ok(None);
            }
        };

        let Some(profile) = status::update_status(
            self.store.as_ref(),
            &profile,
            self.retries(),
            |p: &mut DataProfile| {
                profile_status_mut(p).phase = Some(ProfilePhase::CreatingSnapshot);
            },
        )
        .await?
        else {
            return Ok(None);
        };

        info!("📸 Snapshotting {} for DataProfile {}", profile.spec.target.pvc_name, key);
        let created = match self
            .storage
            .create_snapshot(key, &profile.spec.target.pvc_name, at)
            .await
        {
            // A retried fire finds the snapshot it already took
            Err(StorageError::AlreadyExists(existing)) => {
                match self.storage.get_snapshot(&existing).await {
                    Ok(Some(handle)) => Ok(handle),
                    Ok(None) => Err(StorageError::AlreadyExists(existing)),
                    Err(e) => Err(e),
                }
            }
            other => other,
        };

        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                warn!("❌ Snapshot of DataProfile {} failed: {}", key, e);
                observability::metrics::increment_snapshot_errors("create");
                let message = e.to_string();
                status::update_status(
                    self.store.as_ref(),
                    &profile,
                    self.retries(),
                    |p: &mut DataProfile| {
                        let status = profile_status_mut(p);
                        status.phase = Some(ProfilePhase::Failed);
                        set_condition(
                            &mut status.conditions,
                            Condition::new(
                                CONDITION_SNAPSHOT_CREATED,
                                false,
                                "CreateFailed",
                                message.clone(),
                                at,
                            ),
                        );
                    },
                )
                .await?;
                return Ok(None);
            }
        };

        observability::metrics::increment_snapshots_created();
        info!("✅ Snapshot {} of DataProfile {} created", handle.name, key);
        let Some(profile) = status::update_status(
            self.store.as_ref(),
            &profile,
            self.retries(),
            |p: &mut DataProfile| {
                let status = profile_status_mut(p);
                status.phase = Some(ProfilePhase::SnapshotReady);
                status.last_snapshot_time = Some(rfc3339(handle.created_at));
                status.last_snapshot_name = Some(handle.name.clone());
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        CONDITION_SNAPSHOT_CREATED,
                        true,
                        "Created",
                        format!("snapshot {} created", handle.name),
                        at,
                    ),
                );
            },
        )
        .await?
        else {
            return Ok(Some(handle));
        };

        let retention =
            enforce_retention(self.storage.as_ref(), key, profile.retention_count()).await;
        let cleanup = cleanup_condition(&retention, at);
        self.write_if_changed(&profile, |p: &mut DataProfile| {
            set_condition(&mut profile_status_mut(p).conditions, cleanup.clone());
        })
        .await?;
        if let Err(e) = retention {
            warn!(
                "Snapshot cleanup of DataProfile {} failed after {}: {}",
                profile.name_any(),
                handle.name,
                e
            );
        }
        Ok(Some(handle))
    }
}
