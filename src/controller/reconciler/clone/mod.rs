//! # DataClone Reconciler
//!
//! Drives a clone through its phases, one idempotent step at a time:
//!
//! ```text
//! Pending → CreatingStorage → Initializing → MaskingInProgress → Ready
//! ```
//!
//! The current phase lives in the clone's status, so a reconcile that dies halfway
//! resumes from the last persisted phase. Every create tolerates AlreadyExists.
//! `Failed` and `Deleting` are reachable from any phase; see [`cleanup`] for the
//! deletion and TTL paths.

mod children;
mod cleanup;

use super::status::{self, clone_status_mut, rfc3339};
use super::types::{ReconcileOutcome, ReconcilerError};
use super::validation::parse_ttl;
use crate::config::ControllerConfig;
use crate::constants::{
    CLONE_LABEL, CONDITION_MASKED, CONDITION_READY, CONDITION_SNAPSHOT_RESOLVED,
    GENERATED_PASSWORD_LENGTH,
};
use crate::crd::{
    find_condition, set_condition, ClonePhase, Condition, DataClone, DataCloneStatus, DataProfile,
};
use crate::database::{secret_value, ConnectionInfo, DatabaseConnector, TableName};
use crate::masking::{MaskingPipeline, MaskingPlan, MaskingReport};
use crate::observability;
use crate::provider::{SnapshotHandle, SnapshotStatus, StorageProvider};
use crate::store::{ChildObject, ObjectKey, ObjectStore, StoreError};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one phase step
enum Progress {
    /// Phase persisted, continue with the returned copy
    Advanced(DataClone),
    /// Come back later without changing phase
    Requeue(Duration),
    /// Nothing more to do in this pass
    Done,
}

/// Outcome of looking for a snapshot to restore from
enum Resolution {
    Ready(SnapshotHandle),
    Waiting(String),
    Failed(String),
}

pub struct CloneReconciler {
    store: Arc<dyn ObjectStore>,
    storage: Arc<dyn StorageProvider>,
    databases: Arc<dyn DatabaseConnector>,
    config: ControllerConfig,
    /// Cancels in-flight masking runs on controller shutdown
    shutdown: CancellationToken,
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

/// Whether `secret` is the credentials secret an earlier pass created for this clone
fn is_clone_credentials(secret: &Secret, key: &ObjectKey) -> bool {
    secret
        .labels()
        .get(CLONE_LABEL)
        .is_some_and(|owner| *owner == key.name)
}

impl CloneReconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        storage: Arc<dyn StorageProvider>,
        databases: Arc<dyn DatabaseConnector>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            storage,
            databases,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn retries(&self) -> u32 {
        self.config.status_conflict_retries
    }

    /// Reconcile the clone stored under `key` as of `now`
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcilerError> {
        let Some(clone) = self.store.get_clone(key).await? else {
            debug!("DataClone {} no longer exists", key);
            return Ok(ReconcileOutcome::done());
        };

        if clone.metadata.deletion_timestamp.is_some() {
            return self.finalize(clone, now).await;
        }

        // The finalizer goes on before any child object exists
        let Some(mut clone) = status::add_finalizer(self.store.as_ref(), &clone, self.retries()).await?
        else {
            return Ok(ReconcileOutcome::done());
        };

        if clone.phase() == ClonePhase::Failed {
            let observed = clone.status.as_ref().and_then(|s| s.observed_generation);
            if observed == clone.metadata.generation {
                debug!("DataClone {} is Failed, waiting for a spec change", key);
                return Ok(ReconcileOutcome::done());
            }
            info!("🔁 DataClone {} changed after failing, starting over", key);
            match self.transition(&clone, ClonePhase::Pending, now, |_| {}).await? {
                Progress::Advanced(restarted) => clone = restarted,
                _ => return Ok(ReconcileOutcome::done()),
            }
        }

        loop {
            let progress = match clone.phase() {
                ClonePhase::Pending => self.start(&clone, now).await?,
                ClonePhase::CreatingStorage => self.provision_storage(&clone, key, now).await?,
                ClonePhase::Initializing => self.provision_instance(&clone, key, now).await?,
                ClonePhase::MaskingInProgress => self.apply_masking(&clone, key, now).await?,
                ClonePhase::Ready => return self.check_expiry(clone, key, now).await,
                ClonePhase::Failed | ClonePhase::Deleting => Progress::Done,
            };
            match progress {
                Progress::Advanced(next) => clone = next,
                Progress::Requeue(after) => return Ok(ReconcileOutcome::requeue(after)),
                Progress::Done => return Ok(ReconcileOutcome::done()),
            }
        }
    }

    /// Persist a new phase together with the Ready condition and any extra status edits
    async fn transition<F>(
        &self,
        clone: &DataClone,
        phase: ClonePhase,
        now: DateTime<Utc>,
        extra: F,
    ) -> Result<Progress, ReconcilerError>
    where
        F: Fn(&mut DataCloneStatus) + Send + Sync,
    {
        let from = clone.phase();
        if !from.can_transition_to(phase) {
            warn!(
                "DataClone {}: unexpected phase change {} → {}",
                clone.name_any(),
                from,
                phase
            );
        }
        let ready = if phase == ClonePhase::Ready {
            Condition::new(CONDITION_READY, true, "Ready", "clone is ready for connections", now)
        } else {
            Condition::new(
                CONDITION_READY,
                false,
                phase.as_str(),
                format!("clone is {phase}"),
                now,
            )
        };

        let updated = status::update_status(
            self.store.as_ref(),
            clone,
            self.retries(),
            |c: &mut DataClone| {
                let generation = c.metadata.generation;
                let status = clone_status_mut(c);
                status.phase = Some(phase);
                status.observed_generation = generation;
                set_condition(&mut status.conditions, ready.clone());
                extra(status);
            },
        )
        .await?;

        info!("DataClone {}: {} → {}", clone.name_any(), from, phase);
        observability::metrics::increment_clone_phase_transitions(phase.as_str());
        Ok(updated.map_or(Progress::Done, Progress::Advanced))
    }

    /// Move to Failed. Stays there until the clone is edited.
    async fn fail(
        &self,
        clone: &DataClone,
        also: Option<&'static str>,
        reason: &'static str,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<Progress, ReconcilerError> {
        warn!("❌ DataClone {} failed ({}): {}", clone.name_any(), reason, message);
        self.transition(clone, ClonePhase::Failed, now, |status| {
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_READY, false, reason, message.clone(), now),
            );
            if let Some(r#type) = also {
                set_condition(
                    &mut status.conditions,
                    Condition::new(r#type, false, reason, message.clone(), now),
                );
            }
        })
        .await?;
        Ok(Progress::Done)
    }

    /// Record a condition without changing phase, skipping no-op writes
    async fn note_condition(
        &self,
        clone: &DataClone,
        condition: Condition,
    ) -> Result<(), ReconcilerError> {
        let current = clone
            .status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, &condition.r#type));
        if current.is_some_and(|c| {
            c.status == condition.status
                && c.reason == condition.reason
                && c.message == condition.message
        }) {
            return Ok(());
        }
        status::update_status(self.store.as_ref(), clone, self.retries(), |c: &mut DataClone| {
            set_condition(&mut clone_status_mut(c).conditions, condition.clone());
        })
        .await?;
        Ok(())
    }

    /// Persist the tables the masking step has finished so far
    async fn record_masked_tables(
        &self,
        clone: &DataClone,
        masked: &BTreeSet<String>,
    ) -> Result<DataClone, ReconcilerError> {
        let tables: Vec<String> = masked.iter().cloned().collect();
        let updated = status::update_status(
            self.store.as_ref(),
            clone,
            self.retries(),
            |c: &mut DataClone| clone_status_mut(c).masked_tables.clone_from(&tables),
        )
        .await?;
        Ok(updated.unwrap_or_else(|| clone.clone()))
    }

    async fn create(&self, child: ChildObject) -> Result<(), ReconcilerError> {
        match self.store.create_child(&child).await {
            Ok(()) => {
                info!("Created {} {}", child.kind(), child.key());
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!("{} {} already exists", child.kind(), child.key());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn source_profile(
        &self,
        clone: &DataClone,
        key: &ObjectKey,
    ) -> Result<DataProfile, ReconcilerError> {
        let profile_key = key.sibling(&clone.spec.source_profile);
        self.store
            .get_profile(&profile_key)
            .await?
            .ok_or(ReconcilerError::MissingProfile(profile_key))
    }

    async fn start(&self, clone: &DataClone, now: DateTime<Utc>) -> Result<Progress, ReconcilerError> {
        if let Err(e) = parse_ttl(clone.spec.ttl.as_deref()) {
            return self.fail(clone, None, "InvalidTtl", e.to_string(), now).await;
        }
        self.transition(clone, ClonePhase::CreatingStorage, now, |_| {})
            .await
    }

    async fn resolve_snapshot(
        &self,
        clone: &DataClone,
        key: &ObjectKey,
    ) -> Result<Resolution, ReconcilerError> {
        if let Some(name) = &clone.spec.snapshot_name {
            let Some(handle) = self.storage.get_snapshot(&key.sibling(name)).await? else {
                return Ok(Resolution::Waiting(format!("snapshot {name} does not exist")));
            };
            return Ok(match self.storage.snapshot_status(&handle).await? {
                SnapshotStatus::Ready => Resolution::Ready(handle),
                SnapshotStatus::Pending => {
                    Resolution::Waiting(format!("snapshot {name} is not ready yet"))
                }
                SnapshotStatus::Failed(reason) => {
                    Resolution::Failed(format!("snapshot {name} failed: {reason}"))
                }
            });
        }

        let mut snapshots = self
            .storage
            .list_snapshots(&key.sibling(&clone.spec.source_profile))
            .await?;
        snapshots.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.name.cmp(&a.name))
        });
        for handle in snapshots {
            if self.storage.snapshot_status(&handle).await? == SnapshotStatus::Ready {
                return Ok(Resolution::Ready(handle));
            }
        }
        Ok(Resolution::Waiting(format!(
            "profile {} has no ready snapshot",
            clone.spec.source_profile
        )))
    }

    async fn provision_storage(
        &self,
        clone: &DataClone,
        key: &ObjectKey,
        now: DateTime<Utc>,
    ) -> Result<Progress, ReconcilerError> {
        let snapshot = match self.resolve_snapshot(clone, key).await? {
            Resolution::Ready(handle) => handle,
            Resolution::Waiting(message) => {
                info!("⏳ DataClone {} waiting for a snapshot: {}", key, message);
                self.note_condition(
                    clone,
                    Condition::new(CONDITION_SNAPSHOT_RESOLVED, false, "SnapshotNotReady", message, now),
                )
                .await?;
                return Ok(Progress::Requeue(self.config.snapshot_wait_requeue));
            }
            Resolution::Failed(message) => {
                return self
                    .fail(clone, Some(CONDITION_SNAPSHOT_RESOLVED), "SnapshotFailed", message, now)
                    .await;
            }
        };

        self.create(children::volume(clone, key, &snapshot, &self.config)?)
            .await?;

        let name = snapshot.name;
        self.transition(clone, ClonePhase::Initializing, now, |status| {
            status.snapshot_name = Some(name.clone());
            set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_SNAPSHOT_RESOLVED,
                    true,
                    "Resolved",
                    format!("restored from snapshot {name}"),
                    now,
                ),
            );
        })
        .await
    }

    /// Connection details for the clone database
    ///
    /// A credentials secret left by an earlier pass wins so a resumed reconcile keeps
    /// the same password. Otherwise the password comes from `passwordSecretRef`, then
    /// the profile's source secret, then a generated value.
    async fn resolve_connection(
        &self,
        clone: &DataClone,
        key: &ObjectKey,
        profile: &DataProfile,
    ) -> Result<ConnectionInfo, ReconcilerError> {
        if let Some(existing) = self.store.get_secret(key).await? {
            if is_clone_credentials(&existing, key) {
                return Ok(ConnectionInfo::from_secret(&existing)?);
            }
        }

        let engine = profile.spec.target.engine;
        let overrides = clone.spec.database.clone().unwrap_or_default();
        let source = match &profile.spec.target.secret_name {
            Some(name) => self.store.get_secret(&key.sibling(name)).await?,
            None => None,
        };
        let from_source = |field: &str| source.as_ref().and_then(|s| secret_value(s, field));

        let password = match &overrides.password_secret_ref {
            Some(reference) => {
                let secret_key = key.sibling(&reference.name);
                let secret = self.store.get_secret(&secret_key).await?.ok_or_else(|| {
                    StoreError::NotFound {
                        kind: "Secret",
                        key: secret_key.clone(),
                    }
                })?;
                secret_value(&secret, &reference.key).ok_or_else(|| {
                    ReconcilerError::MissingSecretKey {
                        key: secret_key,
                        field: reference.key.clone(),
                    }
                })?
            }
            None => from_source("password").unwrap_or_else(generate_password),
        };

        Ok(ConnectionInfo {
            host: format!("{}.{}.svc", key.name, key.namespace),
            port: engine.port(),
            user: overrides
                .user
                .or_else(|| from_source("user"))
                .unwrap_or_else(|| engine.default_user().to_string()),
            password,
            dbname: overrides
                .dbname
                .or_else(|| from_source("dbname"))
                .unwrap_or_else(|| engine.default_dbname().to_string()),
        })
    }

    async fn provision_instance(
        &self,
        clone: &DataClone,
        key: &ObjectKey,
        now: DateTime<Utc>,
    ) -> Result<Progress, ReconcilerError> {
        let profile = self.source_profile(clone, key).await?;
        let engine = profile.spec.target.engine;
        let connection = self.resolve_connection(clone, key, &profile).await?;

        self.create(children::compute(clone, key, engine, &self.config)?)
            .await?;
        self.create(children::credentials(clone, key, &connection)?)
            .await?;
        self.create(children::endpoint(clone, key, engine)?).await?;
        self.create(children::binding(clone, key, &self.config)?)
            .await?;

        self.transition(clone, ClonePhase::MaskingInProgress, now, |_| {})
            .await
    }

    async fn apply_masking(
        &self,
        clone: &DataClone,
        key: &ObjectKey,
        now: DateTime<Utc>,
    ) -> Result<Progress, ReconcilerError> {
        if !self.store.compute_ready(key).await? {
            info!("⏳ DataClone {} waiting for the database pod", key);
            return Ok(Progress::Requeue(self.config.compute_wait_requeue));
        }

        let profile = self.source_profile(clone, key).await?;
        let rules = &clone
            .spec
            .masking
            .as_ref()
            .unwrap_or(&profile.spec.masking)
            .rules;
        let plan = match MaskingPlan::compile(rules) {
            Ok(plan) => plan,
            Err(e) => {
                return self
                    .fail(clone, Some(CONDITION_MASKED), "UnknownRule", e.to_string(), now)
                    .await;
            }
        };

        let ttl = match parse_ttl(clone.spec.ttl.as_deref()) {
            Ok(ttl) => ttl,
            Err(e) => return self.fail(clone, None, "InvalidTtl", e.to_string(), now).await,
        };

        let mut clone = clone.clone();
        let report = if plan.is_empty() {
            MaskingReport::default()
        } else {
            let secret = self.store.get_secret(key).await?.ok_or_else(|| StoreError::NotFound {
                kind: "Secret",
                key: key.clone(),
            })?;
            let connection = ConnectionInfo::from_secret(&secret)?;
            let driver = self
                .databases
                .connect(profile.spec.target.engine, &connection)
                .await?;

            let mut masked: BTreeSet<String> = clone
                .status
                .as_ref()
                .map(|s| s.masked_tables.iter().cloned().collect())
                .unwrap_or_default();
            let (progress, mut finished) = mpsc::unbounded_channel();
            // Masks in place: the clone database is both source and sink
            let pipeline = MaskingPipeline::from_plan(Arc::clone(&driver), driver, plan)
                .with_max_concurrent_tables(self.config.masking_max_concurrent_tables)
                .skipping(masked.iter().filter_map(|t| TableName::parse_qualified(t)))
                .with_progress(progress);

            let run = pipeline.run(&self.shutdown);
            tokio::pin!(run);
            let result = loop {
                tokio::select! {
                    result = &mut run => break result,
                    Some(table) = finished.recv() => {
                        masked.insert(table.to_string());
                        clone = self.record_masked_tables(&clone, &masked).await?;
                    }
                }
            };
            let mut late = false;
            while let Ok(table) = finished.try_recv() {
                late |= masked.insert(table.to_string());
            }
            if late {
                clone = self.record_masked_tables(&clone, &masked).await?;
            }

            match result {
                Ok(report) => report,
                Err(e) => {
                    self.note_condition(
                        &clone,
                        Condition::new(CONDITION_MASKED, false, "MaskingFailed", e.to_string(), now),
                    )
                    .await?;
                    return Err(e.into());
                }
            }
        };

        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));
        let masked = format!(
            "masked {} table(s), {} row(s)",
            report.tables, report.rows
        );
        let secret_name = key.name.clone();
        let progress = self
            .transition(&clone, ClonePhase::Ready, now, |status| {
                status.connection_info_secret = Some(secret_name.clone());
                status.ready_time = Some(rfc3339(now));
                status.expires_at = expires_at.map(rfc3339);
                set_condition(
                    &mut status.conditions,
                    Condition::new(CONDITION_MASKED, true, "Masked", masked.clone(), now),
                );
            })
            .await?;
        info!("✅ DataClone {} is ready ({})", key, masked);
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_password_shape() {
        let a = generate_password();
        let b = generate_password();
        assert_eq!(a.len(), GENERATED_PASSWORD_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_rfc3339_uses_whole_seconds() {
        let at = DateTime::parse_from_rfc3339("2024-01-01T02:00:00.750Z")
            .expect("valid time")
            .with_timezone(&Utc);
        assert_eq!(rfc3339(at), "2024-01-01T02:00:00Z");
    }
}
