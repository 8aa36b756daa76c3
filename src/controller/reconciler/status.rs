//! # Status and Finalizer Writes
//!
//! Every write the reconcilers make to their own resources goes through here. A write
//! rejected for a stale resourceVersion is retried against a fresh copy with the same
//! mutation applied, so concurrent writers never overwrite each other.

use super::types::ReconcilerError;
use crate::constants::FINALIZER;
use crate::crd::{DataClone, DataCloneStatus, DataProfile, DataProfileStatus};
use crate::store::{ObjectKey, ObjectStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use kube::ResourceExt;
use tracing::debug;

/// A resource the reconcilers persist through the [`ObjectStore`]
#[async_trait]
pub trait Persisted: kube::Resource + Clone + Send + Sync + Sized {
    const KIND: &'static str;

    async fn fetch(store: &dyn ObjectStore, key: &ObjectKey) -> Result<Option<Self>, StoreError>;

    async fn write_status(&self, store: &dyn ObjectStore) -> Result<Self, StoreError>;

    async fn write_finalizers(&self, store: &dyn ObjectStore) -> Result<Self, StoreError>;
}

#[async_trait]
impl Persisted for DataClone {
    const KIND: &'static str = "DataClone";

    async fn fetch(store: &dyn ObjectStore, key: &ObjectKey) -> Result<Option<Self>, StoreError> {
        store.get_clone(key).await
    }

    async fn write_status(&self, store: &dyn ObjectStore) -> Result<Self, StoreError> {
        store.update_clone_status(self).await
    }

    async fn write_finalizers(&self, store: &dyn ObjectStore) -> Result<Self, StoreError> {
        store.update_clone_finalizers(self).await
    }
}

#[async_trait]
impl Persisted for DataProfile {
    const KIND: &'static str = "DataProfile";

    async fn fetch(store: &dyn ObjectStore, key: &ObjectKey) -> Result<Option<Self>, StoreError> {
        store.get_profile(key).await
    }

    async fn write_status(&self, store: &dyn ObjectStore) -> Result<Self, StoreError> {
        store.update_profile_status(self).await
    }

    async fn write_finalizers(&self, store: &dyn ObjectStore) -> Result<Self, StoreError> {
        store.update_profile_finalizers(self).await
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Status,
    Finalizers,
}

/// Apply `mutate` and write, re-fetching and re-applying on conflict.
///
/// Returns `Ok(None)` when the resource disappeared between attempts.
async fn write_with_retry<K, F>(
    store: &dyn ObjectStore,
    resource: &K,
    attempts: u32,
    target: Target,
    mutate: F,
) -> Result<Option<K>, ReconcilerError>
where
    K: Persisted,
    F: Fn(&mut K) + Send + Sync,
{
    let key = ObjectKey::for_resource(resource);
    let attempts = attempts.max(1);
    let mut current = resource.clone();
    let mut attempt = 0;
    loop {
        attempt += 1;
        mutate(&mut current);
        let written = match target {
            Target::Status => current.write_status(store).await,
            Target::Finalizers => current.write_finalizers(store).await,
        };
        match written {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!(
                    "{} {} changed underneath us (attempt {}/{}), retrying: {}",
                    K::KIND,
                    key,
                    attempt,
                    attempts,
                    e
                );
                match K::fetch(store, &key).await? {
                    Some(fresh) => current = fresh,
                    None => return Ok(None),
                }
            }
            Err(e) if e.is_conflict() => {
                return Err(ReconcilerError::ConflictRetriesExhausted { key, attempts });
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Write a status mutation
pub async fn update_status<K, F>(
    store: &dyn ObjectStore,
    resource: &K,
    attempts: u32,
    mutate: F,
) -> Result<Option<K>, ReconcilerError>
where
    K: Persisted,
    F: Fn(&mut K) + Send + Sync,
{
    write_with_retry(store, resource, attempts, Target::Status, mutate).await
}

pub fn has_finalizer<K: kube::Resource>(resource: &K) -> bool {
    resource.finalizers().iter().any(|f| f == FINALIZER)
}

/// Add the controller finalizer if it is missing
pub async fn add_finalizer<K: Persisted>(
    store: &dyn ObjectStore,
    resource: &K,
    attempts: u32,
) -> Result<Option<K>, ReconcilerError> {
    if has_finalizer(resource) {
        return Ok(Some(resource.clone()));
    }
    write_with_retry(store, resource, attempts, Target::Finalizers, |r: &mut K| {
        if !has_finalizer(r) {
            r.finalizers_mut().push(FINALIZER.to_string());
        }
    })
    .await
}

/// Remove the controller finalizer. Once no finalizer is left the store may drop
/// the record, so the result may be `None`.
pub async fn remove_finalizer<K: Persisted>(
    store: &dyn ObjectStore,
    resource: &K,
    attempts: u32,
) -> Result<Option<K>, ReconcilerError> {
    if !has_finalizer(resource) {
        return Ok(Some(resource.clone()));
    }
    match write_with_retry(store, resource, attempts, Target::Finalizers, |r: &mut K| {
        r.finalizers_mut().retain(|f| f != FINALIZER);
    })
    .await
    {
        Err(ReconcilerError::Store(e)) if e.is_not_found() => Ok(None),
        other => other,
    }
}

/// Status timestamp format, whole seconds in UTC
pub fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn clone_status_mut(clone: &mut DataClone) -> &mut DataCloneStatus {
    clone.status.get_or_insert_with(DataCloneStatus::default)
}

pub fn profile_status_mut(profile: &mut DataProfile) -> &mut DataProfileStatus {
    profile.status.get_or_insert_with(DataProfileStatus::default)
}
