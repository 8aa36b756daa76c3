//! # In-Memory Object Store
//!
//! [`ObjectStore`] kept in process. Follows the API server where the reconcilers rely
//! on it: resourceVersion conflicts, finalizer-gated deletion, AlreadyExists and
//! NotFound on children.

use super::{ChildKind, ChildObject, ObjectKey, ObjectStore, StoreError};
use crate::crd::{ClonePhase, DataClone, DataProfile};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MemoryState {
    clones: BTreeMap<ObjectKey, DataClone>,
    profiles: BTreeMap<ObjectKey, DataProfile>,
    secrets: BTreeMap<ObjectKey, Secret>,
    children: BTreeMap<(ChildKind, ObjectKey), ChildObject>,
    ready_compute: BTreeSet<ObjectKey>,
    phase_history: BTreeMap<ObjectKey, Vec<ClonePhase>>,
    next_version: u64,
}

impl MemoryState {
    fn bump(&mut self, meta: &mut ObjectMeta) {
        self.next_version += 1;
        meta.resource_version = Some(self.next_version.to_string());
    }

    fn admit(&mut self, meta: &mut ObjectMeta, key: &ObjectKey) {
        meta.namespace = Some(key.namespace.clone());
        meta.uid.get_or_insert_with(|| format!("uid-{}-{}", key.namespace, key.name));
        meta.generation.get_or_insert(1);
        self.bump(meta);
    }
}

/// Reject a write whose resourceVersion no longer matches the stored object
fn check_version(
    kind: &'static str,
    key: &ObjectKey,
    stored: &ObjectMeta,
    incoming: &ObjectMeta,
) -> Result<(), StoreError> {
    match &incoming.resource_version {
        Some(version) if stored.resource_version.as_ref() != Some(version) => {
            Err(StoreError::Conflict {
                kind,
                key: key.clone(),
                message: format!(
                    "resourceVersion {version} is stale (current {})",
                    stored.resource_version.as_deref().unwrap_or("none")
                ),
            })
        }
        _ => Ok(()),
    }
}

fn mark_deleted(kind: &'static str, key: &ObjectKey, meta: &mut ObjectMeta) -> Result<(), StoreError> {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let timestamp = serde_json::from_value(serde_json::Value::String(now)).map_err(|source| {
        StoreError::Encode {
            kind,
            key: key.clone(),
            source,
        }
    })?;
    meta.deletion_timestamp.get_or_insert(timestamp);
    Ok(())
}

fn has_finalizers(meta: &ObjectMeta) -> bool {
    meta.finalizers.as_ref().is_some_and(|f| !f.is_empty())
}

/// Object store kept entirely in memory
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    compute_ready_on_create: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store whose pods report Ready as soon as they are created
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            compute_ready_on_create: true,
        }
    }

    /// Store whose pods stay unready until [`MemoryStore::set_compute_ready`] is called
    pub fn with_unready_compute() -> Self {
        Self {
            compute_ready_on_create: false,
            ..Self::new()
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_clone(&self, mut clone: DataClone) -> DataClone {
        let key = ObjectKey::for_resource(&clone);
        let mut state = self.state();
        state.admit(&mut clone.metadata, &key);
        state.clones.insert(key, clone.clone());
        clone
    }

    pub fn insert_profile(&self, mut profile: DataProfile) -> DataProfile {
        let key = ObjectKey::for_resource(&profile);
        let mut state = self.state();
        state.admit(&mut profile.metadata, &key);
        state.profiles.insert(key, profile.clone());
        profile
    }

    pub fn insert_secret(&self, mut secret: Secret) {
        let key = ObjectKey::for_resource(&secret);
        let mut state = self.state();
        state.admit(&mut secret.metadata, &key);
        state.secrets.insert(key, secret);
    }

    /// Place a child object directly, as if an earlier reconcile had created it
    pub fn insert_child(&self, child: ChildObject) {
        self.state()
            .children
            .insert((child.kind(), child.key()), child);
    }

    /// Replace the stored profile spec and bump its generation
    pub fn edit_profile(&self, key: &ObjectKey, edit: impl FnOnce(&mut DataProfile)) {
        let mut state = self.state();
        let Some(mut profile) = state.profiles.get(key).cloned() else {
            return;
        };
        edit(&mut profile);
        profile.metadata.generation = Some(profile.metadata.generation.unwrap_or(1) + 1);
        state.bump(&mut profile.metadata);
        state.profiles.insert(key.clone(), profile);
    }

    /// Replace the stored clone spec and bump its generation
    pub fn edit_clone(&self, key: &ObjectKey, edit: impl FnOnce(&mut DataClone)) {
        let mut state = self.state();
        let Some(mut clone) = state.clones.get(key).cloned() else {
            return;
        };
        edit(&mut clone);
        clone.metadata.generation = Some(clone.metadata.generation.unwrap_or(1) + 1);
        state.bump(&mut clone.metadata);
        state.clones.insert(key.clone(), clone);
    }

    /// Remove a profile record outright, bypassing finalizers
    pub fn remove_profile(&self, key: &ObjectKey) {
        self.state().profiles.remove(key);
    }

    /// Request deletion of a profile, honouring finalizers
    pub fn request_profile_deletion(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.state();
        let Some(mut stored) = state.profiles.get(key).cloned() else {
            return Err(StoreError::NotFound {
                kind: "DataProfile",
                key: key.clone(),
            });
        };
        if has_finalizers(&stored.metadata) {
            mark_deleted("DataProfile", key, &mut stored.metadata)?;
            state.bump(&mut stored.metadata);
            state.profiles.insert(key.clone(), stored);
        } else {
            state.profiles.remove(key);
        }
        Ok(())
    }

    pub fn clone_record(&self, key: &ObjectKey) -> Option<DataClone> {
        self.state().clones.get(key).cloned()
    }

    pub fn profile_record(&self, key: &ObjectKey) -> Option<DataProfile> {
        self.state().profiles.get(key).cloned()
    }

    pub fn child(&self, kind: ChildKind, key: &ObjectKey) -> Option<ChildObject> {
        self.state().children.get(&(kind, key.clone())).cloned()
    }

    pub fn child_exists(&self, kind: ChildKind, key: &ObjectKey) -> bool {
        self.state().children.contains_key(&(kind, key.clone()))
    }

    /// Child kinds currently present under `key`
    pub fn children_of(&self, key: &ObjectKey) -> Vec<ChildKind> {
        self.state()
            .children
            .keys()
            .filter(|(_, child_key)| child_key == key)
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn set_compute_ready(&self, key: &ObjectKey, ready: bool) {
        let mut state = self.state();
        if ready {
            state.ready_compute.insert(key.clone());
        } else {
            state.ready_compute.remove(key);
        }
    }

    /// Every phase written to the clone's status, in order
    pub fn clone_phase_history(&self, key: &ObjectKey) -> Vec<ClonePhase> {
        self.state()
            .phase_history
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_clone(&self, key: &ObjectKey) -> Result<Option<DataClone>, StoreError> {
        Ok(self.clone_record(key))
    }

    async fn update_clone_finalizers(&self, clone: &DataClone) -> Result<DataClone, StoreError> {
        let key = ObjectKey::for_resource(clone);
        let mut state = self.state();
        let mut stored = state
            .clones
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "DataClone",
                key: key.clone(),
            })?;
        check_version("DataClone", &key, &stored.metadata, &clone.metadata)?;
        stored.metadata.finalizers.clone_from(&clone.metadata.finalizers);
        state.bump(&mut stored.metadata);

        if stored.metadata.deletion_timestamp.is_some() && !has_finalizers(&stored.metadata) {
            state.clones.remove(&key);
        } else {
            state.clones.insert(key, stored.clone());
        }
        Ok(stored)
    }

    async fn update_clone_status(&self, clone: &DataClone) -> Result<DataClone, StoreError> {
        let key = ObjectKey::for_resource(clone);
        let mut state = self.state();
        let mut stored = state
            .clones
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "DataClone",
                key: key.clone(),
            })?;
        check_version("DataClone", &key, &stored.metadata, &clone.metadata)?;
        stored.status.clone_from(&clone.status);
        state.bump(&mut stored.metadata);

        if let Some(phase) = stored.status.as_ref().and_then(|s| s.phase) {
            let history = state.phase_history.entry(key.clone()).or_default();
            if history.last() != Some(&phase) {
                history.push(phase);
            }
        }
        state.clones.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete_clone(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.state();
        let Some(mut stored) = state.clones.get(key).cloned() else {
            return Err(StoreError::NotFound {
                kind: "DataClone",
                key: key.clone(),
            });
        };
        if has_finalizers(&stored.metadata) {
            mark_deleted("DataClone", key, &mut stored.metadata)?;
            state.bump(&mut stored.metadata);
            state.clones.insert(key.clone(), stored);
        } else {
            state.clones.remove(key);
        }
        Ok(())
    }

    async fn get_profile(&self, key: &ObjectKey) -> Result<Option<DataProfile>, StoreError> {
        Ok(self.profile_record(key))
    }

    async fn update_profile_finalizers(
        &self,
        profile: &DataProfile,
    ) -> Result<DataProfile, StoreError> {
        let key = ObjectKey::for_resource(profile);
        let mut state = self.state();
        let mut stored = state
            .profiles
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "DataProfile",
                key: key.clone(),
            })?;
        check_version("DataProfile", &key, &stored.metadata, &profile.metadata)?;
        stored.metadata.finalizers.clone_from(&profile.metadata.finalizers);
        state.bump(&mut stored.metadata);

        if stored.metadata.deletion_timestamp.is_some() && !has_finalizers(&stored.metadata) {
            state.profiles.remove(&key);
        } else {
            state.profiles.insert(key, stored.clone());
        }
        Ok(stored)
    }

    async fn update_profile_status(
        &self,
        profile: &DataProfile,
    ) -> Result<DataProfile, StoreError> {
        let key = ObjectKey::for_resource(profile);
        let mut state = self.state();
        let mut stored = state
            .profiles
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "DataProfile",
                key: key.clone(),
            })?;
        check_version("DataProfile", &key, &stored.metadata, &profile.metadata)?;
        stored.status.clone_from(&profile.status);
        state.bump(&mut stored.metadata);
        state.profiles.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>, StoreError> {
        let state = self.state();
        if let Some(secret) = state.secrets.get(key) {
            return Ok(Some(secret.clone()));
        }
        // Clone credentials live among the children
        Ok(match state.children.get(&(ChildKind::Credentials, key.clone())) {
            Some(ChildObject::Credentials(secret)) => Some(secret.clone()),
            _ => None,
        })
    }

    async fn create_child(&self, child: &ChildObject) -> Result<(), StoreError> {
        let kind = child.kind();
        let key = child.key();
        let mut state = self.state();
        if state.children.contains_key(&(kind, key.clone())) {
            return Err(StoreError::AlreadyExists {
                kind: kind.as_str(),
                key,
            });
        }
        if kind == ChildKind::Compute && self.compute_ready_on_create {
            state.ready_compute.insert(key.clone());
        }
        state.children.insert((kind, key), child.clone());
        Ok(())
    }

    async fn delete_child(&self, kind: ChildKind, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.state();
        if kind == ChildKind::Compute {
            state.ready_compute.remove(key);
        }
        state
            .children
            .remove(&(kind, key.clone()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.as_str(),
                key: key.clone(),
            })
    }

    async fn compute_ready(&self, key: &ObjectKey) -> Result<bool, StoreError> {
        let state = self.state();
        Ok(state.children.contains_key(&(ChildKind::Compute, key.clone()))
            && state.ready_compute.contains(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DataCloneSpec, DataCloneStatus};

    fn clone_named(name: &str) -> DataClone {
        let mut clone = DataClone::new(
            name,
            DataCloneSpec {
                source_profile: "nightly".to_string(),
                snapshot_name: None,
                ttl: None,
                database: None,
                pod: None,
                storage: None,
                masking: None,
            },
        );
        clone.metadata.namespace = Some("default".to_string());
        clone
    }

    #[tokio::test]
    async fn test_stale_status_write_conflicts() {
        let store = MemoryStore::new();
        let original = store.insert_clone(clone_named("a"));

        let mut first = original.clone();
        first.status = Some(DataCloneStatus::default());
        store.update_clone_status(&first).await.expect("first write");

        let mut stale = original;
        stale.status = Some(DataCloneStatus::default());
        let err = store
            .update_clone_status(&stale)
            .await
            .expect_err("stale write rejected");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let store = MemoryStore::new();
        let key = ObjectKey::new("default", "a");
        let mut clone = clone_named("a");
        clone.metadata.finalizers = Some(vec!["x".to_string()]);
        store.insert_clone(clone);

        store.delete_clone(&key).await.expect("delete accepted");
        let mut pending = store.clone_record(&key).expect("record kept");
        assert!(pending.metadata.deletion_timestamp.is_some());

        pending.metadata.finalizers = Some(Vec::new());
        store
            .update_clone_finalizers(&pending)
            .await
            .expect("finalizer removed");
        assert!(store.clone_record(&key).is_none());
    }
}
