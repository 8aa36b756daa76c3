//! # CSI VolumeSnapshot Provider
//!
//! Snapshots are `snapshot.storage.k8s.io/v1` VolumeSnapshots accessed as dynamic
//! objects, so the controller does not need the external-snapshotter types.
//! Ownership is expressed by the profile label only; snapshots outlive their profile.

use super::{snapshot_name, SnapshotHandle, SnapshotStatus, StorageError, StorageProvider};
use crate::config::StorageProviderKind;
use crate::constants::{
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, PROFILE_LABEL, SNAPSHOT_API_GROUP, SNAPSHOT_API_VERSION,
    SNAPSHOT_KIND, TAKEN_AT_ANNOTATION,
};
use crate::store::ObjectKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Storage provider backed by CSI VolumeSnapshots
#[derive(Clone)]
pub struct CsiSnapshotProvider {
    client: Client,
    resource: ApiResource,
    kind: StorageProviderKind,
    snapshot_class: Option<String>,
}

impl std::fmt::Debug for CsiSnapshotProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsiSnapshotProvider")
            .field("kind", &self.kind)
            .field("snapshot_class", &self.snapshot_class)
            .finish_non_exhaustive()
    }
}

impl CsiSnapshotProvider {
    pub fn new(client: Client, kind: StorageProviderKind, snapshot_class: Option<String>) -> Self {
        let gvk = GroupVersionKind::gvk(SNAPSHOT_API_GROUP, SNAPSHOT_API_VERSION, SNAPSHOT_KIND);
        Self {
            client,
            resource: ApiResource::from_gvk(&gvk),
            kind,
            snapshot_class,
        }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

/// Read the fire time from the annotation, falling back to the creation timestamp
fn created_at(obj: &DynamicObject) -> Option<DateTime<Utc>> {
    let annotated = obj
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(TAKEN_AT_ANNOTATION))
        .cloned();
    let created = obj
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(|ts| serde_json::to_value(ts).ok())
        .and_then(|v| v.as_str().map(str::to_string));

    annotated
        .or(created)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn to_handle(obj: &DynamicObject) -> Option<SnapshotHandle> {
    let name = obj.metadata.name.clone()?;
    let namespace = obj.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
    let profile = obj
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(PROFILE_LABEL))
        .cloned()?;
    let Some(created_at) = created_at(obj) else {
        warn!("VolumeSnapshot {}/{} has no usable timestamp, skipping", namespace, name);
        return None;
    };
    let restore_size = obj.data["status"]["restoreSize"]
        .as_str()
        .map(str::to_string);

    Some(SnapshotHandle {
        namespace,
        name,
        profile,
        created_at,
        restore_size,
    })
}

fn to_status(obj: &DynamicObject) -> SnapshotStatus {
    let status = &obj.data["status"];
    if let Some(message) = status["error"]["message"].as_str() {
        return SnapshotStatus::Failed(message.to_string());
    }
    if status["readyToUse"].as_bool().unwrap_or(false) {
        SnapshotStatus::Ready
    } else {
        SnapshotStatus::Pending
    }
}

fn api_error(key: &ObjectKey, err: kube::Error) -> StorageError {
    match err {
        kube::Error::Api(ref api_err) if api_err.code == 409 => StorageError::AlreadyExists(key.clone()),
        source => StorageError::Api {
            key: key.clone(),
            source,
        },
    }
}

#[async_trait]
impl StorageProvider for CsiSnapshotProvider {
    async fn create_snapshot(
        &self,
        owner: &ObjectKey,
        volume: &str,
        taken_at: DateTime<Utc>,
    ) -> Result<SnapshotHandle, StorageError> {
        let name = snapshot_name(&owner.name, taken_at);
        let key = owner.sibling(name.clone());

        let mut obj = DynamicObject::new(&name, &self.resource).within(&owner.namespace);
        obj.metadata.labels = Some(BTreeMap::from([
            (PROFILE_LABEL.to_string(), owner.name.clone()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        ]));
        obj.metadata.annotations = Some(BTreeMap::from([(
            TAKEN_AT_ANNOTATION.to_string(),
            taken_at.to_rfc3339(),
        )]));
        let mut spec = json!({ "source": { "persistentVolumeClaimName": volume } });
        if let Some(class) = &self.snapshot_class {
            spec["volumeSnapshotClassName"] = json!(class);
        }
        obj.data = json!({ "spec": spec });

        info!(
            "📸 Creating {:?} VolumeSnapshot {} from PVC {}",
            self.kind, key, volume
        );
        self.api(&owner.namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| api_error(&key, e))?;

        Ok(SnapshotHandle {
            namespace: owner.namespace.clone(),
            name,
            profile: owner.name.clone(),
            created_at: taken_at,
            restore_size: None,
        })
    }

    async fn snapshot_status(
        &self,
        handle: &SnapshotHandle,
    ) -> Result<SnapshotStatus, StorageError> {
        let key = handle.key();
        let obj = self
            .api(&handle.namespace)
            .get_opt(&handle.name)
            .await
            .map_err(|e| api_error(&key, e))?;
        Ok(obj.map_or_else(
            || SnapshotStatus::Failed(format!("snapshot {key} no longer exists")),
            |obj| to_status(&obj),
        ))
    }

    async fn get_snapshot(&self, key: &ObjectKey) -> Result<Option<SnapshotHandle>, StorageError> {
        let obj = self
            .api(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| api_error(key, e))?;
        Ok(obj.as_ref().and_then(to_handle))
    }

    async fn list_snapshots(&self, owner: &ObjectKey) -> Result<Vec<SnapshotHandle>, StorageError> {
        let selector = format!("{PROFILE_LABEL}={}", owner.name);
        let list = self
            .api(&owner.namespace)
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| api_error(owner, e))?;
        let handles: Vec<SnapshotHandle> = list.items.iter().filter_map(to_handle).collect();
        debug!("Found {} snapshots for profile {}", handles.len(), owner);
        Ok(handles)
    }

    async fn delete_snapshot(&self, handle: &SnapshotHandle) -> Result<(), StorageError> {
        let key = handle.key();
        match self
            .api(&handle.namespace)
            .delete(&handle.name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(e) => Err(api_error(&key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(data: serde_json::Value) -> DynamicObject {
        let gvk = GroupVersionKind::gvk(SNAPSHOT_API_GROUP, SNAPSHOT_API_VERSION, SNAPSHOT_KIND);
        let mut obj = DynamicObject::new("nightly-1704074400", &ApiResource::from_gvk(&gvk))
            .within("default");
        obj.metadata.labels = Some(BTreeMap::from([(
            PROFILE_LABEL.to_string(),
            "nightly".to_string(),
        )]));
        obj.metadata.annotations = Some(BTreeMap::from([(
            TAKEN_AT_ANNOTATION.to_string(),
            "2024-01-01T02:00:00+00:00".to_string(),
        )]));
        obj.data = data;
        obj
    }

    #[test]
    fn test_to_handle_reads_labels_and_restore_size() {
        let obj = snapshot(json!({ "status": { "readyToUse": true, "restoreSize": "20Gi" } }));
        let handle = to_handle(&obj).expect("handle");
        assert_eq!(handle.profile, "nightly");
        assert_eq!(handle.created_at.timestamp(), 1_704_074_400);
        assert_eq!(handle.restore_size.as_deref(), Some("20Gi"));
    }

    #[test]
    fn test_to_status() {
        assert_eq!(
            to_status(&snapshot(json!({ "status": { "readyToUse": true } }))),
            SnapshotStatus::Ready
        );
        assert_eq!(to_status(&snapshot(json!({}))), SnapshotStatus::Pending);
        assert_eq!(
            to_status(&snapshot(
                json!({ "status": { "readyToUse": false, "error": { "message": "quota" } } })
            )),
            SnapshotStatus::Failed("quota".to_string())
        );
    }
}
