//! # Clone Child Objects
//!
//! Builders for the objects a DataClone owns. Every object is named after the clone,
//! labelled with it and carries a controller ownerReference back to it.

use crate::config::ControllerConfig;
use crate::constants::{
    CLONE_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE, SNAPSHOT_API_GROUP, SNAPSHOT_KIND,
};
use crate::crd::{DataClone, DatabaseEngine};
use crate::database::ConnectionInfo;
use crate::provider::SnapshotHandle;
use crate::store::{ChildKind, ChildObject, ObjectKey, StoreError};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

const DATA_VOLUME: &str = "data";
const PORT_NAME: &str = "db";

fn decode<T: DeserializeOwned>(
    kind: ChildKind,
    key: &ObjectKey,
    value: Value,
) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|source| StoreError::Encode {
        kind: kind.as_str(),
        key: key.clone(),
        source,
    })
}

/// Metadata shared by every child of `clone`
fn metadata(clone: &DataClone, key: &ObjectKey) -> Value {
    let mut meta = json!({
        "name": key.name,
        "namespace": key.namespace,
        "labels": {
            MANAGED_BY_LABEL: MANAGED_BY_VALUE,
            CLONE_LABEL: key.name,
        },
    });
    if let Some(owner) = clone.controller_owner_ref(&()) {
        meta["ownerReferences"] = json!([owner]);
    }
    meta
}

pub fn volume(
    clone: &DataClone,
    key: &ObjectKey,
    snapshot: &SnapshotHandle,
    config: &ControllerConfig,
) -> Result<ChildObject, StoreError> {
    let storage = clone.spec.storage.clone().unwrap_or_default();
    let size = snapshot
        .restore_size
        .clone()
        .or(storage.size)
        .unwrap_or_else(|| config.clone_volume_size.clone());

    let mut spec = json!({
        "accessModes": ["ReadWriteOnce"],
        "resources": { "requests": { "storage": size } },
        "dataSource": {
            "apiGroup": SNAPSHOT_API_GROUP,
            "kind": SNAPSHOT_KIND,
            "name": snapshot.name,
        },
    });
    if let Some(class) = storage
        .storage_class_name
        .or_else(|| config.clone_storage_class.clone())
    {
        spec["storageClassName"] = json!(class);
    }

    decode(
        ChildKind::Volume,
        key,
        json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": metadata(clone, key),
            "spec": spec,
        }),
    )
    .map(ChildObject::Volume)
}

/// Container environment variable name and the credentials key it is read from
fn engine_env(engine: DatabaseEngine) -> &'static [(&'static str, &'static str)] {
    match engine {
        DatabaseEngine::Postgres => &[
            ("POSTGRES_USER", "user"),
            ("POSTGRES_PASSWORD", "password"),
            ("POSTGRES_DB", "dbname"),
        ],
        DatabaseEngine::Mysql => &[("MYSQL_ROOT_PASSWORD", "password"), ("MYSQL_DATABASE", "dbname")],
    }
}

pub fn service_account(clone: &DataClone, config: &ControllerConfig) -> String {
    clone
        .spec
        .pod
        .as_ref()
        .and_then(|pod| pod.service_account_name.clone())
        .unwrap_or_else(|| config.clone_service_account.clone())
}

pub fn compute(
    clone: &DataClone,
    key: &ObjectKey,
    engine: DatabaseEngine,
    config: &ControllerConfig,
) -> Result<ChildObject, StoreError> {
    let image = clone
        .spec
        .database
        .as_ref()
        .and_then(|db| db.image.clone())
        .unwrap_or_else(|| match engine {
            DatabaseEngine::Postgres => config.postgres_image.clone(),
            DatabaseEngine::Mysql => config.mysql_image.clone(),
        });
    let env: Vec<Value> = engine_env(engine)
        .iter()
        .map(|(name, secret_key)| {
            json!({
                "name": name,
                "valueFrom": { "secretKeyRef": { "name": key.name, "key": secret_key } },
            })
        })
        .collect();

    let mut container = json!({
        "name": engine.as_str(),
        "image": image,
        "ports": [{ "name": PORT_NAME, "containerPort": engine.port() }],
        "env": env,
        "volumeMounts": [{ "name": DATA_VOLUME, "mountPath": engine.data_dir() }],
        "readinessProbe": {
            "tcpSocket": { "port": engine.port() },
            "initialDelaySeconds": 5,
            "periodSeconds": 5,
        },
    });
    if let Some(resources) = clone.spec.pod.as_ref().and_then(|pod| pod.resources.as_ref()) {
        container["resources"] = json!({
            "requests": resources.requests,
            "limits": resources.limits,
        });
    }

    decode(
        ChildKind::Compute,
        key,
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": metadata(clone, key),
            "spec": {
                "serviceAccountName": service_account(clone, config),
                "restartPolicy": "Always",
                "containers": [container],
                "volumes": [{
                    "name": DATA_VOLUME,
                    "persistentVolumeClaim": { "claimName": key.name },
                }],
            },
        }),
    )
    .map(ChildObject::Compute)
}

pub fn credentials(
    clone: &DataClone,
    key: &ObjectKey,
    connection: &ConnectionInfo,
) -> Result<ChildObject, StoreError> {
    decode(
        ChildKind::Credentials,
        key,
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": metadata(clone, key),
            "type": "Opaque",
            "stringData": connection.to_string_data(),
        }),
    )
    .map(ChildObject::Credentials)
}

pub fn endpoint(
    clone: &DataClone,
    key: &ObjectKey,
    engine: DatabaseEngine,
) -> Result<ChildObject, StoreError> {
    decode(
        ChildKind::Endpoint,
        key,
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": metadata(clone, key),
            "spec": {
                "selector": { CLONE_LABEL: key.name },
                "ports": [{
                    "name": PORT_NAME,
                    "port": engine.port(),
                    "targetPort": engine.port(),
                }],
            },
        }),
    )
    .map(ChildObject::Endpoint)
}

pub fn binding(
    clone: &DataClone,
    key: &ObjectKey,
    config: &ControllerConfig,
) -> Result<ChildObject, StoreError> {
    decode(
        ChildKind::Binding,
        key,
        json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "RoleBinding",
            "metadata": metadata(clone, key),
            "roleRef": {
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "ClusterRole",
                "name": config.clone_cluster_role,
            },
            "subjects": [{
                "kind": "ServiceAccount",
                "name": service_account(clone, config),
                "namespace": key.namespace,
            }],
        }),
    )
    .map(ChildObject::Binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ComputeResources, DataCloneSpec, PodOverrides, StorageOverrides};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn clone() -> (DataClone, ObjectKey) {
        let mut clone = DataClone::new(
            "pr-123",
            DataCloneSpec {
                source_profile: "nightly".to_string(),
                snapshot_name: None,
                ttl: None,
                database: None,
                pod: Some(PodOverrides {
                    resources: Some(ComputeResources {
                        requests: BTreeMap::from([("cpu".to_string(), "250m".to_string())]),
                        limits: BTreeMap::new(),
                    }),
                    service_account_name: None,
                }),
                storage: Some(StorageOverrides {
                    size: Some("20Gi".to_string()),
                    storage_class_name: None,
                }),
                masking: None,
            },
        );
        clone.metadata.namespace = Some("dev".to_string());
        clone.metadata.uid = Some("uid-1".to_string());
        let key = ObjectKey::for_resource(&clone);
        (clone, key)
    }

    fn snapshot(restore_size: Option<&str>) -> SnapshotHandle {
        SnapshotHandle {
            namespace: "dev".to_string(),
            name: "nightly-1704074400".to_string(),
            profile: "nightly".to_string(),
            created_at: Utc::now(),
            restore_size: restore_size.map(ToString::to_string),
        }
    }

    fn labels_and_owner(meta: &kube::api::ObjectMeta) {
        let labels = meta.labels.clone().unwrap_or_default();
        assert_eq!(labels.get(CLONE_LABEL).map(String::as_str), Some("pr-123"));
        assert_eq!(
            labels.get(MANAGED_BY_LABEL).map(String::as_str),
            Some(MANAGED_BY_VALUE)
        );
        let owners = meta.owner_references.clone().unwrap_or_default();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "DataClone");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn test_volume_restores_from_snapshot() {
        let (clone, key) = clone();
        let config = ControllerConfig::default();

        let ChildObject::Volume(pvc) = volume(&clone, &key, &snapshot(Some("8Gi")), &config)
            .expect("volume")
        else {
            panic!("expected a volume");
        };
        labels_and_owner(&pvc.metadata);
        let spec = pvc.spec.expect("spec");
        let source = spec.data_source.expect("data source");
        assert_eq!(source.kind, "VolumeSnapshot");
        assert_eq!(source.name, "nightly-1704074400");
        let requested = spec
            .resources
            .and_then(|r| r.requests)
            .and_then(|r| r.get("storage").cloned())
            .expect("storage request");
        assert_eq!(requested.0, "8Gi");

        // Without a restore size the clone's own size applies
        let ChildObject::Volume(pvc) =
            volume(&clone, &key, &snapshot(None), &config).expect("volume")
        else {
            panic!("expected a volume");
        };
        let requested = pvc
            .spec
            .and_then(|s| s.resources)
            .and_then(|r| r.requests)
            .and_then(|r| r.get("storage").cloned())
            .expect("storage request");
        assert_eq!(requested.0, "20Gi");
    }

    #[test]
    fn test_compute_mounts_volume_and_reads_credentials() {
        let (clone, key) = clone();
        let ChildObject::Compute(pod) =
            compute(&clone, &key, DatabaseEngine::Postgres, &ControllerConfig::default())
                .expect("pod")
        else {
            panic!("expected a pod");
        };
        labels_and_owner(&pod.metadata);
        let spec = pod.spec.expect("spec");
        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("postgres:16"));
        let mounts = container.volume_mounts.clone().unwrap_or_default();
        assert_eq!(mounts[0].mount_path, "/var/lib/postgresql/data");
        let env = container.env.clone().unwrap_or_default();
        assert!(env.iter().any(|e| e.name == "POSTGRES_PASSWORD"));
        let claim = spec.volumes.unwrap_or_default()[0]
            .persistent_volume_claim
            .clone()
            .expect("claim");
        assert_eq!(claim.claim_name, "pr-123");
        assert!(container.resources.is_some());
        assert_eq!(spec.service_account_name.as_deref(), Some("default"));
    }

    #[test]
    fn test_credentials_hold_connection() {
        let (clone, key) = clone();
        let connection = ConnectionInfo {
            host: "pr-123.dev.svc".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "hunter2".to_string(),
            dbname: "orders".to_string(),
        };
        let ChildObject::Credentials(secret) =
            credentials(&clone, &key, &connection).expect("secret")
        else {
            panic!("expected a secret");
        };
        labels_and_owner(&secret.metadata);
        assert_eq!(
            ConnectionInfo::from_secret(&secret).expect("parse"),
            connection
        );
    }

    #[test]
    fn test_endpoint_and_binding() {
        let (clone, key) = clone();
        let ChildObject::Endpoint(service) =
            endpoint(&clone, &key, DatabaseEngine::Mysql).expect("service")
        else {
            panic!("expected a service");
        };
        labels_and_owner(&service.metadata);
        let spec = service.spec.expect("spec");
        assert_eq!(spec.ports.unwrap_or_default()[0].port, 3306);
        assert_eq!(
            spec.selector.unwrap_or_default().get(CLONE_LABEL).map(String::as_str),
            Some("pr-123")
        );

        let ChildObject::Binding(binding) =
            binding(&clone, &key, &ControllerConfig::default()).expect("binding")
        else {
            panic!("expected a binding");
        };
        labels_and_owner(&binding.metadata);
        assert_eq!(binding.role_ref.kind, "ClusterRole");
        assert_eq!(binding.role_ref.name, "vandal-clone-access");
        let subjects = binding.subjects.unwrap_or_default();
        assert_eq!(subjects[0].namespace.as_deref(), Some("dev"));
    }
}
