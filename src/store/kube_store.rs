//! # Kubernetes Object Store
//!
//! [`ObjectStore`] backed by the Kubernetes API server.

use super::{ChildKind, ChildObject, ObjectKey, ObjectStore, StoreError};
use crate::constants::FIELD_MANAGER;
use crate::crd::{DataClone, DataProfile};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::fmt::Debug;
use tracing::debug;

/// Object store talking to the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map API errors onto the store taxonomy
fn classify(kind: &'static str, key: &ObjectKey, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ref api_err) if api_err.code == 404 => StoreError::NotFound {
            kind,
            key: key.clone(),
        },
        kube::Error::Api(ref api_err) if api_err.code == 409 && api_err.reason == "AlreadyExists" => {
            StoreError::AlreadyExists {
                kind,
                key: key.clone(),
            }
        }
        kube::Error::Api(ref api_err) if api_err.code == 409 => StoreError::Conflict {
            kind,
            key: key.clone(),
            message: api_err.message.clone(),
        },
        source => StoreError::Api {
            kind,
            key: key.clone(),
            source,
        },
    }
}

async fn get_opt<K>(api: &Api<K>, kind: &'static str, key: &ObjectKey) -> Result<Option<K>, StoreError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    api.get_opt(&key.name)
        .await
        .map_err(|e| classify(kind, key, e))
}

/// Merge-patch the finalizer list, guarded by the object's resourceVersion
async fn patch_finalizers<K>(api: &Api<K>, kind: &'static str, obj: &K) -> Result<K, StoreError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let key = ObjectKey::for_resource(obj);
    let meta = obj.meta();
    let patch = json!({
        "metadata": {
            "finalizers": meta.finalizers.clone().unwrap_or_default(),
            "resourceVersion": meta.resource_version,
        }
    });
    api.patch(
        &key.name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(|e| classify(kind, &key, e))
}

/// Merge-patch the status subresource, guarded by the object's resourceVersion
async fn patch_status<K, S>(
    api: &Api<K>,
    kind: &'static str,
    obj: &K,
    status: Option<&S>,
) -> Result<K, StoreError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    let key = ObjectKey::for_resource(obj);
    let patch = json!({
        "metadata": { "resourceVersion": obj.meta().resource_version },
        "status": status,
    });
    api.patch_status(
        &key.name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(|e| classify(kind, &key, e))
}

async fn create_in<K>(client: Client, kind: ChildKind, obj: &K) -> Result<(), StoreError>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
    <K as Resource>::DynamicType: Default,
{
    let key = ObjectKey::for_resource(obj);
    let api: Api<K> = Api::namespaced(client, &key.namespace);
    api.create(&PostParams::default(), obj)
        .await
        .map(|_| ())
        .map_err(|e| classify(kind.as_str(), &key, e))
}

async fn delete_in<K>(client: Client, kind: ChildKind, key: &ObjectKey) -> Result<(), StoreError>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client, &key.namespace);
    api.delete(&key.name, &DeleteParams::background())
        .await
        .map(|_| ())
        .map_err(|e| classify(kind.as_str(), key, e))
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_clone(&self, key: &ObjectKey) -> Result<Option<DataClone>, StoreError> {
        get_opt(&self.api::<DataClone>(&key.namespace), "DataClone", key).await
    }

    async fn update_clone_finalizers(&self, clone: &DataClone) -> Result<DataClone, StoreError> {
        let key = ObjectKey::for_resource(clone);
        patch_finalizers(&self.api::<DataClone>(&key.namespace), "DataClone", clone).await
    }

    async fn update_clone_status(&self, clone: &DataClone) -> Result<DataClone, StoreError> {
        let key = ObjectKey::for_resource(clone);
        patch_status(
            &self.api::<DataClone>(&key.namespace),
            "DataClone",
            clone,
            clone.status.as_ref(),
        )
        .await
    }

    async fn delete_clone(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.api::<DataClone>(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify("DataClone", key, e))
    }

    async fn get_profile(&self, key: &ObjectKey) -> Result<Option<DataProfile>, StoreError> {
        get_opt(&self.api::<DataProfile>(&key.namespace), "DataProfile", key).await
    }

    async fn update_profile_finalizers(
        &self,
        profile: &DataProfile,
    ) -> Result<DataProfile, StoreError> {
        let key = ObjectKey::for_resource(profile);
        patch_finalizers(&self.api::<DataProfile>(&key.namespace), "DataProfile", profile).await
    }

    async fn update_profile_status(
        &self,
        profile: &DataProfile,
    ) -> Result<DataProfile, StoreError> {
        let key = ObjectKey::for_resource(profile);
        patch_status(
            &self.api::<DataProfile>(&key.namespace),
            "DataProfile",
            profile,
            profile.status.as_ref(),
        )
        .await
    }

    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>, StoreError> {
        get_opt(&self.api::<Secret>(&key.namespace), "Secret", key).await
    }

    async fn create_child(&self, child: &ChildObject) -> Result<(), StoreError> {
        debug!("Creating {} {}", child.kind(), child.key());
        let client = self.client.clone();
        match child {
            ChildObject::Volume(o) => create_in(client, child.kind(), o).await,
            ChildObject::Compute(o) => create_in(client, child.kind(), o).await,
            ChildObject::Credentials(o) => create_in(client, child.kind(), o).await,
            ChildObject::Endpoint(o) => create_in(client, child.kind(), o).await,
            ChildObject::Binding(o) => create_in(client, child.kind(), o).await,
        }
    }

    async fn delete_child(&self, kind: ChildKind, key: &ObjectKey) -> Result<(), StoreError> {
        debug!("Deleting {} {}", kind, key);
        let client = self.client.clone();
        match kind {
            ChildKind::Volume => delete_in::<PersistentVolumeClaim>(client, kind, key).await,
            ChildKind::Compute => delete_in::<Pod>(client, kind, key).await,
            ChildKind::Credentials => delete_in::<Secret>(client, kind, key).await,
            ChildKind::Endpoint => delete_in::<Service>(client, kind, key).await,
            ChildKind::Binding => delete_in::<RoleBinding>(client, kind, key).await,
        }
    }

    async fn compute_ready(&self, key: &ObjectKey) -> Result<bool, StoreError> {
        let pod = get_opt(&self.api::<Pod>(&key.namespace), "Pod", key).await?;
        Ok(pod
            .and_then(|p| p.status)
            .and_then(|s| s.conditions)
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            }))
    }
}
