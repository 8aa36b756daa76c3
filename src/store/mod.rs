//! # Object Store
//!
//! The reconcilers read and write cluster state exclusively through [`ObjectStore`].
//! [`KubeStore`] talks to the Kubernetes API; [`MemoryStore`] keeps everything in
//! process and mimics the API server's finalizer and resourceVersion semantics.

mod kube_store;
pub mod memory;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

use crate::crd::{DataClone, DataProfile};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::ResourceExt;

/// Namespace and name of a namespaced object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of any namespaced resource, falling back to `default` for the namespace
    pub fn for_resource<K: kube::Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_else(|| "default".to_string()),
            name: obj.name_any(),
        }
    }

    /// Sibling object in the same namespace
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::new(self.namespace.clone(), name)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Kinds of objects owned by a DataClone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChildKind {
    Volume,
    Compute,
    Credentials,
    Endpoint,
    Binding,
}

impl ChildKind {
    /// Every owned kind, in creation order
    pub const ALL: [ChildKind; 5] = [
        ChildKind::Volume,
        ChildKind::Compute,
        ChildKind::Credentials,
        ChildKind::Endpoint,
        ChildKind::Binding,
    ];

    /// Kubernetes kind backing this child
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Volume => "PersistentVolumeClaim",
            Self::Compute => "Pod",
            Self::Credentials => "Secret",
            Self::Endpoint => "Service",
            Self::Binding => "RoleBinding",
        }
    }
}

impl std::fmt::Display for ChildKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully built child object ready to be created
#[derive(Debug, Clone)]
pub enum ChildObject {
    Volume(PersistentVolumeClaim),
    Compute(Pod),
    Credentials(Secret),
    Endpoint(Service),
    Binding(RoleBinding),
}

impl ChildObject {
    pub fn kind(&self) -> ChildKind {
        match self {
            Self::Volume(_) => ChildKind::Volume,
            Self::Compute(_) => ChildKind::Compute,
            Self::Credentials(_) => ChildKind::Credentials,
            Self::Endpoint(_) => ChildKind::Endpoint,
            Self::Binding(_) => ChildKind::Binding,
        }
    }

    pub fn key(&self) -> ObjectKey {
        match self {
            Self::Volume(o) => ObjectKey::for_resource(o),
            Self::Compute(o) => ObjectKey::for_resource(o),
            Self::Credentials(o) => ObjectKey::for_resource(o),
            Self::Endpoint(o) => ObjectKey::for_resource(o),
            Self::Binding(o) => ObjectKey::for_resource(o),
        }
    }
}

/// Object store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: ObjectKey },
    #[error("conflicting write to {kind} {key}: {message}")]
    Conflict {
        kind: &'static str,
        key: ObjectKey,
        message: String,
    },
    #[error("failed to encode {kind} {key}: {source}")]
    Encode {
        kind: &'static str,
        key: ObjectKey,
        source: serde_json::Error,
    },
    #[error("Kubernetes API request for {kind} {key} failed: {source}")]
    Api {
        kind: &'static str,
        key: ObjectKey,
        source: kube::Error,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Typed access to the resources the reconcilers need.
///
/// Updates carry the object's resourceVersion; a stale version yields
/// [`StoreError::Conflict`] instead of overwriting.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_clone(&self, key: &ObjectKey) -> Result<Option<DataClone>, StoreError>;

    /// Persist `metadata.finalizers`. Removing the last finalizer of a clone that has a
    /// deletion timestamp lets the store drop the record.
    async fn update_clone_finalizers(&self, clone: &DataClone) -> Result<DataClone, StoreError>;

    async fn update_clone_status(&self, clone: &DataClone) -> Result<DataClone, StoreError>;

    /// Request deletion. With finalizers present only the deletion timestamp is set.
    async fn delete_clone(&self, key: &ObjectKey) -> Result<(), StoreError>;

    async fn get_profile(&self, key: &ObjectKey) -> Result<Option<DataProfile>, StoreError>;

    async fn update_profile_finalizers(
        &self,
        profile: &DataProfile,
    ) -> Result<DataProfile, StoreError>;

    async fn update_profile_status(&self, profile: &DataProfile)
        -> Result<DataProfile, StoreError>;

    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>, StoreError>;

    /// Create a child object; an existing object of the same kind and name yields
    /// [`StoreError::AlreadyExists`]
    async fn create_child(&self, child: &ChildObject) -> Result<(), StoreError>;

    /// Delete a child object; an absent object yields [`StoreError::NotFound`]
    async fn delete_child(&self, kind: ChildKind, key: &ObjectKey) -> Result<(), StoreError>;

    /// Whether the clone pod reports the Ready condition
    async fn compute_ready(&self, key: &ObjectKey) -> Result<bool, StoreError>;
}
