//! # Storage Providers
//!
//! Point-in-time volume snapshots behind the [`StorageProvider`] trait.
//!
//! - [`CsiSnapshotProvider`] manages `snapshot.storage.k8s.io` VolumeSnapshots and
//!   covers both generic CSI drivers and the AWS EBS CSI driver
//! - [`MemoryStorageProvider`] keeps snapshots in process

mod csi;
pub mod memory;

pub use csi::CsiSnapshotProvider;
pub use memory::MemoryStorageProvider;

use crate::config::ControllerConfig;
use crate::store::ObjectKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A snapshot owned by a DataProfile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub namespace: String,
    pub name: String,
    /// Name of the owning profile
    pub profile: String,
    pub created_at: DateTime<Utc>,
    /// Minimum size of a volume restored from this snapshot
    pub restore_size: Option<String>,
}

impl SnapshotHandle {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Readiness of a snapshot as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStatus {
    Pending,
    Ready,
    Failed(String),
}

/// Storage provider errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("snapshot {0} already exists")]
    AlreadyExists(ObjectKey),
    #[error("snapshot request for {key} failed: {source}")]
    Api {
        key: ObjectKey,
        source: kube::Error,
    },
    #[error("storage provider error: {0}")]
    Provider(String),
}

/// Snapshot name derived from the owning profile and the fire time
pub fn snapshot_name(profile: &str, taken_at: DateTime<Utc>) -> String {
    format!("{profile}-{}", taken_at.timestamp())
}

/// Snapshot capability used by both reconcilers
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Snapshot `volume` on behalf of the profile `owner`
    async fn create_snapshot(
        &self,
        owner: &ObjectKey,
        volume: &str,
        taken_at: DateTime<Utc>,
    ) -> Result<SnapshotHandle, StorageError>;

    async fn snapshot_status(&self, handle: &SnapshotHandle)
        -> Result<SnapshotStatus, StorageError>;

    async fn get_snapshot(&self, key: &ObjectKey) -> Result<Option<SnapshotHandle>, StorageError>;

    /// Every snapshot owned by the profile `owner`, in no particular order
    async fn list_snapshots(&self, owner: &ObjectKey) -> Result<Vec<SnapshotHandle>, StorageError>;

    /// Delete a snapshot; deleting an absent snapshot succeeds
    async fn delete_snapshot(&self, handle: &SnapshotHandle) -> Result<(), StorageError>;
}

/// Build the provider selected by configuration
pub fn storage_provider_for(
    config: &ControllerConfig,
    client: kube::Client,
) -> Arc<dyn StorageProvider> {
    Arc::new(CsiSnapshotProvider::new(
        client,
        config.storage_provider,
        config.snapshot_class.clone(),
    ))
}
