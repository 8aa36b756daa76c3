//! # In-Memory Storage Provider

use super::{snapshot_name, SnapshotHandle, SnapshotStatus, StorageError, StorageProvider};
use crate::store::ObjectKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Snapshots kept in process. New snapshots are immediately ready.
#[derive(Debug, Default)]
pub struct MemoryStorageProvider {
    snapshots: Mutex<Vec<(SnapshotHandle, SnapshotStatus)>>,
    fail_creates: AtomicBool,
    fail_deletes: AtomicBool,
    /// Pause inside every create call
    create_delay: Option<Duration>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    fn snapshots(&self) -> MutexGuard<'_, Vec<(SnapshotHandle, SnapshotStatus)>> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make subsequent create calls fail
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent delete calls fail
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn insert(&self, handle: SnapshotHandle, status: SnapshotStatus) {
        self.snapshots().push((handle, status));
    }

    pub fn set_status(&self, key: &ObjectKey, status: SnapshotStatus) {
        for (handle, current) in self.snapshots().iter_mut() {
            if handle.key() == *key {
                *current = status.clone();
            }
        }
    }

    /// Snapshots owned by `owner`, oldest first
    pub fn snapshots_of(&self, owner: &ObjectKey) -> Vec<SnapshotHandle> {
        let mut owned: Vec<SnapshotHandle> = self
            .snapshots()
            .iter()
            .filter(|(h, _)| h.namespace == owner.namespace && h.profile == owner.name)
            .map(|(h, _)| h.clone())
            .collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        owned
    }
}

#[async_trait]
impl StorageProvider for MemoryStorageProvider {
    async fn create_snapshot(
        &self,
        owner: &ObjectKey,
        _volume: &str,
        taken_at: DateTime<Utc>,
    ) -> Result<SnapshotHandle, StorageError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(StorageError::Provider("snapshot quota exceeded".to_string()));
        }
        let handle = SnapshotHandle {
            namespace: owner.namespace.clone(),
            name: snapshot_name(&owner.name, taken_at),
            profile: owner.name.clone(),
            created_at: taken_at,
            restore_size: None,
        };
        let mut snapshots = self.snapshots();
        if snapshots.iter().any(|(h, _)| h.key() == handle.key()) {
            return Err(StorageError::AlreadyExists(handle.key()));
        }
        snapshots.push((handle.clone(), SnapshotStatus::Ready));
        Ok(handle)
    }

    async fn snapshot_status(
        &self,
        handle: &SnapshotHandle,
    ) -> Result<SnapshotStatus, StorageError> {
        Ok(self
            .snapshots()
            .iter()
            .find(|(h, _)| h.key() == handle.key())
            .map_or_else(
                || SnapshotStatus::Failed(format!("snapshot {} no longer exists", handle.key())),
                |(_, status)| status.clone(),
            ))
    }

    async fn get_snapshot(&self, key: &ObjectKey) -> Result<Option<SnapshotHandle>, StorageError> {
        Ok(self
            .snapshots()
            .iter()
            .find(|(h, _)| h.key() == *key)
            .map(|(h, _)| h.clone()))
    }

    async fn list_snapshots(&self, owner: &ObjectKey) -> Result<Vec<SnapshotHandle>, StorageError> {
        // Newest first, so callers cannot rely on listing order
        let mut owned = self.snapshots_of(owner);
        owned.reverse();
        Ok(owned)
    }

    async fn delete_snapshot(&self, handle: &SnapshotHandle) -> Result<(), StorageError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Provider(format!(
                "cannot delete snapshot {}",
                handle.key()
            )));
        }
        self.snapshots().retain(|(h, _)| h.key() != handle.key());
        Ok(())
    }
}
