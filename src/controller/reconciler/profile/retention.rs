//! # Snapshot Retention
//!
//! Count-based pruning. Snapshots are ordered by creation time (name breaks ties) and
//! only the oldest ones beyond the retention count are deleted.

use crate::observability;
use crate::provider::{SnapshotHandle, StorageError, StorageProvider};
use crate::store::ObjectKey;
use tracing::{debug, info};

/// Result of one retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionOutcome {
    /// Surviving snapshots, oldest first
    pub kept: Vec<SnapshotHandle>,
    pub deleted: Vec<SnapshotHandle>,
}

impl RetentionOutcome {
    pub fn newest(&self) -> Option<&SnapshotHandle> {
        self.kept.last()
    }
}

/// Split snapshots into the `keep` newest and the older rest, both oldest first
pub fn select_for_eviction(
    mut snapshots: Vec<SnapshotHandle>,
    keep: usize,
) -> (Vec<SnapshotHandle>, Vec<SnapshotHandle>) {
    snapshots.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.name.cmp(&b.name))
    });
    let excess = snapshots.len().saturating_sub(keep);
    let kept = snapshots.split_off(excess);
    (kept, snapshots)
}

/// Delete every snapshot of `owner` beyond the `keep` most recent ones.
///
/// Without a retention count nothing is deleted. Deletion stops at the first error;
/// snapshots deleted before it stay deleted.
pub async fn enforce_retention(
    storage: &dyn StorageProvider,
    owner: &ObjectKey,
    keep: Option<usize>,
) -> Result<RetentionOutcome, StorageError> {
    let snapshots = storage.list_snapshots(owner).await?;
    let Some(keep) = keep else {
        let (kept, _) = select_for_eviction(snapshots, usize::MAX);
        return Ok(RetentionOutcome {
            kept,
            deleted: Vec::new(),
        });
    };

    let (kept, evicted) = select_for_eviction(snapshots, keep);
    if evicted.is_empty() {
        debug!(
            "DataProfile {} holds {} snapshot(s), within retention of {}",
            owner,
            kept.len(),
            keep
        );
        return Ok(RetentionOutcome {
            kept,
            deleted: Vec::new(),
        });
    }

    let mut deleted = Vec::with_capacity(evicted.len());
    for handle in evicted {
        if let Err(e) = storage.delete_snapshot(&handle).await {
            observability::metrics::increment_snapshot_errors("delete");
            observability::metrics::increment_snapshots_pruned(deleted.len());
            return Err(e);
        }
        info!("🗑️  Pruned snapshot {} of DataProfile {}", handle.name, owner);
        deleted.push(handle);
    }
    observability::metrics::increment_snapshots_pruned(deleted.len());
    Ok(RetentionOutcome { kept, deleted })
}
