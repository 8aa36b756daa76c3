//! # Controller Settings
//!
//! Reconciler timings, clone defaults and storage provider selection.

use super::{env_var_opt, env_var_or_default};
use std::str::FromStr;
use std::time::Duration;

/// Which storage provider creates and lists volume snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageProviderKind {
    /// Generic CSI VolumeSnapshots, optionally with an explicit snapshot class
    #[default]
    Csi,
    /// CSI VolumeSnapshots backed by the AWS EBS CSI driver
    Ebs,
}

impl FromStr for StorageProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csi" => Ok(Self::Csi),
            "ebs" | "aws-ebs" => Ok(Self::Ebs),
            other => Err(format!("unknown storage provider '{other}'")),
        }
    }
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Periodic profile resync, drives retention even without spec changes
    pub profile_resync_interval: Duration,
    /// Requeue while waiting for a ready snapshot
    pub snapshot_wait_requeue: Duration,
    /// Requeue while waiting for the clone pod to become ready
    pub compute_wait_requeue: Duration,
    /// Attempts for a status write that keeps hitting resourceVersion conflicts
    pub status_conflict_retries: u32,
    /// Upper bound on concurrently masked tables (0 = one task per table, unbounded)
    pub masking_max_concurrent_tables: usize,
    /// Storage provider implementation
    pub storage_provider: StorageProviderKind,
    /// VolumeSnapshotClass used for new snapshots
    pub snapshot_class: Option<String>,
    /// StorageClass used for clone volumes when the clone does not name one
    pub clone_storage_class: Option<String>,
    /// Clone volume size when neither the snapshot nor the clone supplies one
    pub clone_volume_size: String,
    /// ClusterRole bound to the clone workload identity
    pub clone_cluster_role: String,
    /// Service account used by clone pods when the clone does not name one
    pub clone_service_account: String,
    pub postgres_image: String,
    pub mysql_image: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            profile_resync_interval: Duration::from_secs(DEFAULT_PROFILE_RESYNC_INTERVAL_SECS),
            snapshot_wait_requeue: Duration::from_secs(DEFAULT_SNAPSHOT_WAIT_REQUEUE_SECS),
            compute_wait_requeue: Duration::from_secs(DEFAULT_COMPUTE_WAIT_REQUEUE_SECS),
            status_conflict_retries: DEFAULT_STATUS_CONFLICT_RETRIES,
            masking_max_concurrent_tables: DEFAULT_MASKING_MAX_CONCURRENT_TABLES,
            storage_provider: StorageProviderKind::default(),
            snapshot_class: None,
            clone_storage_class: None,
            clone_volume_size: DEFAULT_CLONE_VOLUME_SIZE.to_string(),
            clone_cluster_role: DEFAULT_CLONE_CLUSTER_ROLE.to_string(),
            clone_service_account: DEFAULT_CLONE_SERVICE_ACCOUNT.to_string(),
            postgres_image: DEFAULT_POSTGRES_IMAGE.to_string(),
            mysql_image: DEFAULT_MYSQL_IMAGE.to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        let storage_provider: StorageProviderKind =
            env_var_or_default("STORAGE_PROVIDER", StorageProviderKind::Csi);
        let snapshot_class = env_var_opt("SNAPSHOT_CLASS").or_else(|| {
            (storage_provider == StorageProviderKind::Ebs)
                .then(|| DEFAULT_EBS_SNAPSHOT_CLASS.to_string())
        });

        Self {
            profile_resync_interval: Duration::from_secs(env_var_or_default(
                "PROFILE_RESYNC_INTERVAL_SECS",
                DEFAULT_PROFILE_RESYNC_INTERVAL_SECS,
            )),
            snapshot_wait_requeue: Duration::from_secs(env_var_or_default(
                "SNAPSHOT_WAIT_REQUEUE_SECS",
                DEFAULT_SNAPSHOT_WAIT_REQUEUE_SECS,
            )),
            compute_wait_requeue: Duration::from_secs(env_var_or_default(
                "COMPUTE_WAIT_REQUEUE_SECS",
                DEFAULT_COMPUTE_WAIT_REQUEUE_SECS,
            )),
            status_conflict_retries: env_var_or_default(
                "STATUS_CONFLICT_RETRIES",
                DEFAULT_STATUS_CONFLICT_RETRIES,
            ),
            masking_max_concurrent_tables: env_var_or_default(
                "MASKING_MAX_CONCURRENT_TABLES",
                DEFAULT_MASKING_MAX_CONCURRENT_TABLES,
            ),
            storage_provider,
            snapshot_class,
            clone_storage_class: env_var_opt("CLONE_STORAGE_CLASS"),
            clone_volume_size: env_var_or_default(
                "CLONE_VOLUME_SIZE",
                DEFAULT_CLONE_VOLUME_SIZE.to_string(),
            ),
            clone_cluster_role: env_var_or_default(
                "CLONE_CLUSTER_ROLE",
                DEFAULT_CLONE_CLUSTER_ROLE.to_string(),
            ),
            clone_service_account: env_var_or_default(
                "CLONE_SERVICE_ACCOUNT",
                DEFAULT_CLONE_SERVICE_ACCOUNT.to_string(),
            ),
            postgres_image: env_var_or_default(
                "POSTGRES_IMAGE",
                DEFAULT_POSTGRES_IMAGE.to_string(),
            ),
            mysql_image: env_var_or_default("MYSQL_IMAGE", DEFAULT_MYSQL_IMAGE.to_string()),
        }
    }
}
