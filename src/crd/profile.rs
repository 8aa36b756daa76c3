//! # DataProfile
//!
//! Recurring snapshot policy for one source database volume.

use super::{Condition, DatabaseEngine, MaskingSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// DataProfile Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: vandal.db.io/v1alpha1
/// kind: DataProfile
/// metadata:
///   name: nightly
///   namespace: default
/// spec:
///   schedule: "0 2 * * *"
///   retentionPolicy:
///     count: 3
///   target:
///     secretName: orders-db-credentials
///     pvcName: orders-db-data
///   masking:
///     rules:
///       - table: users
///         column: email
///         transformation: hash
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "DataProfile",
    group = "vandal.db.io",
    version = "v1alpha1",
    namespaced,
    status = "DataProfileStatus",
    shortname = "dp",
    printcolumn = r#"{"name":"Schedule", "type":"string", "jsonPath":".spec.schedule"}, {"name":"Phase", "type":"string", "jsonPath":".status.phase"}, {"name":"Last Snapshot", "type":"string", "jsonPath":".status.lastSnapshotTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataProfileSpec {
    /// Cron expression, five-field or six-field with leading seconds.
    /// Empty disables the trigger.
    #[serde(default)]
    pub schedule: String,
    /// Source volume and credentials
    pub target: TargetVolume,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<RetentionPolicy>,
    /// Rules inherited by every clone of this profile
    #[serde(default)]
    pub masking: MaskingSpec,
}

/// Reference to the source database volume
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetVolume {
    /// Secret holding `user`, `password` and `dbname` of the source database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    /// PersistentVolumeClaim to snapshot
    pub pvc_name: String,
    #[serde(default)]
    pub engine: DatabaseEngine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    /// Number of most recent snapshots to keep
    pub count: u32,
}

/// Phase of a DataProfile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
pub enum ProfilePhase {
    #[default]
    Pending,
    CreatingSnapshot,
    SnapshotReady,
    Failed,
}

impl std::fmt::Display for ProfilePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::CreatingSnapshot => "CreatingSnapshot",
            Self::SnapshotReady => "SnapshotReady",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Status of the DataProfile resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataProfileStatus {
    #[serde(default)]
    pub phase: Option<ProfilePhase>,
    /// Creation time of the newest snapshot (RFC3339)
    #[serde(default)]
    pub last_snapshot_time: Option<String>,
    #[serde(default)]
    pub last_snapshot_name: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl DataProfile {
    /// Retention count, `None` when no policy is set
    pub fn retention_count(&self) -> Option<usize> {
        self.spec
            .retention_policy
            .map(|policy| policy.count as usize)
    }

    pub fn phase(&self) -> Option<ProfilePhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }
}
