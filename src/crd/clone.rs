//! # DataClone
//!
//! Ephemeral, masked database instance restored from a DataProfile snapshot.

use super::{Condition, MaskingSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// DataClone Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: vandal.db.io/v1alpha1
/// kind: DataClone
/// metadata:
///   name: pr-123
///   namespace: default
/// spec:
///   sourceProfile: nightly
///   ttl: 1h
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "DataClone",
    group = "vandal.db.io",
    version = "v1alpha1",
    namespaced,
    status = "DataCloneStatus",
    shortname = "dc",
    printcolumn = r#"{"name":"Profile", "type":"string", "jsonPath":".spec.sourceProfile"}, {"name":"Phase", "type":"string", "jsonPath":".status.phase"}, {"name":"Connection", "type":"string", "jsonPath":".status.connectionInfoSecret"}, {"name":"Expires", "type":"string", "jsonPath":".status.expiresAt"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataCloneSpec {
    /// DataProfile in the same namespace whose snapshots are used
    pub source_profile: String,
    /// Explicit snapshot; when absent the newest ready snapshot of the profile is used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_name: Option<String>,
    /// Lifetime after the clone becomes Ready, e.g. `30m`, `1h30m`, `2d`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseOverrides>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodOverrides>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageOverrides>,
    /// Replaces the rule set inherited from the profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masking: Option<MaskingSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret_ref: Option<SecretKeyRef>,
}

/// Key within a Secret in the clone's namespace
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ComputeResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Container resource requests and limits as quantity strings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComputeResources {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// Phase of a DataClone
///
/// The provisioning phases only move forward. `Failed` and `Deleting` are reachable
/// from any phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
pub enum ClonePhase {
    #[default]
    Pending,
    CreatingStorage,
    Initializing,
    MaskingInProgress,
    Ready,
    Failed,
    Deleting,
}

impl ClonePhase {
    /// Position in the provisioning sequence, `None` for `Failed` and `Deleting`
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::CreatingStorage => Some(1),
            Self::Initializing => Some(2),
            Self::MaskingInProgress => Some(3),
            Self::Ready => Some(4),
            Self::Failed | Self::Deleting => None,
        }
    }

    /// Whether moving from `self` to `next` respects the phase ordering
    pub fn can_transition_to(self, next: ClonePhase) -> bool {
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(current), Some(next)) => next > current,
            // Failed restarts from Pending after a spec change
            (None, Some(_)) => self == Self::Failed && next == Self::Pending,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::CreatingStorage => "CreatingStorage",
            Self::Initializing => "Initializing",
            Self::MaskingInProgress => "MaskingInProgress",
            Self::Ready => "Ready",
            Self::Failed => "Failed",
            Self::Deleting => "Deleting",
        }
    }
}

impl std::fmt::Display for ClonePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of the DataClone resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataCloneStatus {
    #[serde(default)]
    pub phase: Option<ClonePhase>,
    /// Name of the Secret holding host/port/user/password/dbname
    #[serde(default)]
    pub connection_info_secret: Option<String>,
    /// Snapshot the clone volume was restored from
    #[serde(default)]
    pub snapshot_name: Option<String>,
    /// When the clone became Ready (RFC3339)
    #[serde(default)]
    pub ready_time: Option<String>,
    /// When the clone will be deleted (RFC3339)
    #[serde(default)]
    pub expires_at: Option<String>,
    /// Tables (`schema.table`) already rewritten in place by the masking step.
    /// A retried masking step skips them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked_tables: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl DataClone {
    /// Current phase, `Pending` when no status has been written yet
    pub fn phase(&self) -> ClonePhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisioning_phases_only_move_forward() {
        assert!(ClonePhase::Pending.can_transition_to(ClonePhase::CreatingStorage));
        assert!(ClonePhase::Initializing.can_transition_to(ClonePhase::MaskingInProgress));
        assert!(!ClonePhase::Ready.can_transition_to(ClonePhase::Initializing));
        assert!(!ClonePhase::MaskingInProgress.can_transition_to(ClonePhase::MaskingInProgress));
    }

    #[test]
    fn test_failed_and_deleting_reachable_from_anywhere() {
        for phase in [
            ClonePhase::Pending,
            ClonePhase::CreatingStorage,
            ClonePhase::Initializing,
            ClonePhase::MaskingInProgress,
            ClonePhase::Ready,
        ] {
            assert!(phase.can_transition_to(ClonePhase::Failed));
            assert!(phase.can_transition_to(ClonePhase::Deleting));
        }
        assert!(ClonePhase::Failed.can_transition_to(ClonePhase::Pending));
        assert!(!ClonePhase::Deleting.can_transition_to(ClonePhase::Pending));
    }

    #[test]
    fn test_spec_deserializes_from_yaml() {
        let yaml = r"
sourceProfile: nightly
ttl: 1h
database:
  passwordSecretRef:
    name: creds
    key: password
";
        let spec: DataCloneSpec = serde_yaml::from_str(yaml).expect("valid spec");
        assert_eq!(spec.source_profile, "nightly");
        assert_eq!(spec.ttl.as_deref(), Some("1h"));
        let secret_ref = spec
            .database
            .and_then(|d| d.password_secret_ref)
            .expect("secret ref");
        assert_eq!(secret_ref.key, "password");
        assert!(spec.masking.is_none());
    }
}
