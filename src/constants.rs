//! # Constants
//!
//! Names, labels and default values shared by the controllers, the CLI and the tests.

/// API group of both custom resources
pub const API_GROUP: &str = "vandal.db.io";

/// Finalizer placed on DataProfile and DataClone resources
pub const FINALIZER: &str = "vandal.db.io/finalizer";

/// Field manager used for every patch issued by the controller
pub const FIELD_MANAGER: &str = "vandal-controller";

/// Label carrying the owning profile name on VolumeSnapshots
pub const PROFILE_LABEL: &str = "vandal.db.io/profile";

/// Annotation carrying the RFC3339 fire time on VolumeSnapshots
pub const TAKEN_AT_ANNOTATION: &str = "vandal.db.io/taken-at";

/// Label carrying the owning clone name on clone child objects
pub const CLONE_LABEL: &str = "vandal.db.io/clone";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "vandal";

/// API group of CSI volume snapshots
pub const SNAPSHOT_API_GROUP: &str = "snapshot.storage.k8s.io";
pub const SNAPSHOT_API_VERSION: &str = "v1";
pub const SNAPSHOT_KIND: &str = "VolumeSnapshot";

// Condition types
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_SNAPSHOT_CLEANUP: &str = "SnapshotCleanup";
pub const CONDITION_SNAPSHOT_CREATED: &str = "SnapshotCreated";
pub const CONDITION_SCHEDULE_VALID: &str = "ScheduleValid";
pub const CONDITION_SNAPSHOT_RESOLVED: &str = "SnapshotResolved";
pub const CONDITION_MASKED: &str = "Masked";

/// Literal written by the `redact` transformer
pub const REDACTED_VALUE: &str = "REDACTED";

/// Length of generated clone passwords
pub const GENERATED_PASSWORD_LENGTH: usize = 24;

// Default configuration values
pub const DEFAULT_METRICS_PORT: u16 = 5000;
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;
pub const DEFAULT_PROFILE_RESYNC_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_SNAPSHOT_WAIT_REQUEUE_SECS: u64 = 30;
pub const DEFAULT_COMPUTE_WAIT_REQUEUE_SECS: u64 = 10;
pub const DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS: u64 = 60;
pub const DEFAULT_STATUS_CONFLICT_RETRIES: u32 = 3;
pub const DEFAULT_MASKING_MAX_CONCURRENT_TABLES: usize = 4;
pub const DEFAULT_CLONE_VOLUME_SIZE: &str = "10Gi";
pub const DEFAULT_POSTGRES_IMAGE: &str = "postgres:16";
pub const DEFAULT_MYSQL_IMAGE: &str = "mysql:8";
pub const DEFAULT_CLONE_CLUSTER_ROLE: &str = "vandal-clone-access";
pub const DEFAULT_CLONE_SERVICE_ACCOUNT: &str = "default";
pub const DEFAULT_EBS_SNAPSHOT_CLASS: &str = "ebs-csi-snapclass";
pub const DEFAULT_BACKOFF_MIN_SECS: u64 = 5;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 600;
