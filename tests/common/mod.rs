//! Shared fixtures for the reconciler integration tests.
#![allow(dead_code, reason = "each test binary uses a different subset")]

use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use vandal_controller::config::ControllerConfig;
use vandal_controller::controller::reconciler::{CloneReconciler, ProfileReconciler};
use vandal_controller::database::{
    ColumnSchema, MemoryConnector, MemoryDatabase, TableName, TableSchema,
};
use vandal_controller::provider::{MemoryStorageProvider, SnapshotHandle, SnapshotStatus};
use vandal_controller::store::{MemoryStore, ObjectKey};
use vandal_controller::{
    DataClone, DataCloneSpec, DataProfile, DataProfileSpec, DatabaseEngine, MaskingRule,
    MaskingSpec, RetentionPolicy, TargetVolume,
};

pub const NAMESPACE: &str = "default";

pub fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0)
        .single()
        .expect("valid time")
}

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NAMESPACE, name)
}

pub fn rule(table: &str, column: &str, transformation: &str) -> MaskingRule {
    MaskingRule {
        table: table.to_string(),
        column: column.to_string(),
        transformation: transformation.to_string(),
    }
}

pub fn profile(name: &str, schedule: &str, retention: Option<u32>) -> DataProfile {
    let mut profile = DataProfile::new(
        name,
        DataProfileSpec {
            schedule: schedule.to_string(),
            target: TargetVolume {
                secret_name: Some("orders-db-credentials".to_string()),
                pvc_name: "orders-db-data".to_string(),
                engine: DatabaseEngine::Postgres,
            },
            retention_policy: retention.map(|count| RetentionPolicy { count }),
            masking: MaskingSpec {
                rules: vec![rule("users", "email", "hash")],
            },
        },
    );
    profile.metadata.namespace = Some(NAMESPACE.to_string());
    profile
}

pub fn clone(name: &str, profile: &str, ttl: Option<&str>) -> DataClone {
    let mut clone = DataClone::new(
        name,
        DataCloneSpec {
            source_profile: profile.to_string(),
            snapshot_name: None,
            ttl: ttl.map(str::to_string),
            database: None,
            pod: None,
            storage: None,
            masking: None,
        },
    );
    clone.metadata.namespace = Some(NAMESPACE.to_string());
    clone
}

pub fn source_secret() -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some("orders-db-credentials".to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..ObjectMeta::default()
        },
        string_data: Some(BTreeMap::from([
            ("user".to_string(), "orders".to_string()),
            ("password".to_string(), "source-password".to_string()),
            ("dbname".to_string(), "orders".to_string()),
        ])),
        ..Secret::default()
    }
}

pub fn snapshot(profile: &str, hour: u32) -> SnapshotHandle {
    SnapshotHandle {
        namespace: NAMESPACE.to_string(),
        name: format!("{profile}-{}", at(hour).timestamp()),
        profile: profile.to_string(),
        created_at: at(hour),
        restore_size: Some("20Gi".to_string()),
    }
}

pub fn users_table() -> TableSchema {
    TableSchema {
        name: TableName::new("public", "users"),
        columns: [("id", "integer"), ("email", "text"), ("nickname", "text")]
            .into_iter()
            .map(|(name, data_type)| ColumnSchema {
                name: name.to_string(),
                data_type: data_type.to_string(),
                nullable: name != "id",
                primary_key: name == "id",
            })
            .collect(),
    }
}

pub fn user(id: u32, email: Option<&str>, nickname: &str) -> Vec<Option<String>> {
    vec![
        Some(id.to_string()),
        email.map(str::to_string),
        Some(nickname.to_string()),
    ]
}

pub fn users() -> Vec<Vec<Option<String>>> {
    vec![
        user(1, Some("alice@example.com"), "ally"),
        user(2, None, "bob"),
        user(3, Some("carol@example.com"), "cc"),
    ]
}

/// Everything a reconciler test needs, all in memory
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub storage: Arc<MemoryStorageProvider>,
    pub database: Arc<MemoryDatabase>,
    pub connector: Arc<MemoryConnector>,
    pub config: ControllerConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    pub fn with_store(store: MemoryStore) -> Self {
        let database = Arc::new(MemoryDatabase::new().with_table(users_table(), users()));
        Self {
            store: Arc::new(store),
            storage: Arc::new(MemoryStorageProvider::new()),
            connector: Arc::new(MemoryConnector::new(Arc::clone(&database))),
            database,
            config: ControllerConfig::default(),
        }
    }

    /// Profile `nightly` with its source secret and one ready snapshot
    pub fn with_nightly_snapshot(self) -> Self {
        self.store.insert_profile(profile("nightly", "", Some(3)));
        self.store.insert_secret(source_secret());
        self.storage
            .insert(snapshot("nightly", 2), SnapshotStatus::Ready);
        self
    }

    pub fn clones(&self) -> CloneReconciler {
        CloneReconciler::new(
            self.store.clone(),
            self.storage.clone(),
            self.connector.clone(),
            self.config.clone(),
        )
    }

    pub fn profiles(&self) -> Arc<ProfileReconciler> {
        ProfileReconciler::new(self.store.clone(), self.storage.clone(), self.config.clone())
    }
}
