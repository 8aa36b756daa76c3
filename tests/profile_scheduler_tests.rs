//! # DataProfile Scheduling Tests
//!
//! Trigger registration follows `spec.schedule`, fires take snapshots, and retention
//! keeps only the newest snapshots of each profile.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use vandal_controller::controller::reconciler::ReconcilerError;
use vandal_controller::provider::{snapshot_name, MemoryStorageProvider, SnapshotStatus};
use vandal_controller::{
    find_condition, DataProfile, DataProfileStatus, ProfilePhase, RetentionPolicy,
};

fn condition(profile: &DataProfile, r#type: &str) -> Option<(String, String)> {
    profile
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, r#type))
        .map(|c| (c.status.clone(), c.reason.clone().unwrap_or_default()))
}

fn snapshot_hours(harness: &Harness, profile: &str) -> Vec<i64> {
    harness
        .storage
        .snapshots_of(&key(profile))
        .into_iter()
        .map(|s| s.created_at.timestamp())
        .collect()
}

#[tokio::test]
async fn test_reconcile_registers_a_trigger() {
    let harness = Harness::new();
    harness
        .store
        .insert_profile(profile("nightly", "0 2 * * *", Some(3)));
    let profiles = harness.profiles();
    let key = key("nightly");

    let outcome = profiles
        .reconcile(&key, at(1))
        .await
        .expect("reconcile succeeds");

    assert_eq!(
        outcome.requeue_after,
        Some(harness.config.profile_resync_interval)
    );
    assert_eq!(
        profiles.scheduler().expression(&key).as_deref(),
        Some("0 2 * * *")
    );

    let stored = harness.store.profile_record(&key).expect("profile exists");
    assert_eq!(stored.phase(), Some(ProfilePhase::Pending));
    assert_eq!(
        condition(&stored, "ScheduleValid"),
        Some(("True".to_string(), "Scheduled".to_string()))
    );
    assert_eq!(
        condition(&stored, "SnapshotCleanup"),
        Some(("True".to_string(), "Success".to_string()))
    );
    assert!(stored
        .metadata
        .finalizers
        .unwrap_or_default()
        .contains(&"vandal.db.io/finalizer".to_string()));
}

#[tokio::test]
async fn test_schedule_edit_replaces_the_trigger() {
    let harness = Harness::new();
    harness
        .store
        .insert_profile(profile("nightly", "0 2 * * *", None));
    let profiles = harness.profiles();
    let key = key("nightly");
    profiles
        .reconcile(&key, at(1))
        .await
        .expect("reconcile succeeds");

    harness.store.edit_profile(&key, |p| {
        p.spec.schedule = "30 4 * * *".to_string();
    });
    profiles
        .reconcile(&key, at(1))
        .await
        .expect("reconcile succeeds");

    assert_eq!(
        profiles.scheduler().expression(&key).as_deref(),
        Some("30 4 * * *")
    );
    assert_eq!(profiles.scheduler().len(), 1);
}

#[tokio::test]
async fn test_empty_schedule_has_no_trigger() {
    let harness = Harness::new();
    harness.store.insert_profile(profile("manual", "", None));
    let profiles = harness.profiles();
    let key = key("manual");

    profiles
        .reconcile(&key, at(1))
        .await
        .expect("reconcile succeeds");

    assert!(!profiles.scheduler().is_registered(&key));
    let stored = harness.store.profile_record(&key).expect("profile exists");
    assert_eq!(
        condition(&stored, "ScheduleValid"),
        Some(("True".to_string(), "Unscheduled".to_string()))
    );
}

#[tokio::test]
async fn test_invalid_schedule_fails_until_fixed() {
    let harness = Harness::new();
    harness
        .store
        .insert_profile(profile("nightly", "every night", None));
    let profiles = harness.profiles();
    let key = key("nightly");

    let outcome = profiles
        .reconcile(&key, at(1))
        .await
        .expect("an invalid schedule is recorded, not returned");
    assert_eq!(outcome.requeue_after, None);
    assert!(!profiles.scheduler().is_registered(&key));

    let failed = harness.store.profile_record(&key).expect("profile exists");
    assert_eq!(failed.phase(), Some(ProfilePhase::Failed));
    assert_eq!(
        condition(&failed, "ScheduleValid"),
        Some(("False".to_string(), "InvalidSchedule".to_string()))
    );

    harness.store.edit_profile(&key, |p| {
        p.spec.schedule = "0 2 * * *".to_string();
    });
    profiles
        .reconcile(&key, at(1))
        .await
        .expect("reconcile succeeds");

    let fixed = harness.store.profile_record(&key).expect("profile exists");
    assert_eq!(fixed.phase(), Some(ProfilePhase::Pending));
    assert!(profiles.scheduler().is_registered(&key));
}

#[tokio::test]
async fn test_deleting_a_profile_drops_its_trigger() {
    let harness = Harness::new();
    harness
        .store
        .insert_profile(profile("nightly", "0 2 * * *", None));
    let profiles = harness.profiles();
    let key = key("nightly");
    profiles
        .reconcile(&key, at(1))
        .await
        .expect("reconcile succeeds");

    harness
        .store
        .request_profile_deletion(&key)
        .expect("deletion requested");
    assert!(harness.store.profile_record(&key).is_some());

    profiles
        .reconcile(&key, at(1))
        .await
        .expect("reconcile succeeds");

    assert!(!profiles.scheduler().is_registered(&key));
    assert!(harness.store.profile_record(&key).is_none());
}

#[tokio::test]
async fn test_fire_takes_a_snapshot() {
    let harness = Harness::new();
    harness
        .store
        .insert_profile(profile("nightly", "0 2 * * *", Some(3)));
    let profiles = harness.profiles();
    let key = key("nightly");

    let handle = profiles
        .fire_snapshot(&key, at(2))
        .await
        .expect("snapshot taken");

    assert_eq!(handle.name, snapshot_name("nightly", at(2)));
    assert_eq!(harness.storage.snapshots_of(&key), vec![handle.clone()]);

    let stored = harness.store.profile_record(&key).expect("profile exists");
    let status = stored.status.clone().expect("status written");
    assert_eq!(status.phase, Some(ProfilePhase::SnapshotReady));
    assert_eq!(status.last_snapshot_name, Some(handle.name));
    assert_eq!(
        status.last_snapshot_time.as_deref(),
        Some("2024-01-01T02:00:00Z")
    );
    assert_eq!(
        condition(&stored, "SnapshotCreated"),
        Some(("True".to_string(), "Created".to_string()))
    );
}

#[tokio::test]
async fn test_repeated_fire_reuses_the_snapshot() {
    let harness = Harness::new();
    harness
        .store
        .insert_profile(profile("nightly", "0 2 * * *", None));
    let profiles = harness.profiles();
    let key = key("nightly");

    let first = profiles.fire_snapshot(&key, at(2)).await;
    let second = profiles.fire_snapshot(&key, at(2)).await;

    assert!(first.is_some());
    assert_eq!(first, second);
    assert_eq!(harness.storage.snapshots_of(&key).len(), 1);
}

#[tokio::test]
async fn test_failed_snapshot_is_recorded() {
    let harness = Harness::new();
    harness
        .store
        .insert_profile(profile("nightly", "0 2 * * *", None));
    harness.storage.fail_creates(true);
    let profiles = harness.profiles();
    let key = key("nightly");

    assert!(profiles.fire_snapshot(&key, at(2)).await.is_none());

    let stored = harness.store.profile_record(&key).expect("profile exists");
    assert_eq!(stored.phase(), Some(ProfilePhase::Failed));
    assert_eq!(
        condition(&stored, "SnapshotCreated"),
        Some(("False".to_string(), "CreateFailed".to_string()))
    );

    // The next successful fire recovers
    harness.storage.fail_creates(false);
    assert!(profiles.fire_snapshot(&key, at(3)).await.is_some());
    assert_eq!(
        harness.store.profile_record(&key).and_then(|p| p.phase()),
        Some(ProfilePhase::SnapshotReady)
    );
}

#[tokio::test]
async fn test_fires_keep_only_the_newest_snapshots() {
    let harness = Harness::new();
    harness
        .store
        .insert_profile(profile("nightly", "0 * * * *", Some(3)));
    let profiles = harness.profiles();
    let key = key("nightly");

    for hour in 1..=5 {
        profiles
            .fire_snapshot(&key, at(hour))
            .await
            .expect("snapshot taken");
    }

    assert_eq!(
        snapshot_hours(&harness, "nightly"),
        vec![at(3).timestamp(), at(4).timestamp(), at(5).timestamp()]
    );
    let stored = harness.store.profile_record(&key).expect("profile exists");
    assert_eq!(
        condition(&stored, "SnapshotCleanup"),
        Some(("True".to_string(), "Success".to_string()))
    );
}

#[tokio::test]
async fn test_retention_leaves_other_profiles_alone() {
    let harness = Harness::new();
    harness
        .store
        .insert_profile(profile("nightly", "", Some(1)));
    for hour in 1..=3 {
        harness
            .storage
            .insert(snapshot("nightly", hour), SnapshotStatus::Ready);
        harness
            .storage
            .insert(snapshot("weekly", hour), SnapshotStatus::Ready);
    }

    harness
        .profiles()
        .reconcile(&key("nightly"), at(4))
        .await
        .expect("reconcile succeeds");

    assert_eq!(snapshot_hours(&harness, "nightly"), vec![at(3).timestamp()]);
    assert_eq!(snapshot_hours(&harness, "weekly").len(), 3);
}

#[tokio::test]
async fn test_reconcile_prunes_and_reports_newest_snapshot() {
    let harness = Harness::new();
    harness
        .store
        .insert_profile(profile("nightly", "", Some(2)));
    for hour in [4, 1, 3, 2] {
        harness
            .storage
            .insert(snapshot("nightly", hour), SnapshotStatus::Ready);
    }
    let key = key("nightly");

    harness
        .profiles()
        .reconcile(&key, at(5))
        .await
        .expect("reconcile succeeds");

    assert_eq!(
        snapshot_hours(&harness, "nightly"),
        vec![at(3).timestamp(), at(4).timestamp()]
    );
    let stored = harness.store.profile_record(&key).expect("profile exists");
    assert_eq!(
        stored.status.and_then(|s| s.last_snapshot_time).as_deref(),
        Some("2024-01-01T04:00:00Z")
    );
}

#[tokio::test]
async fn test_no_retention_policy_keeps_everything() {
    let harness = Harness::new();
    harness.store.insert_profile(profile("nightly", "", None));
    for hour in 1..=6 {
        harness
            .storage
            .insert(snapshot("nightly", hour), SnapshotStatus::Ready);
    }

    harness
        .profiles()
        .reconcile(&key("nightly"), at(7))
        .await
        .expect("reconcile succeeds");

    assert_eq!(snapshot_hours(&harness, "nightly").len(), 6);
}

#[tokio::test]
async fn test_retention_edit_applies_on_next_reconcile() {
    let harness = Harness::new();
    harness
        .store
        .insert_profile(profile("nightly", "", Some(5)));
    for hour in 1..=5 {
        harness
            .storage
            .insert(snapshot("nightly", hour), SnapshotStatus::Ready);
    }
    let profiles = harness.profiles();
    let key = key("nightly");
    profiles
        .reconcile(&key, at(6))
        .await
        .expect("reconcile succeeds");
    assert_eq!(snapshot_hours(&harness, "nightly").len(), 5);

    harness.store.edit_profile(&key, |p| {
        p.spec.retention_policy = Some(RetentionPolicy { count: 2 });
    });
    profiles
        .reconcile(&key, at(6))
        .await
        .expect("reconcile succeeds");

    assert_eq!(
        snapshot_hours(&harness, "nightly"),
        vec![at(4).timestamp(), at(5).timestamp()]
    );
}

#[tokio::test]
async fn test_cleanup_failure_is_reported() {
    let harness = Harness::new();
    harness
        .store
        .insert_profile(profile("nightly", "", Some(1)));
    for hour in 1..=3 {
        harness
            .storage
            .insert(snapshot("nightly", hour), SnapshotStatus::Ready);
    }
    harness.storage.fail_deletes(true);
    let key = key("nightly");

    let result = harness.profiles().reconcile(&key, at(4)).await;

    assert!(matches!(
        result,
        Err(ReconcilerError::SnapshotCleanup { key: ref failed, .. }) if *failed == key
    ));
    assert_eq!(snapshot_hours(&harness, "nightly").len(), 3);
    let stored = harness.store.profile_record(&key).expect("profile exists");
    assert_eq!(
        condition(&stored, "SnapshotCleanup"),
        Some(("False".to_string(), "Error".to_string()))
    );
}

#[tokio::test]
async fn test_fire_for_removed_profile_drops_the_trigger() {
    let harness = Harness::new();
    harness
        .store
        .insert_profile(profile("nightly", "0 2 * * *", None));
    let profiles = harness.profiles();
    let key = key("nightly");
    profiles
        .reconcile(&key, at(1))
        .await
        .expect("reconcile succeeds");
    assert!(profiles.scheduler().is_registered(&key));

    harness.store.remove_profile(&key);

    assert!(profiles.fire_snapshot(&key, at(2)).await.is_none());
    assert!(!profiles.scheduler().is_registered(&key));
    assert!(harness.storage.snapshots_of(&key).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_registered_trigger_snapshots_on_schedule() {
    let harness = Harness::new();
    harness
        .store
        .insert_profile(profile("nightly", "* * * * * *", Some(2)));
    let profiles = harness.profiles();
    let key = key("nightly");

    profiles
        .reconcile(&key, at(1))
        .await
        .expect("reconcile succeeds");
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(harness.storage.snapshots_of(&key).len(), 2);
    let stored = harness.store.profile_record(&key).expect("profile exists");
    assert_eq!(stored.phase(), Some(ProfilePhase::SnapshotReady));
}

#[tokio::test(start_paused = true)]
async fn test_reschedule_during_a_fire_still_records_the_snapshot() {
    let mut harness = Harness::new();
    harness.storage =
        Arc::new(MemoryStorageProvider::new().with_create_delay(Duration::from_secs(5)));
    harness
        .store
        .insert_profile(profile("nightly", "* * * * * *", None));
    let profiles = harness.profiles();
    let key = key("nightly");
    profiles
        .reconcile(&key, at(1))
        .await
        .expect("reconcile succeeds");

    while harness.store.profile_record(&key).and_then(|p| p.phase())
        != Some(ProfilePhase::CreatingSnapshot)
    {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    harness.store.edit_profile(&key, |p| {
        p.spec.schedule = "0 2 * * *".to_string();
    });
    profiles
        .reconcile(&key, at(1))
        .await
        .expect("reconcile succeeds");
    // The running fire is left alone
    assert_eq!(
        harness.store.profile_record(&key).and_then(|p| p.phase()),
        Some(ProfilePhase::CreatingSnapshot)
    );

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(!profiles.is_firing(&key));
    let stored = harness.store.profile_record(&key).expect("profile exists");
    assert_eq!(stored.phase(), Some(ProfilePhase::SnapshotReady));
    assert_eq!(harness.storage.snapshots_of(&key).len(), 1);
}

#[tokio::test]
async fn test_interrupted_fire_is_repaired_on_reconcile() {
    let harness = Harness::new();
    let mut nightly = profile("nightly", "0 2 * * *", None);
    nightly.status = Some(DataProfileStatus {
        phase: Some(ProfilePhase::CreatingSnapshot),
        ..DataProfileStatus::default()
    });
    harness.store.insert_profile(nightly);
    let profiles = harness.profiles();
    let key = key("nightly");

    profiles
        .reconcile(&key, at(1))
        .await
        .expect("reconcile succeeds");

    let stored = harness.store.profile_record(&key).expect("profile exists");
    assert_eq!(stored.phase(), Some(ProfilePhase::Pending));
    assert_eq!(
        condition(&stored, "SnapshotCreated"),
        Some(("False".to_string(), "Interrupted".to_string()))
    );
}
