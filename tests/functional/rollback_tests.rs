//! Explicit rollback jobs: path selection and outcomes

use chrono::Utc;

use vjailbreak_upgrade::UpgradeError;
use vjailbreak_upgrade::config::SETTINGS_CONFIG_NAME;
use vjailbreak_upgrade::controller::backup::backup_resources;
use vjailbreak_upgrade::controller::{ProgressStore, UpgradeOutcome, UpgradeProgress, UpgradeStatus};
use vjailbreak_upgrade::store::{ObjectStore, ResourceDescriptor};

use crate::common::*;

const MARKER: &str = "snapshot-marker";

/// Take a snapshot containing a marker ConfigMap, then delete the marker so
/// a snapshot restore is observable.
async fn snapshot_with_marker(h: &Harness) {
    create_config_map(&h.cluster, MARKER, &[("restored", "yes")]).await;
    backup_resources(h.ctx(), BACKUP_ID).await.unwrap();
    h.cluster
        .delete(&ResourceDescriptor::config_map(), Some(NAMESPACE), MARKER)
        .await
        .unwrap();
}

fn marker_present(h: &Harness) -> bool {
    h.cluster
        .memory()
        .contains(&ResourceDescriptor::config_map(), Some(NAMESPACE), MARKER)
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_rollback_never_fetches_manifests() {
    let h = Harness::installed("v1.0.0").await;
    snapshot_with_marker(&h).await;

    let progress = h
        .executor
        .execute_rollback("", "v2.0.0", Some(BACKUP_ID))
        .await
        .unwrap();

    assert_eq!(progress.status, UpgradeStatus::RolledBack);
    assert_eq!(progress.result, Some(UpgradeOutcome::Success));
    assert_eq!(progress.backup_id, BACKUP_ID);
    assert_eq!(progress.completed_steps, progress.total_steps);
    assert!(h.manifests.fetches().is_empty());
    assert!(marker_present(&h));
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_rollback_uses_recorded_backup_id() {
    let h = Harness::installed("v1.0.0").await;
    snapshot_with_marker(&h).await;
    let mut prior = UpgradeProgress::new(&test_config(), "unknown", "v2.0.0", 8, Utc::now());
    prior.status = UpgradeStatus::Failed;
    prior.backup_id = BACKUP_ID.to_string();
    ProgressStore::for_context(h.ctx()).save(&prior).await.unwrap();

    let progress = h
        .executor
        .execute_rollback("", "v2.0.0", None)
        .await
        .unwrap();

    assert_eq!(progress.status, UpgradeStatus::RolledBack);
    assert_eq!(progress.backup_id, BACKUP_ID);
    assert!(h.manifests.fetches().is_empty());
    assert!(marker_present(&h));
}

#[tokio::test(start_paused = true)]
async fn test_missing_snapshot_fails_rollback() {
    let h = Harness::installed("v1.0.0").await;

    let err = h
        .executor
        .execute_rollback("", "v2.0.0", Some(BACKUP_ID))
        .await
        .unwrap_err();

    assert!(matches!(err, UpgradeError::BackupNotFound(_)), "{err}");
    let progress = h.progress().await;
    assert_eq!(progress.status, UpgradeStatus::RollbackFailed);
    assert_eq!(progress.result, Some(UpgradeOutcome::Failure));
}

#[tokio::test(start_paused = true)]
async fn test_rollback_without_target_is_rejected() {
    let h = Harness::installed("v1.0.0").await;
    let before = h.cluster.mutations();

    let err = h
        .executor
        .execute_rollback("", "v2.0.0", None)
        .await
        .unwrap_err();

    assert!(matches!(err, UpgradeError::InvalidArgument(_)));
    assert_eq!(h.cluster.mutations(), before);
    assert!(h.executor.status().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_manifest_rollback_reapplies_previous_release() {
    let h = Harness::installed("v2.0.0").await;
    snapshot_with_marker(&h).await;
    let config = test_config();

    // a backup ID is available, but a known previous version wins
    let progress = h
        .executor
        .execute_rollback("v1.0.0", "v2.0.0", Some(BACKUP_ID))
        .await
        .unwrap();

    assert_eq!(progress.status, UpgradeStatus::RolledBack);
    assert_eq!(progress.completed_steps, progress.total_steps);
    assert_eq!(progress.total_steps, 6);
    assert!(!marker_present(&h), "manifest rollback restored the snapshot");

    let fetches = h.manifests.fetches();
    assert!(!fetches.is_empty());
    assert!(fetches.iter().all(|(tag, _)| tag == "v1.0.0"));

    for dc in config.deployments() {
        assert_eq!(h.image_of(dc).await, dc.image_for("v1.0.0"), "{}", dc.name);
    }
    let controller = h.deployment(&config.controller).await;
    assert_eq!(
        controller.spec.unwrap().replicas,
        Some(CONTROLLER_REPLICAS)
    );
    assert_eq!(h.installed_version().await.as_deref(), Some("v1.0.0"));
    assert_eq!(
        h.config_map_value(SETTINGS_CONFIG_NAME, "VCENTER_SCAN_CONCURRENCY_LIMIT")
            .await
            .as_deref(),
        Some("50")
    );
}

#[tokio::test(start_paused = true)]
async fn test_manifest_rollback_tolerates_sdk_failure() {
    let h = Harness::installed("v2.0.0").await;
    let config = test_config();
    h.manifests.fail_path(&config.sdk.manifest_path);

    let progress = h
        .executor
        .execute_rollback("v1.0.0", "v2.0.0", None)
        .await
        .unwrap();

    assert_eq!(progress.status, UpgradeStatus::RolledBack);
    assert_eq!(h.image_of(&config.controller).await, config.controller.image_for("v1.0.0"));
    assert_eq!(h.image_of(&config.sdk).await, config.sdk.image_for("v2.0.0"));
}

#[tokio::test(start_paused = true)]
async fn test_manifest_rollback_fails_without_controller() {
    let h = Harness::installed("v2.0.0").await;
    let config = test_config();
    h.manifests.fail_path(&config.controller.manifest_path);

    let err = h
        .executor
        .execute_rollback("v1.0.0", "v2.0.0", None)
        .await
        .unwrap_err();

    assert!(matches!(err, UpgradeError::Fetch(_)), "{err}");
    let progress = h.progress().await;
    assert_eq!(progress.status, UpgradeStatus::RollbackFailed);
    assert!(progress.error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_manifest_rollback_restores_recorded_replicas() {
    let h = Harness::installed("v2.0.0").await;
    let config = test_config();

    // an earlier upgrade recorded 3 replicas before failing mid-rollout
    let mut prior = UpgradeProgress::new(&test_config(), "v1.0.0", "v2.0.0", 8, Utc::now());
    prior.status = UpgradeStatus::Failed;
    prior
        .original_replicas
        .insert(config.controller.name.clone(), 3);
    ProgressStore::for_context(h.ctx()).save(&prior).await.unwrap();

    let progress = h
        .executor
        .execute_rollback("v1.0.0", "v2.0.0", None)
        .await
        .unwrap();

    assert_eq!(progress.status, UpgradeStatus::RolledBack);
    assert_eq!(progress.original_replicas.get(&config.controller.name), Some(&3));
    let controller = h.deployment(&config.controller).await;
    assert_eq!(controller.spec.unwrap().replicas, Some(3));
}
