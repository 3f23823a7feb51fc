//! Snapshot backup, restore and cleanup

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;

use vjailbreak_upgrade::controller::backup::{
    backup_resources, cleanup_all_old_backups, decode_object, encode_object, restore_resources,
};
use vjailbreak_upgrade::controller::cleanup_resources;
use vjailbreak_upgrade::crd::{MASTER_NODE_NAME, migration_plans, vjailbreak_nodes};
use vjailbreak_upgrade::resources::common::{
    BACKUP_ID_ANNOTATION, RECORD_KIND_BACKUP, backup_record_name, record_labels,
};
use vjailbreak_upgrade::store::{ObjectStore, ResourceDescriptor, encode};
use vjailbreak_upgrade::{Context, UpgradeError};

use crate::common::*;

async fn installed_context() -> (Arc<SimulatedCluster>, Context) {
    let cluster = Arc::new(SimulatedCluster::new());
    let manifests = Arc::new(FakeManifests::new());
    install(&cluster, &manifests, "v1.0.0").await;
    let ctx = Context::new(cluster.clone(), manifests, test_config());
    (cluster, ctx)
}

#[tokio::test]
async fn test_backup_covers_every_category() {
    let (_cluster, ctx) = installed_context().await;

    let snapshot = backup_resources(&ctx, BACKUP_ID).await.unwrap();

    let keys: Vec<&str> = snapshot.entries().keys().map(String::as_str).collect();
    assert!(keys.contains(&"crd-migrationplans.vjailbreak.k8s.pf9.io"));
    assert!(keys.contains(&"configmap-version-config"));
    assert!(keys.contains(&"deployment-migration-controller-manager"));
    assert!(keys.contains(&"cr-VjailbreakNode-vjailbreak-master"));
    assert_eq!(
        snapshot.size(),
        snapshot
            .entries()
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>()
    );
}

#[tokio::test]
async fn test_backup_respects_size_limit() {
    let cluster = Arc::new(SimulatedCluster::new());
    let manifests = Arc::new(FakeManifests::new());
    install(&cluster, &manifests, "v1.0.0").await;
    let mut config = test_config();
    config.backup_size_limit = 4_000;
    let ctx = Context::new(cluster.clone(), manifests, config);

    let snapshot = backup_resources(&ctx, BACKUP_ID).await.unwrap();

    assert!(snapshot.size() <= 4_000);
    assert!(!snapshot.is_empty());
    // what was written is exactly what fits
    let record = cluster
        .get(&ResourceDescriptor::config_map(), Some(NAMESPACE), &backup_record_name(BACKUP_ID))
        .await
        .unwrap();
    let written = record.data["data"].as_object().unwrap().len();
    assert_eq!(written, snapshot.len());
}

#[tokio::test]
async fn test_rewriting_a_backup_drops_stale_keys() {
    let (cluster, ctx) = installed_context().await;
    create_config_map(&cluster, "temporary", &[("k", "v")]).await;
    backup_resources(&ctx, BACKUP_ID).await.unwrap();

    cluster
        .delete(&ResourceDescriptor::config_map(), Some(NAMESPACE), "temporary")
        .await
        .unwrap();
    let snapshot = backup_resources(&ctx, BACKUP_ID).await.unwrap();

    assert!(!snapshot.entries().contains_key("configmap-temporary"));
    let record = cluster
        .get(&ResourceDescriptor::config_map(), Some(NAMESPACE), &backup_record_name(BACKUP_ID))
        .await
        .unwrap();
    assert!(record.data["data"].get("configmap-temporary").is_none());
}

#[tokio::test]
async fn test_restored_objects_are_created_fresh() {
    let (cluster, ctx) = installed_context().await;
    let original = cluster
        .get(&ResourceDescriptor::config_map(), Some(NAMESPACE), "version-config")
        .await
        .unwrap();
    backup_resources(&ctx, BACKUP_ID).await.unwrap();

    let report = restore_resources(&ctx, BACKUP_ID).await.unwrap();
    assert!(report.is_clean(), "{report}");

    let restored = cluster
        .get(&ResourceDescriptor::config_map(), Some(NAMESPACE), "version-config")
        .await
        .unwrap();
    assert_ne!(restored.metadata.uid, original.metadata.uid);
    assert_eq!(restored.data["data"], original.data["data"]);
}

#[tokio::test]
async fn test_backup_skips_config_maps_the_cluster_maintains() {
    let (cluster, ctx) = installed_context().await;
    create_config_map(&cluster, "kube-root-ca.crt", &[("ca.crt", "cert")]).await;
    let owned = ConfigMap {
        metadata: ObjectMeta {
            name: Some("owned-by-job".to_string()),
            namespace: Some(NAMESPACE.to_string()),
            owner_references: Some(vec![OwnerReference {
                api_version: "batch/v1".to_string(),
                kind: "Job".to_string(),
                name: "some-job".to_string(),
                uid: "uid-job".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        },
        ..Default::default()
    };
    cluster
        .create(&ResourceDescriptor::config_map(), Some(NAMESPACE), &encode(&owned).unwrap())
        .await
        .unwrap();

    let snapshot = backup_resources(&ctx, BACKUP_ID).await.unwrap();

    assert!(!snapshot.entries().contains_key("configmap-kube-root-ca.crt"));
    assert!(!snapshot.entries().contains_key("configmap-owned-by-job"));
    assert!(snapshot.entries().contains_key("configmap-version-config"));
}

#[tokio::test]
async fn test_restore_applies_over_a_republished_object() {
    let (cluster, ctx) = installed_context().await;
    create_config_map(&cluster, "published-settings", &[("k", "original")]).await;
    backup_resources(&ctx, BACKUP_ID).await.unwrap();

    let cm = ResourceDescriptor::config_map();
    let mut live = cluster
        .get(&cm, Some(NAMESPACE), "published-settings")
        .await
        .unwrap();
    live.data["data"]["k"] = serde_json::json!("changed");
    cluster.replace(&cm, Some(NAMESPACE), &live).await.unwrap();
    cluster.republish_on_delete("configmaps", "published-settings");

    let report = restore_resources(&ctx, BACKUP_ID).await.unwrap();

    assert!(report.is_clean(), "{report}");
    let restored = cluster
        .get(&cm, Some(NAMESPACE), "published-settings")
        .await
        .unwrap();
    assert_eq!(restored.data["data"]["k"], "original");
}

#[tokio::test]
async fn test_restore_reports_unknown_entries() {
    let (cluster, ctx) = installed_context().await;
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(backup_record_name(BACKUP_ID)),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(record_labels(RECORD_KIND_BACKUP)),
            annotations: Some(BTreeMap::from([(
                BACKUP_ID_ANNOTATION.to_string(),
                BACKUP_ID.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            ("configmap-broken".to_string(), "not base64!".to_string()),
            (
                "secret-x".to_string(),
                encode_object(&ResourceDescriptor::secret().new_object("x", Some(NAMESPACE)))
                    .unwrap(),
            ),
        ])),
        ..Default::default()
    };
    cluster
        .create(&ResourceDescriptor::config_map(), Some(NAMESPACE), &encode(&cm).unwrap())
        .await
        .unwrap();

    let report = restore_resources(&ctx, BACKUP_ID).await.unwrap();

    assert_eq!(report.failures().len(), 2, "{report}");
}

#[tokio::test]
async fn test_restore_of_missing_backup_fails() {
    let (_cluster, ctx) = installed_context().await;

    let err = restore_resources(&ctx, "20200101T000000Z").await.unwrap_err();

    assert!(matches!(err, UpgradeError::BackupNotFound(ref id) if id == "20200101T000000Z"));
}

#[test]
fn test_encoded_object_is_base64_yaml() {
    let mut object = ResourceDescriptor::config_map().new_object("settings", Some(NAMESPACE));
    object.data = serde_json::json!({"data": {"k": "v"}});

    let encoded = encode_object(&object).unwrap();
    assert!(!encoded.contains("kind"));

    let decoded = decode_object(&encoded).unwrap();
    assert_eq!(decoded.metadata.name.as_deref(), Some("settings"));
    assert_eq!(decoded.types.unwrap().kind, "ConfigMap");
    assert!(decode_object("%%%").is_err());
}

#[tokio::test]
async fn test_old_backups_are_pruned_newer_kept() {
    let (cluster, ctx) = installed_context().await;
    create_backup_record(&cluster, "20231201T000000Z").await;
    create_backup_record(&cluster, BACKUP_ID).await;
    create_backup_record(&cluster, "20240201T000000Z").await;

    let report = cleanup_all_old_backups(&ctx, BACKUP_ID).await;

    assert!(report.is_clean(), "{report}");
    let memory = cluster.memory();
    let cm = ResourceDescriptor::config_map();
    assert!(!memory.contains(&cm, Some(NAMESPACE), &backup_record_name("20231201T000000Z")));
    assert!(memory.contains(&cm, Some(NAMESPACE), &backup_record_name(BACKUP_ID)));
    assert!(memory.contains(&cm, Some(NAMESPACE), &backup_record_name("20240201T000000Z")));
}

#[tokio::test]
async fn test_cleanup_spares_the_master_node() {
    let (cluster, ctx) = installed_context().await;
    create_migration_plan(&cluster, "plan-a").await;
    create_custom_resource(&cluster, &vjailbreak_nodes(), "agent-1").await;

    let report = cleanup_resources(&ctx).await;

    assert!(report.is_clean(), "{report}");
    let memory = cluster.memory();
    assert_eq!(memory.count(&migration_plans()), 0);
    assert!(!memory.contains(&vjailbreak_nodes(), Some(NAMESPACE), "agent-1"));
    assert!(memory.contains(&vjailbreak_nodes(), Some(NAMESPACE), MASTER_NODE_NAME));
}
