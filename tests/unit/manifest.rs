//! Release manifest fetching and application

use std::sync::Arc;

use vjailbreak_upgrade::config::{DEFAULT_MANIFEST_BASE_URL, UNKNOWN_VERSION};
use vjailbreak_upgrade::controller::rollout::{apply_crds, apply_deployment_manifest};
use vjailbreak_upgrade::controller::version_config::{
    read_current_version, set_version, update_version_config,
};
use vjailbreak_upgrade::resources::HttpManifestSource;
use vjailbreak_upgrade::resources::deployment::container_image;
use vjailbreak_upgrade::store::{ObjectStore, ResourceDescriptor, decode};
use vjailbreak_upgrade::{Context, UpgradeError};

use k8s_openapi::api::apps::v1::Deployment;

use crate::common::*;

fn harness_context(cluster: &Arc<SimulatedCluster>, manifests: &Arc<FakeManifests>) -> Context {
    Context::new(cluster.clone(), manifests.clone(), test_config())
}

#[test]
fn test_default_source_url_layout() {
    let source = HttpManifestSource::new(DEFAULT_MANIFEST_BASE_URL);
    assert_eq!(
        source.url_for("v0.3.1", "deploy/00crds.yaml"),
        "https://raw.githubusercontent.com/platform9/vjailbreak/v0.3.1/deploy/00crds.yaml"
    );
}

#[tokio::test]
async fn test_apply_deployment_pins_replicas_and_namespace() {
    let cluster = Arc::new(SimulatedCluster::new());
    let manifests = Arc::new(FakeManifests::new());
    let ctx = harness_context(&cluster, &manifests);
    let dc = ctx.config.controller.clone();

    apply_deployment_manifest(&ctx, &dc, "v2.0.0", Some(0))
        .await
        .unwrap();

    let object = cluster
        .get(&ResourceDescriptor::deployment(), Some(NAMESPACE), &dc.name)
        .await
        .unwrap();
    let deployment: Deployment = decode(&object).unwrap();
    assert_eq!(deployment.metadata.namespace.as_deref(), Some(NAMESPACE));
    assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(0));
    assert_eq!(
        container_image(&deployment, &dc.container),
        Some("quay.io/platform9/vjailbreak-controller:v2.0.0")
    );
    assert_eq!(manifests.fetches(), vec![("v2.0.0".to_string(), dc.manifest_path.clone())]);
}

#[tokio::test]
async fn test_apply_ui_manifest_skips_service() {
    let cluster = Arc::new(SimulatedCluster::new());
    let manifests = Arc::new(FakeManifests::new());
    let ctx = harness_context(&cluster, &manifests);
    let dc = ctx.config.ui.clone();

    apply_deployment_manifest(&ctx, &dc, "v2.0.0", None)
        .await
        .unwrap();

    assert!(cluster.memory().contains(&ResourceDescriptor::deployment(), Some(NAMESPACE), &dc.name));
    assert_eq!(
        cluster
            .memory()
            .count(&ResourceDescriptor::of::<k8s_openapi::api::core::v1::Service>(true)),
        0
    );
}

#[tokio::test]
async fn test_apply_crds_returns_every_name() {
    let cluster = Arc::new(SimulatedCluster::new());
    let manifests = Arc::new(FakeManifests::new());
    let ctx = harness_context(&cluster, &manifests);

    let names = apply_crds(&ctx, "v2.0.0").await.unwrap();
    assert_eq!(names.len(), PRODUCT_KINDS.len());
    assert!(names.contains(&"migrationplans.vjailbreak.k8s.pf9.io".to_string()));

    // reapplying replaces in place
    apply_crds(&ctx, "v2.0.0").await.unwrap();
    assert_eq!(
        cluster.memory().count(&ResourceDescriptor::custom_resource_definition()),
        PRODUCT_KINDS.len()
    );
}

#[tokio::test]
async fn test_fetch_failure_surfaces_as_fetch_error() {
    let cluster = Arc::new(SimulatedCluster::new());
    let manifests = Arc::new(FakeManifests::new());
    let ctx = harness_context(&cluster, &manifests);
    manifests.fail_path(&ctx.config.manifests.crds);

    let err = apply_crds(&ctx, "v2.0.0").await.unwrap_err();

    assert!(matches!(err, UpgradeError::Fetch(_)), "{err}");
    assert_eq!(cluster.mutations(), 0);
}

#[tokio::test]
async fn test_version_config_lifecycle() {
    let cluster = Arc::new(SimulatedCluster::new());
    let manifests = Arc::new(FakeManifests::new());
    let ctx = harness_context(&cluster, &manifests);

    assert_eq!(read_current_version(&ctx).await, UNKNOWN_VERSION);

    update_version_config(&ctx, "v2.0.0").await.unwrap();
    assert_eq!(read_current_version(&ctx).await, "v2.0.0");

    set_version(&ctx, "v1.0.0").await.unwrap();
    assert_eq!(read_current_version(&ctx).await, "v1.0.0");
}
