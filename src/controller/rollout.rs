//! Deployment phase primitives
//!
//! Scaling, manifest application and readiness waits for the three product
//! deployments. The controller is rolled alone (scale to zero, apply, scale
//! back up) because its reconcilers must never run against a CRD schema in
//! flux; the SDK and UI are applied in place.

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use kube::api::DynamicObject;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::context::Context;
use super::error::{UpgradeError, UpgradeResult};
use super::progress::ProgressTracker;
use super::wait::poll_until;
use crate::config::DeploymentConfig;
use crate::resources::deployment::{
    container_image, desired_replicas, is_deployment_ready, is_scaled_down,
};
use crate::resources::manifest::{ManifestError, apply_object, ensure_kind, parse_documents};
use crate::store::{ResourceDescriptor, decode, retry_on_conflict};

pub async fn get_deployment(ctx: &Context, dc: &DeploymentConfig) -> UpgradeResult<Deployment> {
    let object = ctx
        .store()
        .get(&ResourceDescriptor::deployment(), Some(&dc.namespace), &dc.name)
        .await?;
    Ok(decode(&object)?)
}

pub async fn current_replicas(ctx: &Context, dc: &DeploymentConfig) -> UpgradeResult<i32> {
    Ok(desired_replicas(&get_deployment(ctx, dc).await?))
}

fn set_replicas(object: &mut DynamicObject, replicas: i32) {
    if let Some(spec) = object.data.get_mut("spec").and_then(Value::as_object_mut) {
        spec.insert("replicas".to_string(), json!(replicas));
    } else if let Some(data) = object.data.as_object_mut() {
        data.insert("spec".to_string(), json!({ "replicas": replicas }));
    }
}

/// Set `spec.replicas`, retrying on conflicts.
pub async fn scale_deployment(
    ctx: &Context,
    dc: &DeploymentConfig,
    replicas: i32,
) -> UpgradeResult<()> {
    let store = ctx.store();
    let resource = ResourceDescriptor::deployment();
    let resource = &resource;
    let (namespace, name) = (dc.namespace.as_str(), dc.name.as_str());
    retry_on_conflict(&ctx.config.conflict_retry, "scale", move || async move {
        let mut object = store.get(resource, Some(namespace), name).await?;
        set_replicas(&mut object, replicas);
        store.replace(resource, Some(namespace), &object).await
    })
    .await?;
    info!(deployment = %dc.name, replicas, "Scaled deployment");
    Ok(())
}

pub async fn wait_for_scale_down(ctx: &Context, dc: &DeploymentConfig) -> UpgradeResult<()> {
    info!(deployment = %dc.name, "Waiting for scale down");
    poll_until(
        ctx,
        &format!("{} to scale down", dc.name),
        ctx.config.deployment_timeout,
        ctx.config.poll_interval,
        move || async move { Ok(is_scaled_down(&get_deployment(ctx, dc).await?)) },
    )
    .await
}

/// Wait until ready, updated and desired replicas agree on the latest
/// observed generation with `Available` true.
pub async fn wait_for_deployment_ready(ctx: &Context, dc: &DeploymentConfig) -> UpgradeResult<()> {
    info!(deployment = %dc.name, "Waiting for deployment to become ready");
    poll_until(
        ctx,
        &format!("{} to become ready", dc.name),
        ctx.config.deployment_timeout,
        ctx.config.poll_interval,
        move || async move { Ok(is_deployment_ready(&get_deployment(ctx, dc).await?)) },
    )
    .await
}

pub async fn wait_for_all_ready(ctx: &Context) -> UpgradeResult<()> {
    for dc in ctx.config.deployments() {
        wait_for_deployment_ready(ctx, dc).await?;
    }
    Ok(())
}

/// Pick the Deployment out of a manifest that may also carry services or
/// other objects.
fn deployment_document(
    objects: Vec<DynamicObject>,
    dc: &DeploymentConfig,
) -> Result<DynamicObject, ManifestError> {
    let mut deployments: Vec<DynamicObject> = objects
        .into_iter()
        .filter(|o| ensure_kind(o, "Deployment").is_ok())
        .collect();
    if let Some(index) = deployments.iter().position(|o| o.name_any() == dc.name) {
        return Ok(deployments.swap_remove(index));
    }
    let object = deployments
        .into_iter()
        .next()
        .ok_or_else(|| ManifestError::UnexpectedKind {
            expected: "Deployment".to_string(),
            found: "none".to_string(),
        })?;
    warn!(
        expected = %dc.name,
        found = %object.name_any(),
        "Manifest deployment name differs from the configured one"
    );
    Ok(object)
}

/// Fetch and apply a deployment manifest for `tag`.
///
/// With `pin_replicas` set, the manifest's replica count is overridden so the
/// apply itself cannot scale the deployment.
pub async fn apply_deployment_manifest(
    ctx: &Context,
    dc: &DeploymentConfig,
    tag: &str,
    pin_replicas: Option<i32>,
) -> UpgradeResult<()> {
    let path = dc.manifest_path.as_str();
    let bytes = ctx.manifests.fetch(tag, path).await?;
    let objects = parse_documents(&bytes).map_err(|e| UpgradeError::manifest(path, e))?;
    let mut object = deployment_document(objects, dc).map_err(|e| UpgradeError::manifest(path, e))?;
    object.metadata.namespace = Some(dc.namespace.clone());
    if let Some(replicas) = pin_replicas {
        set_replicas(&mut object, replicas);
    }

    let expected_image = dc.image_for(tag);
    let deployment: Deployment = decode(&object)?;
    match container_image(&deployment, &dc.container) {
        Some(image) if image == expected_image => {}
        found => warn!(
            deployment = %dc.name,
            expected = %expected_image,
            found = ?found,
            "Manifest image does not match the release tag"
        ),
    }

    apply_object(
        ctx.store(),
        &ctx.config.conflict_retry,
        &ResourceDescriptor::deployment(),
        Some(&dc.namespace),
        &object,
    )
    .await?;
    info!(deployment = %dc.name, tag = %tag, "Applied deployment manifest");
    Ok(())
}

/// Fetch and apply the CRD bundle for `tag`, returning the applied names.
pub async fn apply_crds(ctx: &Context, tag: &str) -> UpgradeResult<Vec<String>> {
    let path = ctx.config.manifests.crds.as_str();
    let bytes = ctx.manifests.fetch(tag, path).await?;
    let objects = parse_documents(&bytes).map_err(|e| UpgradeError::manifest(path, e))?;
    let resource = ResourceDescriptor::custom_resource_definition();

    let mut names = Vec::with_capacity(objects.len());
    for object in objects {
        ensure_kind(&object, "CustomResourceDefinition")
            .map_err(|e| UpgradeError::manifest(path, e))?;
        apply_object(
            ctx.store(),
            &ctx.config.conflict_retry,
            &resource,
            None,
            &object,
        )
        .await?;
        names.push(object.name_any());
    }
    info!(tag = %tag, count = names.len(), "Applied CRDs");
    Ok(names)
}

/// Scale the controller to zero and wait for it, returning the replica count
/// to restore. A count recorded by an earlier run takes precedence over the
/// live one.
pub async fn scale_down_controller(
    ctx: &Context,
    tracker: &ProgressTracker,
    recorded: Option<i32>,
) -> UpgradeResult<i32> {
    let dc = &ctx.config.controller;
    let replicas = match recorded {
        Some(replicas) => replicas,
        None => current_replicas(ctx, dc).await?,
    };
    tracker.record_original_replicas(&dc.name, replicas).await;
    scale_deployment(ctx, dc, 0).await?;
    wait_for_scale_down(ctx, dc).await?;
    Ok(replicas)
}

pub async fn scale_up_controller(ctx: &Context, replicas: i32) -> UpgradeResult<()> {
    let dc = &ctx.config.controller;
    scale_deployment(ctx, dc, replicas).await?;
    wait_for_deployment_ready(ctx, dc).await
}

/// Scale down, apply `tag`, scale back up and wait for readiness.
pub async fn roll_out_controller(
    ctx: &Context,
    tracker: &ProgressTracker,
    tag: &str,
) -> UpgradeResult<()> {
    let replicas = scale_down_controller(ctx, tracker, None).await?;
    apply_deployment_manifest(ctx, &ctx.config.controller, tag, Some(0)).await?;
    scale_up_controller(ctx, replicas).await
}

/// Re-check every deployment; any that does not become ready in time makes
/// the release unstable.
pub async fn verify_stability(ctx: &Context) -> UpgradeResult<()> {
    let mut unstable = Vec::new();
    for dc in ctx.config.deployments() {
        match wait_for_deployment_ready(ctx, dc).await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(deployment = %dc.name, error = %e, "Deployment not stable");
                unstable.push(format!("{}: {e}", dc.name));
            }
        }
    }
    if unstable.is_empty() {
        info!("All deployments stable");
        Ok(())
    } else {
        Err(UpgradeError::Unstable(unstable.join("; ")))
    }
}
