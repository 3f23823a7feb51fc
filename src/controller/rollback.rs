//! Rollback paths
//!
//! A rollback either replays a snapshot or reapplies the manifests of a known
//! previous release. Manifests are preferred whenever a concrete previous
//! version exists since they reproduce exactly what that release deploys; a
//! snapshot is the fallback when there is nothing to rebuild from.

use tracing::{info, warn};

use super::backup::restore_resources;
use super::context::Context;
use super::error::{UpgradeError, UpgradeResult};
use super::outcome::BestEffort;
use super::progress::ProgressTracker;
use super::rollout::{
    apply_crds, apply_deployment_manifest, scale_down_controller, scale_up_controller,
    wait_for_all_ready,
};
use super::version_config::{update_settings, update_version_config};
use super::wait::wait_for_crds_established;

pub const SNAPSHOT_ROLLBACK_STEPS: u32 = 1;
pub const MANIFEST_ROLLBACK_STEPS: u32 = 6;

/// Restore the snapshot `backup_id`, failing unless every object came back.
pub async fn snapshot_rollback(
    ctx: &Context,
    tracker: &ProgressTracker,
    backup_id: &str,
) -> UpgradeResult<()> {
    let report = tracker
        .phase("Restore from backup", restore_resources(ctx, backup_id))
        .await?;
    if report.is_clean() {
        Ok(())
    } else {
        Err(UpgradeError::RestoreIncomplete(report.to_string()))
    }
}

/// Reapply the manifests of `previous_version`.
///
/// Only the controller steps are fatal; everything else is reported in the
/// returned [`BestEffort`].
pub async fn manifest_rollback(
    ctx: &Context,
    tracker: &ProgressTracker,
    previous_version: &str,
    recorded_replicas: Option<i32>,
) -> UpgradeResult<BestEffort> {
    let mut report = BestEffort::new();
    info!(version = %previous_version, "Rolling back to previous release manifests");

    let replicas = tracker
        .phase(
            "Scale down controller",
            scale_down_controller(ctx, tracker, recorded_replicas),
        )
        .await?;

    let crds = tracker
        .phase("Restore CRDs", async {
            let mut crd_report = BestEffort::new();
            let names = crd_report
                .absorb("apply CRDs", apply_crds(ctx, previous_version).await)
                .unwrap_or_default();
            crd_report.absorb(
                "wait for CRDs",
                wait_for_crds_established(ctx, &names).await,
            );
            Ok::<_, UpgradeError>(crd_report)
        })
        .await?;
    report.merge(crds);

    tracker
        .phase("Restore controller", async {
            apply_deployment_manifest(ctx, &ctx.config.controller, previous_version, Some(0))
                .await?;
            scale_up_controller(ctx, replicas).await
        })
        .await?;

    let services = tracker
        .phase("Restore SDK and UI", async {
            let mut services = BestEffort::new();
            for dc in [&ctx.config.sdk, &ctx.config.ui] {
                services.absorb(
                    format!("apply {}", dc.name),
                    apply_deployment_manifest(ctx, dc, previous_version, None).await,
                );
            }
            Ok::<_, UpgradeError>(services)
        })
        .await?;
    report.merge(services);

    let ready = tracker
        .phase("Wait for deployments", async {
            let mut ready = BestEffort::new();
            ready.absorb("wait for deployments", wait_for_all_ready(ctx).await);
            Ok::<_, UpgradeError>(ready)
        })
        .await?;
    report.merge(ready);

    let config_maps = tracker
        .phase("Restore ConfigMaps", async {
            let mut config_maps = BestEffort::new();
            config_maps.absorb(
                "restore version-config",
                update_version_config(ctx, previous_version).await,
            );
            config_maps.absorb(
                "restore settings",
                update_settings(ctx, previous_version).await,
            );
            Ok::<_, UpgradeError>(config_maps)
        })
        .await?;
    report.merge(config_maps);

    if report.is_clean() {
        info!(version = %previous_version, "Manifest rollback completed");
    } else {
        warn!(version = %previous_version, failures = %report, "Manifest rollback completed with failures");
    }
    Ok(report)
}
