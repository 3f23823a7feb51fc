//! Upgrade and rollback executor
//!
//! The executor drives one run from start to finish:
//!
//! 1. Refuse to start while the progress record shows another active run
//! 2. Claim the progress record with a compare-and-swap write
//! 3. Drive the phases in order, persisting progress after every step
//! 4. On a fatal error, mark the run failed and restore the snapshot
//!
//! Deploy-time failures and post-deploy instability are kept apart: the
//! former triggers a rollback, the latter leaves the release in place with
//! its backups retained for investigation.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use super::backup::{backup_resources, cleanup_all_old_backups, cleanup_backup_config_maps};
use super::cleanup::cleanup_resources;
use super::context::Context;
use super::error::{UpgradeError, UpgradeResult};
use super::outcome::BestEffort;
use super::progress::{
    ProgressStore, ProgressTracker, StoredProgress, UpgradeOutcome, UpgradeProgress,
    UpgradeStatus,
};
use super::rollback::{
    MANIFEST_ROLLBACK_STEPS, SNAPSHOT_ROLLBACK_STEPS, manifest_rollback, snapshot_rollback,
};
use super::rollout::{
    apply_crds, apply_deployment_manifest, roll_out_controller, verify_stability,
    wait_for_all_ready,
};
use super::state_machine::UpgradeEvent;
use super::validation::{ValidationResult, run_pre_upgrade_checks};
use super::version_config::{read_current_version, set_version, update_settings, update_version_config};
use super::wait::wait_for_crds_established;
use crate::config::is_unknown_version;
use crate::resources::common::new_backup_id;

/// Steps of an upgrade, for the progress bar
pub const UPGRADE_STEPS: u32 = 8;

enum RollbackPath {
    /// Reapply the previous release's manifests
    Manifests,
    /// Restore the named backup
    Snapshot(String),
}

pub struct Executor {
    ctx: Arc<Context>,
    progress: ProgressStore,
}

impl Executor {
    pub fn new(ctx: Context) -> Self {
        let progress = ProgressStore::for_context(&ctx);
        Self {
            ctx: Arc::new(ctx),
            progress,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Run the pre-upgrade checks without changing anything.
    pub async fn check(&self, target_version: &str) -> UpgradeResult<ValidationResult> {
        run_pre_upgrade_checks(&self.ctx, target_version).await
    }

    /// The persisted progress record, if any.
    pub async fn status(&self) -> UpgradeResult<Option<UpgradeProgress>> {
        self.progress.load().await
    }

    /// Load the existing record, refusing to proceed if it shows an active run.
    async fn guard(&self) -> UpgradeResult<Option<StoredProgress>> {
        let observed = self.progress.load_versioned().await?;
        if let Some(status) = observed
            .as_ref()
            .and_then(|stored| stored.progress.as_ref())
            .map(|p| p.status)
            .filter(UpgradeStatus::is_active)
        {
            warn!(
                record = %self.progress.record_name(),
                status = %status,
                "Another run is active, refusing to start"
            );
            return Err(UpgradeError::ConcurrentUpgrade {
                record: self.progress.record_name().to_string(),
                status,
            });
        }
        Ok(observed)
    }

    fn record_run<T>(&self, operation: &str, result: &UpgradeResult<T>) {
        let outcome = match result {
            Ok(_) => "success",
            Err(e) if e.is_guard() => "refused",
            Err(e) if e.is_unstable() => "unstable",
            Err(e) if e.is_cancelled() => "cancelled",
            Err(_) => "failure",
        };
        if let Some(health) = &self.ctx.health_state {
            health.metrics.record_run(operation, outcome);
        }
    }

    /// Upgrade the installation to `target_version`.
    #[instrument(skip(self), fields(namespace = %self.ctx.namespace()))]
    pub async fn execute(
        &self,
        target_version: &str,
        auto_cleanup: bool,
    ) -> UpgradeResult<UpgradeProgress> {
        let result = self.execute_upgrade(target_version, auto_cleanup).await;
        self.record_run("upgrade", &result);
        result
    }

    async fn execute_upgrade(
        &self,
        target_version: &str,
        auto_cleanup: bool,
    ) -> UpgradeResult<UpgradeProgress> {
        if target_version.is_empty() {
            return Err(UpgradeError::InvalidArgument(
                "target version is required".to_string(),
            ));
        }
        let observed = self.guard().await?;
        let ctx = self.ctx.as_ref();

        let previous_version = read_current_version(ctx).await;
        info!(from = %previous_version, to = %target_version, "Starting upgrade");
        let progress = UpgradeProgress::new(
            &ctx.config,
            &previous_version,
            target_version,
            UPGRADE_STEPS,
            ctx.now(),
        );
        self.progress.claim(&progress, observed.as_ref()).await?;
        let tracker = ProgressTracker::new(ctx, self.progress.clone(), progress);
        tracker.transition(UpgradeEvent::Started).await?;

        if let Err(e) = self.deploy(&tracker, target_version, auto_cleanup).await {
            self.handle_failure(&tracker, &e).await;
            return Err(e);
        }
        self.stabilize(&tracker).await?;
        Ok(tracker.snapshot().await)
    }

    /// Pre-upgrade checks through the rollout of all three deployments.
    async fn deploy(
        &self,
        tracker: &ProgressTracker,
        target_version: &str,
        auto_cleanup: bool,
    ) -> UpgradeResult<()> {
        let ctx = self.ctx.as_ref();

        tracker
            .phase(
                "Pre-upgrade checks",
                self.pre_upgrade_checks(target_version, auto_cleanup),
            )
            .await?;

        let backup_id = new_backup_id(ctx.now());
        tracker
            .phase("Backup", backup_resources(ctx, &backup_id))
            .await?;
        tracker.set_backup_id(&backup_id).await?;

        tracker
            .phase("Apply CRDs", async {
                let names = apply_crds(ctx, target_version).await?;
                if let Err(e) = wait_for_crds_established(ctx, &names).await {
                    if e.is_cancelled() {
                        return Err(e);
                    }
                    warn!(error = %e, "CRDs not established yet, continuing");
                }
                Ok::<_, UpgradeError>(())
            })
            .await?;

        let config_maps = tracker
            .phase("Update ConfigMaps", async {
                let mut report = BestEffort::new();
                report.absorb(
                    "update version-config",
                    update_version_config(ctx, target_version).await,
                );
                report.absorb("update settings", update_settings(ctx, target_version).await);
                Ok::<_, UpgradeError>(report)
            })
            .await?;
        if !config_maps.is_clean() {
            warn!(failures = %config_maps, "ConfigMap updates incomplete, continuing");
        }

        tracker.transition(UpgradeEvent::DeploymentStarted).await?;
        tracker
            .phase(
                "Roll out controller",
                roll_out_controller(ctx, tracker, target_version),
            )
            .await?;

        tracker
            .phase("Roll out SDK and UI", async {
                apply_deployment_manifest(ctx, &ctx.config.sdk, target_version, None).await?;
                apply_deployment_manifest(ctx, &ctx.config.ui, target_version, None).await?;
                wait_for_all_ready(ctx).await
            })
            .await
    }

    /// Run the checks; with `auto_cleanup`, clean up once and check again.
    async fn pre_upgrade_checks(&self, target_version: &str, auto_cleanup: bool) -> UpgradeResult<()> {
        let ctx = self.ctx.as_ref();
        let mut result = run_pre_upgrade_checks(ctx, target_version).await?;
        if !result.passed_all() && auto_cleanup {
            info!(checks = %result, "Pre-upgrade checks failed, cleaning up and retrying once");
            let report = cleanup_resources(ctx).await;
            if !report.is_clean() {
                warn!(failures = %report, "Cleanup left failures behind");
            }
            result = run_pre_upgrade_checks(ctx, target_version).await?;
        }
        if result.passed_all() {
            Ok(())
        } else {
            Err(UpgradeError::PreUpgradeChecksFailed(result))
        }
    }

    /// Verify stability, then prune backups and complete.
    async fn stabilize(&self, tracker: &ProgressTracker) -> UpgradeResult<()> {
        let ctx = self.ctx.as_ref();
        tracker.transition(UpgradeEvent::VerificationStarted).await?;

        if let Err(e) = tracker.phase("Verify stability", verify_stability(ctx)).await {
            error!(error = %e, "Upgrade is not stable, keeping backups");
            tracker.record_error(e.to_string()).await;
            if let Err(transition) = tracker.transition(UpgradeEvent::ErrorOccurred).await {
                warn!(error = %transition, "Could not mark the upgrade failed");
            }
            tracker.finish(UpgradeOutcome::Failure).await;
            return Err(e);
        }

        let pruned = tracker
            .phase("Clean up backups", async {
                let mut report = BestEffort::new();
                if let Some(backup_id) = tracker.backup_id().await {
                    report.merge(cleanup_backup_config_maps(ctx, &backup_id).await);
                    report.merge(cleanup_all_old_backups(ctx, &backup_id).await);
                }
                Ok::<_, UpgradeError>(report)
            })
            .await?;
        if !pruned.is_clean() {
            warn!(failures = %pruned, "Some backup records were not deleted");
        }

        tracker.transition(UpgradeEvent::StabilityConfirmed).await?;
        tracker.finish(UpgradeOutcome::Success).await;
        info!("Upgrade completed");
        Ok(())
    }

    /// Mark the run failed and restore the snapshot if one was taken.
    async fn handle_failure(&self, tracker: &ProgressTracker, cause: &UpgradeError) {
        let ctx = self.ctx.as_ref();
        error!(error = %cause, "Upgrade failed");
        tracker.record_error(cause.to_string()).await;
        if let Err(e) = tracker.transition(UpgradeEvent::ErrorOccurred).await {
            warn!(error = %e, "Could not mark the upgrade failed");
        }

        if cause.is_cancelled() {
            warn!("Upgrade cancelled, leaving the cluster as it is");
            tracker.finish(UpgradeOutcome::Failure).await;
            return;
        }
        // Nothing was changed before the backup.
        let Some(backup_id) = tracker.backup_id().await else {
            tracker.finish(UpgradeOutcome::Failure).await;
            return;
        };

        let previous_version = tracker.snapshot().await.previous_version;
        if !is_unknown_version(&previous_version)
            && let Err(e) = set_version(ctx, &previous_version).await
        {
            warn!(error = %e, "Could not restore version-config");
        }

        if let Err(e) = tracker.transition(UpgradeEvent::RollbackStarted).await {
            warn!(error = %e, "Rollback not allowed");
            tracker.finish(UpgradeOutcome::Failure).await;
            return;
        }
        let event = match snapshot_rollback(ctx, tracker, &backup_id).await {
            Ok(()) => {
                info!(backup_id = %backup_id, "Rolled back to the backup");
                UpgradeEvent::RollbackSucceeded
            }
            Err(e) => {
                error!(backup_id = %backup_id, error = %e, "Rollback failed, manual intervention required");
                tracker
                    .record_error(format!("{cause}; rollback failed: {e}"))
                    .await;
                UpgradeEvent::RollbackErrored
            }
        };
        if let Err(e) = tracker.transition(event).await {
            warn!(error = %e, "Could not record the rollback outcome");
        }
        tracker.finish(UpgradeOutcome::Failure).await;
    }

    /// Roll the installation back from `target_version` to `previous_version`.
    ///
    /// With a concrete previous version the previous release's manifests are
    /// reapplied. Without one, the snapshot named by `backup_id` (or the one
    /// recorded by the last run) is restored.
    #[instrument(skip(self), fields(namespace = %self.ctx.namespace()))]
    pub async fn execute_rollback(
        &self,
        previous_version: &str,
        target_version: &str,
        backup_id: Option<&str>,
    ) -> UpgradeResult<UpgradeProgress> {
        let result = self
            .execute_rollback_inner(previous_version, target_version, backup_id)
            .await;
        self.record_run("rollback", &result);
        result
    }

    async fn execute_rollback_inner(
        &self,
        previous_version: &str,
        target_version: &str,
        backup_id: Option<&str>,
    ) -> UpgradeResult<UpgradeProgress> {
        let observed = self.guard().await?;
        let prior = observed.as_ref().and_then(|stored| stored.progress.as_ref());
        let ctx = self.ctx.as_ref();

        let backup_id = backup_id
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| {
                prior
                    .map(|p| p.backup_id.clone())
                    .filter(|id| !id.is_empty())
            });
        let backup_id_hint = backup_id.clone();
        let path = match backup_id {
            _ if !is_unknown_version(previous_version) => RollbackPath::Manifests,
            Some(backup_id) => RollbackPath::Snapshot(backup_id),
            None => {
                return Err(UpgradeError::InvalidArgument(
                    "rollback needs a previous version or a backup ID".to_string(),
                ));
            }
        };
        let recorded_replicas = prior
            .and_then(|p| p.original_replicas.get(&ctx.config.controller.name))
            .copied();

        let steps = match path {
            RollbackPath::Manifests => MANIFEST_ROLLBACK_STEPS,
            RollbackPath::Snapshot(_) => SNAPSHOT_ROLLBACK_STEPS,
        };
        let mut progress =
            UpgradeProgress::new(&ctx.config, previous_version, target_version, steps, ctx.now());
        progress.backup_id = backup_id_hint.unwrap_or_default();
        self.progress.claim(&progress, observed.as_ref()).await?;
        let tracker = ProgressTracker::new(ctx, self.progress.clone(), progress);
        tracker.transition(UpgradeEvent::RollbackStarted).await?;

        let result = match &path {
            RollbackPath::Manifests => {
                info!(to = %previous_version, "Starting manifest rollback");
                manifest_rollback(ctx, &tracker, previous_version, recorded_replicas)
                    .await
                    .map(|_| ())
            }
            RollbackPath::Snapshot(backup_id) => {
                info!(backup_id = %backup_id, "Starting snapshot rollback");
                snapshot_rollback(ctx, &tracker, backup_id).await
            }
        };

        match result {
            Ok(()) => {
                tracker.transition(UpgradeEvent::RollbackSucceeded).await?;
                tracker.finish(UpgradeOutcome::Success).await;
                info!("Rollback completed");
                Ok(tracker.snapshot().await)
            }
            Err(e) => {
                error!(error = %e, "Rollback failed");
                tracker.record_error(e.to_string()).await;
                if let Err(transition) = tracker.transition(UpgradeEvent::RollbackErrored).await {
                    warn!(error = %transition, "Could not record the rollback failure");
                }
                tracker.finish(UpgradeOutcome::Failure).await;
                Err(e)
            }
        }
    }
}
