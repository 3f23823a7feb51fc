//! Persisted progress of an upgrade or rollback
//!
//! [`UpgradeProgress`] is the durable, machine-readable account of a run. It
//! lives as JSON under one key of a ConfigMap ([`ProgressStore`]) and is only
//! ever mutated through [`ProgressTracker`], whose operations pair every
//! change with a save. Saves are best-effort: a failed save is logged and the
//! run carries on.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{DynamicObject, ObjectMeta};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use super::context::Context;
use super::error::{UpgradeError, UpgradeResult};
use super::state_machine::{TransitionContext, TransitionResult, UpgradeEvent, UpgradeStateMachine};
use crate::config::{UpgradeConfig, is_unknown_version};
use crate::resources::common::{
    PROGRESS_KEY, RECORD_KIND_PROGRESS, progress_record_name, record_labels,
};
use crate::resources::manifest::apply_object;
use crate::store::{ConflictRetry, ObjectStore, ResourceDescriptor, decode, encode, get_opt};

/// Status of the progress record
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStatus {
    #[default]
    Pending,
    InProgress,
    Deploying,
    VerifyingStability,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl UpgradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeStatus::Pending => "pending",
            UpgradeStatus::InProgress => "in_progress",
            UpgradeStatus::Deploying => "deploying",
            UpgradeStatus::VerifyingStability => "verifying_stability",
            UpgradeStatus::Completed => "completed",
            UpgradeStatus::Failed => "failed",
            UpgradeStatus::RollingBack => "rolling_back",
            UpgradeStatus::RolledBack => "rolled_back",
            UpgradeStatus::RollbackFailed => "rollback_failed",
        }
    }

    /// Statuses during which another run must not start.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            UpgradeStatus::InProgress
                | UpgradeStatus::Deploying
                | UpgradeStatus::VerifyingStability
                | UpgradeStatus::RollingBack
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpgradeStatus::Completed | UpgradeStatus::RolledBack | UpgradeStatus::RollbackFailed
        )
    }
}

impl fmt::Display for UpgradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome tag
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpgradeOutcome {
    Success,
    Failure,
}

/// The single source of truth for an in-flight operation.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeProgress {
    pub current_step: String,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub status: UpgradeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub previous_version: String,
    #[serde(default)]
    pub target_version: String,
    /// Snapshot handle; immutable once set
    #[serde(rename = "backupID", default)]
    pub backup_id: String,
    /// Deployment name -> replicas before scale-down
    #[serde(default)]
    pub original_replicas: BTreeMap<String, i32>,
    /// Phase name -> seconds spent
    #[serde(default)]
    pub phase_timings: BTreeMap<String, f64>,
    #[serde(rename = "jobID", default)]
    pub job_id: String,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<UpgradeOutcome>,
}

impl UpgradeProgress {
    pub fn new(
        config: &UpgradeConfig,
        previous_version: &str,
        target_version: &str,
        total_steps: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            current_step: "Initializing".to_string(),
            total_steps,
            status: UpgradeStatus::Pending,
            start_time: Some(now),
            previous_version: previous_version.to_string(),
            target_version: target_version.to_string(),
            job_id: config.job_id.clone().unwrap_or_default(),
            pod_name: config.pod_name.clone(),
            ..Default::default()
        }
    }
}

/// A loaded record together with the resourceVersion it was read at.
///
/// `progress` is `None` when the ConfigMap exists but carries no payload; the
/// version is still kept so a new run can take the record over.
#[derive(Clone, Debug)]
pub struct StoredProgress {
    pub progress: Option<UpgradeProgress>,
    pub resource_version: Option<String>,
}

/// Reads and writes the progress ConfigMap.
#[derive(Clone)]
pub struct ProgressStore {
    store: Arc<dyn ObjectStore>,
    namespace: String,
    name: String,
    retry: ConflictRetry,
}

impl ProgressStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        namespace: &str,
        job_id: Option<&str>,
        retry: ConflictRetry,
    ) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            name: progress_record_name(job_id),
            retry,
        }
    }

    pub fn for_context(ctx: &Context) -> Self {
        Self::new(
            ctx.store.clone(),
            ctx.namespace(),
            ctx.config.job_id.as_deref(),
            ctx.config.conflict_retry.clone(),
        )
    }

    pub fn record_name(&self) -> &str {
        &self.name
    }

    pub async fn load(&self) -> UpgradeResult<Option<UpgradeProgress>> {
        Ok(self.load_versioned().await?.and_then(|stored| stored.progress))
    }

    pub async fn load_versioned(&self) -> UpgradeResult<Option<StoredProgress>> {
        let Some(object) = get_opt(
            self.store.as_ref(),
            &ResourceDescriptor::config_map(),
            Some(&self.namespace),
            &self.name,
        )
        .await?
        else {
            return Ok(None);
        };

        let cm: ConfigMap = decode(&object)?;
        let raw = cm
            .data
            .as_ref()
            .and_then(|d| d.get(PROGRESS_KEY))
            .filter(|raw| !raw.trim().is_empty());
        let progress = match raw {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => {
                warn!(record = %self.name, "Progress record has no progress payload");
                None
            }
        };

        Ok(Some(StoredProgress {
            progress,
            resource_version: cm.metadata.resource_version,
        }))
    }

    /// Write a fresh record with compare-and-swap semantics.
    ///
    /// Creates the record when none was observed, otherwise replaces it at the
    /// observed resourceVersion. Losing the race to another writer yields
    /// [`UpgradeError::ConcurrentUpgrade`].
    pub async fn claim(
        &self,
        progress: &UpgradeProgress,
        observed: Option<&StoredProgress>,
    ) -> UpgradeResult<()> {
        let resource = ResourceDescriptor::config_map();
        let mut object = self.to_object(progress)?;
        let result = match observed {
            None => self
                .store
                .create(&resource, Some(&self.namespace), &object)
                .await,
            Some(stored) => {
                object.metadata.resource_version = stored.resource_version.clone();
                self.store
                    .replace(&resource, Some(&self.namespace), &object)
                    .await
            }
        };

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() || e.is_conflict() => {
                let record = self.name.clone();
                match self.load().await {
                    Ok(Some(winner)) => Err(UpgradeError::ConcurrentUpgrade {
                        record,
                        status: winner.status,
                    }),
                    _ => Err(UpgradeError::ClaimLost { record }),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the full snapshot, retrying on conflicts.
    pub async fn save(&self, progress: &UpgradeProgress) -> UpgradeResult<()> {
        let object = self.to_object(progress)?;
        apply_object(
            self.store.as_ref(),
            &self.retry,
            &ResourceDescriptor::config_map(),
            Some(&self.namespace),
            &object,
        )
        .await?;
        Ok(())
    }

    fn to_object(&self, progress: &UpgradeProgress) -> UpgradeResult<DynamicObject> {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(record_labels(RECORD_KIND_PROGRESS)),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                PROGRESS_KEY.to_string(),
                serde_json::to_string(progress)?,
            )])),
            ..Default::default()
        };
        Ok(encode(&cm)?)
    }
}

/// Mutex-guarded progress exposing only transition operations.
///
/// Every operation persists the new snapshot before returning.
pub struct ProgressTracker {
    state: Mutex<UpgradeProgress>,
    store: ProgressStore,
    machine: UpgradeStateMachine,
    ctx: Context,
}

impl ProgressTracker {
    pub fn new(ctx: &Context, store: ProgressStore, progress: UpgradeProgress) -> Self {
        Self {
            state: Mutex::new(progress),
            store,
            machine: UpgradeStateMachine::new(),
            ctx: ctx.clone(),
        }
    }

    async fn persist(&self, progress: &UpgradeProgress) {
        if let Err(e) = self.store.save(progress).await {
            warn!(
                record = %self.store.record_name(),
                status = %progress.status,
                error = %e,
                "Failed to save progress"
            );
        }
    }

    pub async fn snapshot(&self) -> UpgradeProgress {
        self.state.lock().await.clone()
    }

    pub async fn status(&self) -> UpgradeStatus {
        self.state.lock().await.status
    }

    pub async fn set_step(&self, step: &str) {
        let mut progress = self.state.lock().await;
        progress.current_step = step.to_string();
        info!(
            step = %step,
            completed = progress.completed_steps,
            total = progress.total_steps,
            "Starting step"
        );
        self.persist(&progress).await;
    }

    pub async fn complete_step(&self) {
        let mut progress = self.state.lock().await;
        progress.completed_steps = (progress.completed_steps + 1).min(progress.total_steps);
        self.persist(&progress).await;
    }

    /// Run one step: record it as current, time it, and count it once it
    /// succeeds.
    pub async fn phase<T, Fut>(&self, name: &str, work: Fut) -> UpgradeResult<T>
    where
        Fut: Future<Output = UpgradeResult<T>>,
    {
        self.set_step(name).await;
        let started = Instant::now();
        let result = work.await;
        self.record_phase_timing(name, started.elapsed()).await;
        if result.is_ok() {
            self.complete_step().await;
        }
        result
    }

    /// Apply `event` through the state machine and persist the new status.
    pub async fn transition(&self, event: UpgradeEvent) -> UpgradeResult<UpgradeStatus> {
        let mut progress = self.state.lock().await;
        let ctx = TransitionContext {
            has_backup: !progress.backup_id.is_empty(),
            has_previous_version: !is_unknown_version(&progress.previous_version),
        };

        match self.machine.transition(progress.status, event, &ctx) {
            TransitionResult::Success {
                from,
                to,
                description,
                ..
            } => {
                progress.status = to;
                info!(from = %from, to = %to, event = %event, "{}", description);
                self.persist(&progress).await;
                Ok(to)
            }
            TransitionResult::InvalidTransition { current, event } => {
                Err(UpgradeError::InvalidTransition {
                    from: current,
                    event,
                })
            }
            TransitionResult::GuardFailed {
                from,
                event,
                reason,
                ..
            } => Err(UpgradeError::TransitionRejected {
                from,
                event,
                reason,
            }),
        }
    }

    /// Set the snapshot handle. Setting a different value once set is an error.
    pub async fn set_backup_id(&self, backup_id: &str) -> UpgradeResult<()> {
        let mut progress = self.state.lock().await;
        if !progress.backup_id.is_empty() {
            if progress.backup_id == backup_id {
                return Ok(());
            }
            return Err(UpgradeError::BackupIdImmutable {
                current: progress.backup_id.clone(),
                requested: backup_id.to_string(),
            });
        }
        progress.backup_id = backup_id.to_string();
        info!(backup_id = %backup_id, "Recorded backup");
        self.persist(&progress).await;
        Ok(())
    }

    pub async fn backup_id(&self) -> Option<String> {
        let progress = self.state.lock().await;
        (!progress.backup_id.is_empty()).then(|| progress.backup_id.clone())
    }

    pub async fn record_original_replicas(&self, deployment: &str, replicas: i32) {
        let mut progress = self.state.lock().await;
        progress
            .original_replicas
            .insert(deployment.to_string(), replicas);
        self.persist(&progress).await;
    }

    pub async fn record_phase_timing(&self, phase: &str, elapsed: Duration) {
        let seconds = elapsed.as_secs_f64();
        if let Some(health) = &self.ctx.health_state {
            health.metrics.observe_phase(phase, seconds);
        }
        let mut progress = self.state.lock().await;
        progress.phase_timings.insert(phase.to_string(), seconds);
        self.persist(&progress).await;
    }

    pub async fn record_error(&self, message: impl Into<String>) {
        let mut progress = self.state.lock().await;
        progress.error = Some(message.into());
        self.persist(&progress).await;
    }

    /// Stamp the terminal outcome.
    pub async fn finish(&self, outcome: UpgradeOutcome) {
        let mut progress = self.state.lock().await;
        progress.end_time = Some(self.ctx.now());
        progress.result = Some(outcome);
        if outcome == UpgradeOutcome::Success {
            progress.completed_steps = progress.total_steps;
        }
        self.persist(&progress).await;
    }
}
