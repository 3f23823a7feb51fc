//! Finite state machine for the upgrade/rollback lifecycle
//!
//! Every status change of the progress record goes through this table, so a
//! record can never jump e.g. from `completed` back to `deploying`.
//!
//! ## Status Flow
//!
//! ```text
//! Pending → InProgress → Deploying → VerifyingStability → Completed
//!    │          │            │               │
//!    └──────────┴─────┬──────┴───────────────┘
//!                     ↓
//!                   Failed → RollingBack → RolledBack | RollbackFailed
//!
//! Pending → RollingBack   (explicit rollback job)
//! ```

use std::fmt;

use super::progress::UpgradeStatus;

/// Events that move the progress record between statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpgradeEvent {
    /// Fresh record persisted, pre-upgrade checks starting
    Started,
    /// CRDs and ConfigMaps in place, deployment rollout starting
    DeploymentStarted,
    /// All deployments applied and ready, re-checking stability
    VerificationStarted,
    /// Stability confirmed, backups pruned
    StabilityConfirmed,
    /// A fatal error or instability was detected
    ErrorOccurred,
    /// Restore of the previous state is starting
    RollbackStarted,
    /// Previous state restored
    RollbackSucceeded,
    /// Restoring the previous state failed as well
    RollbackErrored,
}

impl fmt::Display for UpgradeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpgradeEvent::Started => "Started",
            UpgradeEvent::DeploymentStarted => "DeploymentStarted",
            UpgradeEvent::VerificationStarted => "VerificationStarted",
            UpgradeEvent::StabilityConfirmed => "StabilityConfirmed",
            UpgradeEvent::ErrorOccurred => "ErrorOccurred",
            UpgradeEvent::RollbackStarted => "RollbackStarted",
            UpgradeEvent::RollbackSucceeded => "RollbackSucceeded",
            UpgradeEvent::RollbackErrored => "RollbackErrored",
        };
        f.write_str(name)
    }
}

/// Facts the guards consult
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionContext {
    /// A snapshot was taken for this attempt
    pub has_backup: bool,
    /// A concrete previous version is known to rebuild manifests from
    pub has_previous_version: bool,
}

impl TransitionContext {
    pub fn can_roll_back(&self) -> bool {
        self.has_backup || self.has_previous_version
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: UpgradeStatus,
    pub to: UpgradeStatus,
    pub event: UpgradeEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: UpgradeStatus,
        to: UpgradeStatus,
        event: UpgradeEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: UpgradeStatus,
        to: UpgradeStatus,
        event: UpgradeEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: UpgradeStatus,
        event: UpgradeEvent,
    },
    GuardFailed {
        from: UpgradeStatus,
        to: UpgradeStatus,
        event: UpgradeEvent,
        reason: String,
    },
}

pub struct UpgradeStateMachine {
    transitions: Vec<Transition>,
}

impl Default for UpgradeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl UpgradeStateMachine {
    pub fn new() -> Self {
        use UpgradeEvent::*;
        use UpgradeStatus::*;

        Self {
            transitions: vec![
                // === Forward path ===
                Transition::new(Pending, InProgress, Started, "Upgrade started"),
                Transition::new(
                    InProgress,
                    Deploying,
                    DeploymentStarted,
                    "CRDs applied, rolling out deployments",
                ),
                Transition::new(
                    Deploying,
                    VerifyingStability,
                    VerificationStarted,
                    "Deployments ready, verifying stability",
                ),
                Transition::new(
                    VerifyingStability,
                    Completed,
                    StabilityConfirmed,
                    "Deployments stable, upgrade complete",
                ),
                // === Failures ===
                Transition::new(Pending, Failed, ErrorOccurred, "Failed before starting"),
                Transition::new(InProgress, Failed, ErrorOccurred, "Pre-deployment phase failed"),
                Transition::new(Deploying, Failed, ErrorOccurred, "Deployment rollout failed"),
                Transition::new(
                    VerifyingStability,
                    Failed,
                    ErrorOccurred,
                    "Deployments not stable after rollout",
                ),
                // === Rollback ===
                Transition::new(Failed, RollingBack, RollbackStarted, "Restoring previous state"),
                Transition::new(Pending, RollingBack, RollbackStarted, "Rollback job started"),
                Transition::new(
                    RollingBack,
                    RolledBack,
                    RollbackSucceeded,
                    "Previous state restored",
                ),
                Transition::new(
                    RollingBack,
                    RollbackFailed,
                    RollbackErrored,
                    "Rollback failed, manual intervention required",
                ),
            ],
        }
    }

    pub fn transition(
        &self,
        current: UpgradeStatus,
        event: UpgradeEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = Self::check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition { current, event },
        }
    }

    pub fn can_transition(&self, from: UpgradeStatus, event: UpgradeEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    fn check_guard(transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            UpgradeEvent::RollbackStarted if !ctx.can_roll_back() => {
                Some("No backup and no previous version to roll back to".to_string())
            }
            _ => None,
        }
    }
}
