//! Error types for the upgrade orchestrator
//!
//! Errors are classified by how the executor reacts to them:
//! - **Guard**: the run refuses to start and touches nothing
//! - **Fatal**: the phase driver aborts and the failure handler rolls back
//! - **Instability**: every phase succeeded but deployments did not stay ready
//! - **Cancelled**: an external signal stopped a wait; partial state is left as is

use std::time::Duration;

use thiserror::Error;

use super::progress::UpgradeStatus;
use super::state_machine::UpgradeEvent;
use super::validation::ValidationResult;
use crate::resources::{FetchError, ManifestError};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum UpgradeError {
    // ============================================
    // Guard errors (nothing mutated)
    // ============================================
    #[error("Another upgrade is already active: {record} is {status}")]
    ConcurrentUpgrade {
        record: String,
        status: UpgradeStatus,
    },

    #[error("Another run claimed {record} first")]
    ClaimLost { record: String },

    #[error("Invalid arguments: {0}")]
    InvalidArgument(String),

    // ============================================
    // Fatal errors (trigger rollback)
    // ============================================
    #[error("Pre-upgrade checks failed: {0}")]
    PreUpgradeChecksFailed(ValidationResult),

    #[error("Object store error: {0}")]
    Store(#[from] StoreError),

    #[error("Manifest fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Invalid manifest {path}: {source}")]
    Manifest {
        path: String,
        #[source]
        source: ManifestError,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backup encoding error: {0}")]
    BackupEncoding(String),

    #[error("Backup {0} not found")]
    BackupNotFound(String),

    #[error("Restore incomplete: {0}")]
    RestoreIncomplete(String),

    #[error("Backup ID already set to {current}, refusing to change it to {requested}")]
    BackupIdImmutable { current: String, requested: String },

    #[error("Invalid status transition from {from} on {event}")]
    InvalidTransition {
        from: UpgradeStatus,
        event: UpgradeEvent,
    },

    #[error("Status transition from {from} on {event} rejected: {reason}")]
    TransitionRejected {
        from: UpgradeStatus,
        event: UpgradeEvent,
        reason: String,
    },

    #[error("Timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    // ============================================
    // Terminal instability (backups retained)
    // ============================================
    #[error("Deployments not stable after upgrade: {0}")]
    Unstable(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl UpgradeError {
    pub fn manifest(path: &str, source: ManifestError) -> Self {
        UpgradeError::Manifest {
            path: path.to_string(),
            source,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, UpgradeError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpgradeError::Cancelled)
    }

    pub fn is_concurrent_upgrade(&self) -> bool {
        matches!(
            self,
            UpgradeError::ConcurrentUpgrade { .. } | UpgradeError::ClaimLost { .. }
        )
    }

    /// Errors raised before any cluster mutation.
    pub fn is_guard(&self) -> bool {
        self.is_concurrent_upgrade() || matches!(self, UpgradeError::InvalidArgument(_))
    }

    pub fn is_unstable(&self) -> bool {
        matches!(self, UpgradeError::Unstable(_))
    }

    /// Process exit code for the job.
    pub fn exit_code(&self) -> i32 {
        match self {
            UpgradeError::ConcurrentUpgrade { .. }
            | UpgradeError::ClaimLost { .. }
            | UpgradeError::InvalidArgument(_) => 2,
            UpgradeError::PreUpgradeChecksFailed(_) => 3,
            UpgradeError::Unstable(_) => 4,
            UpgradeError::Cancelled => 130,
            _ => 1,
        }
    }
}

pub type UpgradeResult<T, E = UpgradeError> = std::result::Result<T, E>;
