pub mod backup;
pub mod cleanup;
pub mod context;
pub mod error;
pub mod executor;
pub mod outcome;
pub mod progress;
pub mod rollback;
pub mod rollout;
pub mod state_machine;
pub mod validation;
pub mod version_config;
pub mod wait;

pub use backup::{Snapshot, backup_resources, restore_resources};
pub use cleanup::cleanup_resources;
pub use context::{Clock, Context};
pub use error::{UpgradeError, UpgradeResult};
pub use executor::{Executor, UPGRADE_STEPS};
pub use outcome::{BestEffort, SoftFailure};
pub use progress::{
    ProgressStore, ProgressTracker, UpgradeOutcome, UpgradeProgress, UpgradeStatus,
};
pub use state_machine::{TransitionContext, TransitionResult, UpgradeEvent, UpgradeStateMachine};
pub use validation::{ValidationResult, run_pre_upgrade_checks};
