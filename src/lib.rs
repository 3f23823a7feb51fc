pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod store;

pub use config::{DeploymentConfig, UpgradeConfig};
pub use controller::{
    BestEffort, Context, Executor, UpgradeError, UpgradeProgress, UpgradeResult, UpgradeStatus,
    ValidationResult,
};
pub use health::{HealthState, Metrics};
pub use resources::{HttpManifestSource, ManifestSource};
pub use store::{KubeStore, MemoryStore, ObjectStore, ResourceDescriptor, StoreError};
