use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::UpgradeConfig;
use crate::health::HealthState;
use crate::resources::ManifestSource;
use crate::store::ObjectStore;

/// Source of the current time; injectable so backup IDs are deterministic in tests
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Everything the phase drivers need, constructed once at startup
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn ObjectStore>,
    pub manifests: Arc<dyn ManifestSource>,
    pub config: UpgradeConfig,
    /// Cancelled on SIGTERM/SIGINT; every wait observes it
    pub cancel: CancellationToken,
    /// Metrics sink (None when the job runs without a metrics server)
    pub health_state: Option<Arc<HealthState>>,
    clock: Clock,
}

impl Context {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        manifests: Arc<dyn ManifestSource>,
        config: UpgradeConfig,
    ) -> Self {
        Self {
            store,
            manifests,
            config,
            cancel: CancellationToken::new(),
            health_state: None,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_health_state(mut self, health_state: Arc<HealthState>) -> Self {
        self.health_state = Some(health_state);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}
