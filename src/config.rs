//! Static configuration of the upgrade job
//!
//! Product names (deployments, ConfigMaps, secrets, manifest paths) are fixed
//! by the vjailbreak release layout. Timeouts and retry policy default to the
//! values used in production and can be shortened for tests.

use std::time::Duration;

use crate::store::ConflictRetry;

pub const DEFAULT_NAMESPACE: &str = "migration-system";

pub const VERSION_CONFIG_NAME: &str = "version-config";
pub const VERSION_KEY: &str = "version";
pub const SETTINGS_CONFIG_NAME: &str = "vjailbreak-settings";

pub const VMWARE_CREDS_SECRET: &str = "vmware-credentials";
pub const OPENSTACK_CREDS_SECRET: &str = "openstack-credentials";

/// Release artifacts are fetched from `<base>/<path>` with `${TAG}` replaced
pub const DEFAULT_MANIFEST_BASE_URL: &str =
    "https://raw.githubusercontent.com/platform9/vjailbreak/${TAG}";

/// Ceiling on the encoded size of one backup record, in bytes
pub const BACKUP_SIZE_LIMIT: usize = 1_000_000;

/// Version reported when version-config is absent or unreadable
pub const UNKNOWN_VERSION: &str = "unknown";

/// True for versions that carry no rollback target.
pub fn is_unknown_version(version: &str) -> bool {
    version.is_empty() || version == UNKNOWN_VERSION
}

/// One of the three product deployments the job rolls out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentConfig {
    pub name: String,
    pub namespace: String,
    pub container: String,
    pub image_prefix: String,
    pub manifest_path: String,
}

impl DeploymentConfig {
    fn new(name: &str, namespace: &str, container: &str, image_prefix: &str, manifest_path: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            container: container.to_string(),
            image_prefix: image_prefix.to_string(),
            manifest_path: manifest_path.to_string(),
        }
    }

    pub fn controller(namespace: &str) -> Self {
        Self::new(
            "migration-controller-manager",
            namespace,
            "manager",
            "quay.io/platform9/vjailbreak-controller",
            "deploy/05controller-deployment.yaml",
        )
    }

    pub fn sdk(namespace: &str) -> Self {
        Self::new(
            "migration-vpwned-sdk",
            namespace,
            "vpwned",
            "quay.io/platform9/vjailbreak-vpwned",
            "deploy/06vpwned-deployment.yaml",
        )
    }

    pub fn ui(namespace: &str) -> Self {
        Self::new(
            "vjailbreak-ui",
            namespace,
            "vjailbreak-ui-container",
            "quay.io/platform9/vjailbreak-ui",
            "deploy/01ui.yaml",
        )
    }

    /// Image this deployment should run for a release tag.
    pub fn image_for(&self, tag: &str) -> String {
        format!("{}:{}", self.image_prefix, tag)
    }
}

/// Release-relative paths of the non-deployment manifests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestPaths {
    pub crds: String,
    pub version_config: String,
    pub settings: String,
}

impl Default for ManifestPaths {
    fn default() -> Self {
        Self {
            crds: "deploy/00crds.yaml".to_string(),
            version_config: "deploy/version-config.yaml".to_string(),
            settings: "deploy/vjailbreak-settings.yaml".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct UpgradeConfig {
    /// Namespace the product and the job's records live in
    pub namespace: String,
    /// Scopes the progress record to one job when set
    pub job_id: Option<String>,
    /// Recorded on the progress record for diagnosis
    pub pod_name: String,

    pub controller: DeploymentConfig,
    pub sdk: DeploymentConfig,
    pub ui: DeploymentConfig,
    pub manifests: ManifestPaths,

    pub vmware_secret: String,
    pub openstack_secret: String,

    pub deployment_timeout: Duration,
    pub poll_interval: Duration,
    pub crd_timeout: Duration,
    pub crd_poll_interval: Duration,
    /// Bound on waiting for an object to disappear during restore
    pub deletion_timeout: Duration,

    pub backup_size_limit: usize,
    pub conflict_retry: ConflictRetry,
}

impl UpgradeConfig {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            job_id: None,
            pod_name: String::new(),
            controller: DeploymentConfig::controller(namespace),
            sdk: DeploymentConfig::sdk(namespace),
            ui: DeploymentConfig::ui(namespace),
            manifests: ManifestPaths::default(),
            vmware_secret: VMWARE_CREDS_SECRET.to_string(),
            openstack_secret: OPENSTACK_CREDS_SECRET.to_string(),
            deployment_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
            crd_timeout: Duration::from_secs(120),
            crd_poll_interval: Duration::from_secs(2),
            deletion_timeout: Duration::from_secs(60),
            backup_size_limit: BACKUP_SIZE_LIMIT,
            conflict_retry: ConflictRetry::default(),
        }
    }

    pub fn with_job_id(mut self, job_id: Option<String>) -> Self {
        self.job_id = job_id.filter(|id| !id.is_empty());
        self
    }

    pub fn with_pod_name(mut self, pod_name: impl Into<String>) -> Self {
        self.pod_name = pod_name.into();
        self
    }

    /// Override every wait with the same timeout and poll interval.
    pub fn with_timeouts(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.deployment_timeout = timeout;
        self.crd_timeout = timeout;
        self.deletion_timeout = timeout;
        self.poll_interval = poll_interval;
        self.crd_poll_interval = poll_interval;
        self
    }

    /// Controller, SDK and UI, in rollout order.
    pub fn deployments(&self) -> [&DeploymentConfig; 3] {
        [&self.controller, &self.sdk, &self.ui]
    }
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}
