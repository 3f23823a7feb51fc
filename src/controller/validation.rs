//! Pre-upgrade checks
//!
//! Each check is an independent read of live cluster state. A read error in
//! any check other than the agent check counts as "not passed", so a transient
//! API error blocks the upgrade instead of letting it proceed blindly. The
//! agent check propagates its read errors.

use std::fmt;

use kube::ResourceExt;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use tracing::{debug, info, warn};

use super::context::Context;
use super::error::UpgradeResult;
use crate::crd::{
    discover_product_crds, is_master_sentinel, list_instances, migration_plans,
    rolling_migration_plans, vjailbreak_nodes,
};
use crate::store::{ObjectStore, ResourceDescriptor, StoreResult, get_opt};

/// Outcome of the six pre-upgrade checks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub no_migration_plans: bool,
    pub no_rolling_migration_plans: bool,
    pub vmware_creds_deleted: bool,
    pub openstack_creds_deleted: bool,
    pub agents_scaled_down: bool,
    pub no_custom_resources: bool,
}

impl ValidationResult {
    #[cfg(test)]
    pub(crate) fn all_passed() -> Self {
        Self {
            no_migration_plans: true,
            no_rolling_migration_plans: true,
            vmware_creds_deleted: true,
            openstack_creds_deleted: true,
            agents_scaled_down: true,
            no_custom_resources: true,
        }
    }

    pub fn passed_all(&self) -> bool {
        self.no_migration_plans
            && self.no_rolling_migration_plans
            && self.vmware_creds_deleted
            && self.openstack_creds_deleted
            && self.agents_scaled_down
            && self.no_custom_resources
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "migrations={} rollingMigrations={} vmwareCreds={} openstackCreds={} agents={} customResources={}",
            self.no_migration_plans,
            self.no_rolling_migration_plans,
            self.vmware_creds_deleted,
            self.openstack_creds_deleted,
            self.agents_scaled_down,
            self.no_custom_resources,
        )
    }
}

impl Serialize for ValidationResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ValidationResult", 7)?;
        s.serialize_field("noMigrationPlans", &self.no_migration_plans)?;
        s.serialize_field("noRollingMigrationPlans", &self.no_rolling_migration_plans)?;
        s.serialize_field("vmwareCredsDeleted", &self.vmware_creds_deleted)?;
        s.serialize_field("openstackCredsDeleted", &self.openstack_creds_deleted)?;
        s.serialize_field("agentsScaledDown", &self.agents_scaled_down)?;
        s.serialize_field("noCustomResources", &self.no_custom_resources)?;
        s.serialize_field("passedAll", &self.passed_all())?;
        s.end()
    }
}

/// Run all six checks against the live cluster.
///
/// Only the agent check can fail the call itself.
pub async fn run_pre_upgrade_checks(
    ctx: &Context,
    target_version: &str,
) -> UpgradeResult<ValidationResult> {
    let store = ctx.store();
    let ns = ctx.namespace();
    info!(target_version = %target_version, namespace = %ns, "Running pre-upgrade checks");

    let result = ValidationResult {
        no_migration_plans: passed("migration plans", count_live(store, &migration_plans(), ns).await),
        no_rolling_migration_plans: passed(
            "rolling migration plans",
            count_live(store, &rolling_migration_plans(), ns).await,
        ),
        vmware_creds_deleted: secret_absent(store, ns, &ctx.config.vmware_secret).await,
        openstack_creds_deleted: secret_absent(store, ns, &ctx.config.openstack_secret).await,
        agents_scaled_down: count_agents(store, ns).await? == 0,
        no_custom_resources: passed("custom resources", count_custom_resources(store, ns).await),
    };

    if result.passed_all() {
        info!("Pre-upgrade checks passed");
    } else {
        warn!(checks = %result, "Pre-upgrade checks failed");
    }
    Ok(result)
}

/// Zero objects counts as passed; a read error does not.
fn passed(check: &str, count: StoreResult<usize>) -> bool {
    match count {
        Ok(0) => true,
        Ok(n) => {
            debug!(check = %check, count = n, "Blocking objects present");
            false
        }
        Err(e) => {
            warn!(check = %check, error = %e, "Check could not be evaluated, treating as failed");
            false
        }
    }
}

/// Instances in the namespace; a kind that is not installed has none.
async fn count_live(
    store: &dyn ObjectStore,
    resource: &ResourceDescriptor,
    ns: &str,
) -> StoreResult<usize> {
    match store.list(resource, Some(ns)).await {
        Ok(items) => Ok(items.len()),
        Err(e) if e.is_not_found() => Ok(0),
        Err(e) => Err(e),
    }
}

async fn secret_absent(store: &dyn ObjectStore, ns: &str, name: &str) -> bool {
    match get_opt(store, &ResourceDescriptor::secret(), Some(ns), name).await {
        Ok(None) => true,
        Ok(Some(_)) => {
            debug!(secret = %name, "Credential secret still present");
            false
        }
        Err(e) => {
            warn!(secret = %name, error = %e, "Could not read credential secret");
            false
        }
    }
}

/// Agent nodes other than the master sentinel.
pub async fn count_agents(store: &dyn ObjectStore, ns: &str) -> StoreResult<usize> {
    let nodes = match store.list(&vjailbreak_nodes(), Some(ns)).await {
        Ok(nodes) => nodes,
        Err(e) if e.is_not_found() => return Ok(0),
        Err(e) => return Err(e),
    };
    Ok(nodes
        .iter()
        .filter(|n| !is_master_sentinel(&n.name_any()))
        .count())
}

/// Instances of every product kind, sentinel excluded.
async fn count_custom_resources(store: &dyn ObjectStore, ns: &str) -> StoreResult<usize> {
    let mut total = 0;
    for info in discover_product_crds(store).await? {
        let instances = list_instances(store, &info, ns).await?;
        let live = instances
            .iter()
            .filter(|o| !is_master_sentinel(&o.name_any()))
            .count();
        if live > 0 {
            debug!(kind = %info.resource.kind, count = live, "Custom resources present");
        }
        total += live;
    }
    Ok(total)
}
