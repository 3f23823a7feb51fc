//! Best-effort removal of objects that block the pre-upgrade checks
//!
//! Every deletion is attempted; failures are collected in the returned
//! [`BestEffort`] report and never abort the sweep.

use kube::ResourceExt;
use tracing::info;

use super::context::Context;
use super::outcome::BestEffort;
use crate::crd::{
    discover_product_crds, is_master_sentinel, list_instances, migration_plans,
    rolling_migration_plans, vjailbreak_nodes,
};
use crate::store::{ObjectStore, ResourceDescriptor, delete_if_exists};

/// Delete migration plans, agents, credential secrets and every product
/// custom resource, sparing the master sentinel.
pub async fn cleanup_resources(ctx: &Context) -> BestEffort {
    let store = ctx.store();
    let ns = ctx.namespace();
    let mut report = BestEffort::new();
    info!(namespace = %ns, "Cleaning up resources blocking the upgrade");

    for resource in [migration_plans(), rolling_migration_plans(), vjailbreak_nodes()] {
        delete_all(store, &resource, Some(ns), &mut report).await;
    }

    for secret in [&ctx.config.vmware_secret, &ctx.config.openstack_secret] {
        let result =
            delete_if_exists(store, &ResourceDescriptor::secret(), Some(ns), secret).await;
        if let Some(true) = report.absorb(format!("delete secret {secret}"), result) {
            info!(secret = %secret, "Deleted credential secret");
        }
    }

    match discover_product_crds(store).await {
        Ok(crds) => {
            for crd in crds {
                match list_instances(store, &crd, ns).await {
                    Ok(items) => {
                        let scope = crd.resource.namespaced.then_some(ns);
                        for item in items {
                            delete_one(store, &crd.resource, scope, &item.name_any(), &mut report)
                                .await;
                        }
                    }
                    Err(e) => report.fail(format!("list {}", crd.resource), e.to_string()),
                }
            }
        }
        Err(e) => report.fail("discover product CRDs", e.to_string()),
    }

    if report.is_clean() {
        info!("Cleanup completed");
    } else {
        info!(failures = report.failures().len(), "Cleanup completed with failures");
    }
    report
}

async fn delete_all(
    store: &dyn ObjectStore,
    resource: &ResourceDescriptor,
    namespace: Option<&str>,
    report: &mut BestEffort,
) {
    let items = match store.list(resource, namespace).await {
        Ok(items) => items,
        Err(e) if e.is_not_found() => return,
        Err(e) => {
            report.fail(format!("list {resource}"), e.to_string());
            return;
        }
    };
    for item in items {
        delete_one(store, resource, namespace, &item.name_any(), report).await;
    }
}

async fn delete_one(
    store: &dyn ObjectStore,
    resource: &ResourceDescriptor,
    namespace: Option<&str>,
    name: &str,
    report: &mut BestEffort,
) {
    if is_master_sentinel(name) {
        return;
    }
    let result = delete_if_exists(store, resource, namespace, name).await;
    if let Some(true) = report.absorb(format!("delete {resource} {name}"), result) {
        info!(resource = %resource, name = %name, "Deleted");
    }
}
