//! Deadline-bounded poll loops
//!
//! Every wait in the orchestrator goes through [`poll_until`], which checks a
//! condition at a fixed interval until it holds, the deadline passes, or the
//! context's cancellation token fires.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use tokio::time::Instant;
use tracing::{debug, info};

use super::context::Context;
use super::error::{UpgradeError, UpgradeResult};
use crate::crd::is_established;
use crate::store::{ResourceDescriptor, decode, get_opt};

/// Poll `check` every `interval` until it returns `true`.
///
/// A check error aborts the wait and is returned as is.
pub async fn poll_until<F, Fut>(
    ctx: &Context,
    operation: &str,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> UpgradeResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = UpgradeResult<bool>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(UpgradeError::Cancelled);
        }
        if check().await? {
            debug!(operation = %operation, "Condition met");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(UpgradeError::Timeout {
                operation: operation.to_string(),
                timeout,
            });
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(UpgradeError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Wait until every named CRD reports `Established`.
pub async fn wait_for_crds_established(ctx: &Context, names: &[String]) -> UpgradeResult<()> {
    if names.is_empty() {
        return Ok(());
    }
    info!(count = names.len(), "Waiting for CRDs to be established");
    let resource = ResourceDescriptor::custom_resource_definition();
    let resource = &resource;
    let store = ctx.store();
    poll_until(
        ctx,
        "CRDs to be established",
        ctx.config.crd_timeout,
        ctx.config.crd_poll_interval,
        move || async move {
            for name in names {
                let Some(object) = get_opt(store, resource, None, name).await? else {
                    debug!(crd = %name, "CRD not yet visible");
                    return Ok(false);
                };
                let crd: CustomResourceDefinition = decode(&object)?;
                if !is_established(&crd) {
                    debug!(crd = %name, "CRD not yet established");
                    return Ok(false);
                }
            }
            Ok(true)
        },
    )
    .await
}
