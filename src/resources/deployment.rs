//! Deployment rollout predicates

use k8s_openapi::api::apps::v1::Deployment;

/// Replicas the deployment asks for; the API server defaults a missing value to 1.
pub fn desired_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

/// True once the controller has observed the latest spec generation.
pub fn generation_observed(deployment: &Deployment) -> bool {
    let generation = deployment.metadata.generation.unwrap_or(0);
    let observed = deployment
        .status
        .as_ref()
        .and_then(|s| s.observed_generation)
        .unwrap_or(0);
    observed >= generation
}

pub fn has_available_condition(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Available" && c.status == "True")
        })
}

/// Rolled out and serving.
///
/// A deployment whose latest generation has not been observed is never ready,
/// even if its replica counts happen to match. A deployment scaled to zero is
/// ready once nothing is left running.
pub fn is_deployment_ready(deployment: &Deployment) -> bool {
    if !generation_observed(deployment) {
        return false;
    }

    let desired = desired_replicas(deployment);
    let status = deployment.status.as_ref();
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);

    if desired == 0 {
        return ready == 0;
    }

    ready == desired && updated == desired && has_available_condition(deployment)
}

/// No pods left, ready or otherwise.
pub fn is_scaled_down(deployment: &Deployment) -> bool {
    let status = deployment.status.as_ref();
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let total = status.and_then(|s| s.replicas).unwrap_or(0);
    ready == 0 && total == 0
}

/// Image of the named container, if present.
pub fn container_image<'a>(deployment: &'a Deployment, container: &str) -> Option<&'a str> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == container)?
        .image
        .as_deref()
}
