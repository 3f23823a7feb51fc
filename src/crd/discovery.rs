//! Runtime discovery of the product's custom resource kinds

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::ResourceExt;
use kube::api::DynamicObject;
use tracing::debug;

use super::API_GROUP;
use crate::store::{ObjectStore, ResourceDescriptor, StoreResult, decode};

/// A CRD of the product group and the descriptor for its instances.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrdInfo {
    /// CRD object name, `<plural>.<group>`
    pub name: String,
    pub resource: ResourceDescriptor,
}

impl CrdInfo {
    /// Build from a CRD, addressing instances through its storage version
    /// (falling back to the first served version).
    pub fn from_crd(crd: &CustomResourceDefinition) -> Option<Self> {
        let spec = &crd.spec;
        let version = spec
            .versions
            .iter()
            .find(|v| v.storage)
            .or_else(|| spec.versions.iter().find(|v| v.served))?;
        Some(Self {
            name: crd.name_any(),
            resource: ResourceDescriptor::new(
                spec.group.clone(),
                version.name.clone(),
                spec.names.kind.clone(),
                spec.names.plural.clone(),
                spec.scope == "Namespaced",
            ),
        })
    }
}

/// List installed CRDs belonging to the product group.
pub async fn discover_product_crds(store: &dyn ObjectStore) -> StoreResult<Vec<CrdInfo>> {
    let crds = store
        .list(&ResourceDescriptor::custom_resource_definition(), None)
        .await?;
    let mut infos = Vec::new();
    for object in &crds {
        let crd: CustomResourceDefinition = decode(object)?;
        if crd.spec.group != API_GROUP {
            continue;
        }
        if let Some(info) = CrdInfo::from_crd(&crd) {
            infos.push(info);
        }
    }
    debug!(count = infos.len(), group = API_GROUP, "Discovered product CRDs");
    Ok(infos)
}

/// Instances of a discovered kind, scoped to `namespace` for namespaced kinds.
pub async fn list_instances(
    store: &dyn ObjectStore,
    crd: &CrdInfo,
    namespace: &str,
) -> StoreResult<Vec<DynamicObject>> {
    let ns = crd.resource.namespaced.then_some(namespace);
    match store.list(&crd.resource, ns).await {
        Ok(items) => Ok(items),
        // CRD deleted between discovery and listing
        Err(e) if e.is_not_found() => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// True once the API server reports the CRD `Established`.
pub fn is_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        })
}
