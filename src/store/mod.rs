//! Abstract cluster object store
//!
//! The orchestrator never talks to `kube::Api` directly. Every read and write
//! goes through [`ObjectStore`], an untyped CRUD + List surface keyed by
//! `(resource, namespace, name)` whose payloads are [`DynamicObject`]s.
//! Typed access is layered on top with [`decode`] / [`encode`].
//!
//! Two implementations ship with the crate:
//! - [`KubeStore`] - backed by a live cluster through `kube::Api<DynamicObject>`
//! - [`MemoryStore`] - an in-process store with resource versions and
//!   optimistic-concurrency conflicts, used by tests

mod kube_store;
mod memory;
mod retry;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;
pub use retry::{ConflictRetry, retry_on_conflict};

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::Resource;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::core::TypeMeta;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Addresses one kind of object in the cluster.
///
/// Built-in kinds are obtained from their `k8s_openapi` type; custom resources
/// are discovered at runtime from their CustomResourceDefinition.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceDescriptor {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        plural: impl Into<String>,
        namespaced: bool,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            plural: plural.into(),
            namespaced,
        }
    }

    /// Descriptor for a statically known `k8s_openapi` resource type.
    pub fn of<K: Resource<DynamicType = ()>>(namespaced: bool) -> Self {
        Self::new(
            K::group(&()),
            K::version(&()),
            K::kind(&()),
            K::plural(&()),
            namespaced,
        )
    }

    pub fn config_map() -> Self {
        Self::of::<ConfigMap>(true)
    }

    pub fn secret() -> Self {
        Self::of::<Secret>(true)
    }

    pub fn deployment() -> Self {
        Self::of::<Deployment>(true)
    }

    pub fn custom_resource_definition() -> Self {
        Self::of::<CustomResourceDefinition>(false)
    }

    /// `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(&self.group, &self.version, &self.kind),
            &self.plural,
        )
    }

    pub fn type_meta(&self) -> TypeMeta {
        TypeMeta {
            api_version: self.api_version(),
            kind: self.kind.clone(),
        }
    }

    /// An empty object of this kind, ready to be filled in.
    pub fn new_object(&self, name: &str, namespace: Option<&str>) -> DynamicObject {
        let mut object = DynamicObject::new(name, &self.api_resource());
        if self.namespaced {
            object.metadata.namespace = namespace.map(str::to_string);
        }
        object
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.plural)
        } else {
            write!(f, "{}.{}", self.plural, self.group)
        }
    }
}

/// Errors surfaced by an [`ObjectStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{resource} {name} not found")]
    NotFound { resource: String, name: String },

    #[error("{resource} {name} already exists")]
    AlreadyExists { resource: String, name: String },

    #[error("Conflict writing {resource} {name}: {message}")]
    Conflict {
        resource: String,
        name: String,
        message: String,
    },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub(crate) fn not_found(resource: &ResourceDescriptor, name: &str) -> Self {
        StoreError::NotFound {
            resource: resource.to_string(),
            name: name.to_string(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Transactional object store consumed by the orchestrator.
///
/// `replace` honours `metadata.resourceVersion`: a stale version yields
/// [`StoreError::Conflict`]. `create` of an existing name yields
/// [`StoreError::AlreadyExists`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<DynamicObject>;

    async fn list(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
    ) -> StoreResult<Vec<DynamicObject>>;

    async fn create(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> StoreResult<DynamicObject>;

    async fn replace(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> StoreResult<DynamicObject>;

    async fn delete(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<()>;
}

/// Convert an untyped object into its `k8s_openapi` type.
pub fn decode<K: DeserializeOwned>(object: &DynamicObject) -> StoreResult<K> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Convert a typed object into an untyped one.
pub fn encode<K: Serialize>(object: &K) -> StoreResult<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// `get` that maps NotFound to `None`.
pub async fn get_opt(
    store: &dyn ObjectStore,
    resource: &ResourceDescriptor,
    namespace: Option<&str>,
    name: &str,
) -> StoreResult<Option<DynamicObject>> {
    match store.get(resource, namespace, name).await {
        Ok(object) => Ok(Some(object)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// `delete` that treats an already-absent object as success.
///
/// Returns whether an object was actually deleted.
pub async fn delete_if_exists(
    store: &dyn ObjectStore,
    resource: &ResourceDescriptor,
    namespace: Option<&str>,
    name: &str,
) -> StoreResult<bool> {
    match store.delete(resource, namespace, name).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
