//! [`ObjectStore`] backed by a live Kubernetes API server

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use super::{ObjectStore, ResourceDescriptor, StoreError, StoreResult};
use crate::resources::common::FIELD_MANAGER;

/// Store that forwards every call to the API server through
/// `Api<DynamicObject>`.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a store from the in-cluster or kubeconfig environment.
    pub async fn try_default() -> StoreResult<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn api(&self, resource: &ResourceDescriptor, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = resource.api_resource();
        match namespace {
            Some(ns) if resource.namespaced => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

/// Map API status codes onto the store's error vocabulary.
fn map_error(err: kube::Error, resource: &ResourceDescriptor, name: &str) -> StoreError {
    match err {
        kube::Error::Api(ref resp) if resp.code == 404 => StoreError::not_found(resource, name),
        kube::Error::Api(ref resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            StoreError::AlreadyExists {
                resource: resource.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(ref resp) if resp.code == 409 => StoreError::Conflict {
            resource: resource.to_string(),
            name: name.to_string(),
            message: resp.message.clone(),
        },
        other => StoreError::Kube(other),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<DynamicObject> {
        self.api(resource, namespace)
            .get(name)
            .await
            .map_err(|e| map_error(e, resource, name))
    }

    async fn list(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
    ) -> StoreResult<Vec<DynamicObject>> {
        let list = self
            .api(resource, namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| map_error(e, resource, "*"))?;
        debug!(resource = %resource, count = list.items.len(), "Listed objects");
        Ok(list.items)
    }

    async fn create(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> StoreResult<DynamicObject> {
        let name = object.name_any();
        self.api(resource, namespace)
            .create(&Self::post_params(), object)
            .await
            .map_err(|e| map_error(e, resource, &name))
    }

    async fn replace(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> StoreResult<DynamicObject> {
        let name = object.name_any();
        self.api(resource, namespace)
            .replace(&name, &Self::post_params(), object)
            .await
            .map_err(|e| map_error(e, resource, &name))
    }

    async fn delete(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<()> {
        self.api(resource, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_error(e, resource, name))
    }
}
