//! In-process [`ObjectStore`]
//!
//! Mirrors the API server semantics the orchestrator depends on:
//! monotonically increasing resource versions, conflict detection on stale
//! replaces, AlreadyExists on duplicate creates, and `metadata.generation`
//! bumps when an object's `spec` changes. Nothing else (no admission, no
//! controllers) is simulated.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use kube::ResourceExt;
use kube::api::DynamicObject;

use super::{ObjectStore, ResourceDescriptor, StoreError, StoreResult};

/// (group, plural, namespace, name); namespace is empty for cluster-scoped kinds.
type ObjectKey = (String, String, String, String);

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    last_version: u64,
}

impl MemoryState {
    fn next_version(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn key(
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        object_namespace: Option<&str>,
        name: &str,
    ) -> ObjectKey {
        let ns = if resource.namespaced {
            namespace.or(object_namespace).unwrap_or_default().to_string()
        } else {
            String::new()
        };
        (
            resource.group.clone(),
            resource.plural.clone(),
            ns,
            name.to_string(),
        )
    }

    /// Mutate a stored object in place without touching its generation.
    ///
    /// This is the equivalent of a status-subresource write: the resource
    /// version advances, `metadata.generation` does not.
    pub fn update_status<F>(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        name: &str,
        mutate: F,
    ) -> StoreResult<()>
    where
        F: FnOnce(&mut DynamicObject),
    {
        let key = Self::key(resource, namespace, None, name);
        let mut state = self.lock();
        let version = state.next_version();
        let object = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found(resource, name))?;
        mutate(object);
        object.metadata.resource_version = Some(version);
        Ok(())
    }

    /// Number of stored objects of one kind across all namespaces.
    pub fn count(&self, resource: &ResourceDescriptor) -> usize {
        self.lock()
            .objects
            .keys()
            .filter(|(group, plural, _, _)| *group == resource.group && *plural == resource.plural)
            .count()
    }

    pub fn contains(&self, resource: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> bool {
        self.lock()
            .objects
            .contains_key(&Self::key(resource, namespace, None, name))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<DynamicObject> {
        self.lock()
            .objects
            .get(&Self::key(resource, namespace, None, name))
            .cloned()
            .ok_or_else(|| StoreError::not_found(resource, name))
    }

    async fn list(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
    ) -> StoreResult<Vec<DynamicObject>> {
        let wanted_ns = namespace.filter(|_| resource.namespaced);
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((group, plural, ns, _), _)| {
                *group == resource.group
                    && *plural == resource.plural
                    && wanted_ns.is_none_or(|wanted| wanted == ns)
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> StoreResult<DynamicObject> {
        let name = object.name_any();
        let key = Self::key(resource, namespace, object.metadata.namespace.as_deref(), &name);
        let mut state = self.lock();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                resource: resource.to_string(),
                name,
            });
        }

        let mut stored = object.clone();
        stored.types = Some(resource.type_meta());
        stored.metadata.namespace = resource.namespaced.then(|| key.2.clone());
        stored.metadata.resource_version = Some(state.next_version());
        stored.metadata.generation = Some(1);
        stored.metadata.uid = Some(format!("uid-{}", state.last_version));
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> StoreResult<DynamicObject> {
        let name = object.name_any();
        let key = Self::key(resource, namespace, object.metadata.namespace.as_deref(), &name);
        let mut state = self.lock();
        let Some(live) = state.objects.get(&key) else {
            return Err(StoreError::not_found(resource, &name));
        };

        if let Some(expected) = &object.metadata.resource_version
            && live.metadata.resource_version.as_ref() != Some(expected)
        {
            return Err(StoreError::Conflict {
                resource: resource.to_string(),
                name,
                message: format!(
                    "resourceVersion {} is stale (live {})",
                    expected,
                    live.metadata.resource_version.as_deref().unwrap_or_default()
                ),
            });
        }

        let generation = live.metadata.generation.unwrap_or(1);
        let spec_changed = live.data.get("spec") != object.data.get("spec");
        let uid = live.metadata.uid.clone();

        let mut stored = object.clone();
        stored.types = Some(resource.type_meta());
        stored.metadata.namespace = resource.namespaced.then(|| key.2.clone());
        stored.metadata.resource_version = Some(state.next_version());
        stored.metadata.generation = Some(if spec_changed { generation + 1 } else { generation });
        stored.metadata.uid = uid;
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<()> {
        self.lock()
            .objects
            .remove(&Self::key(resource, namespace, None, name))
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(resource, name))
    }
}
