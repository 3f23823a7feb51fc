//! A cluster whose controllers always do their job
//!
//! Wraps [`MemoryStore`] and reacts to writes the way the real control plane
//! would: deployments report every replica ready on the generation just
//! written, CRDs report `Established`. Deployments can be marked stuck, list
//! calls can be made to fail, objects can be republished right after they are
//! deleted, and every progress record write is captured.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use kube::ResourceExt;
use kube::api::DynamicObject;
use serde_json::{Value, json};

use vjailbreak_upgrade::UpgradeStatus;
use vjailbreak_upgrade::controller::UpgradeProgress;
use vjailbreak_upgrade::resources::common::PROGRESS_KEY;
use vjailbreak_upgrade::store::{
    MemoryStore, ObjectStore, ResourceDescriptor, StoreError, StoreResult,
};

/// Deployment names are unique across the test namespace, so stuck
/// deployments are tracked by name only.
#[derive(Default)]
pub struct SimulatedCluster {
    inner: MemoryStore,
    mutations: AtomicUsize,
    stuck: Mutex<BTreeSet<String>>,
    stall_trigger: Mutex<Option<(UpgradeStatus, String, String)>>,
    failing_lists: Mutex<BTreeSet<String>>,
    republished: Mutex<BTreeSet<(String, String)>>,
    history: Mutex<Vec<UpgradeProgress>>,
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying store, for assertions that bypass the hooks.
    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    /// Create, replace and delete calls seen so far, successful or not.
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Make `name` stop reporting ready pods, now and after every later write.
    pub fn stall_deployment(&self, namespace: &str, name: &str) {
        self.stuck.lock().unwrap().insert(name.to_string());
        let _ = self.inner.update_status(
            &ResourceDescriptor::deployment(),
            Some(namespace),
            name,
            |object| report_rollout(object, false),
        );
    }

    /// Stall `name` as soon as the progress record reaches `status`.
    pub fn stall_when(&self, status: UpgradeStatus, namespace: &str, name: &str) {
        *self.stall_trigger.lock().unwrap() =
            Some((status, namespace.to_string(), name.to_string()));
    }

    /// Fail every list of the resource with this plural.
    pub fn fail_lists(&self, plural: &str) {
        self.failing_lists.lock().unwrap().insert(plural.to_string());
    }

    /// Recreate the object right after every delete, like a publisher
    /// controller would.
    pub fn republish_on_delete(&self, plural: &str, name: &str) {
        self.republished
            .lock()
            .unwrap()
            .insert((plural.to_string(), name.to_string()));
    }

    /// Every progress snapshot written, in order.
    pub fn progress_history(&self) -> Vec<UpgradeProgress> {
        self.history.lock().unwrap().clone()
    }

    pub fn statuses_seen(&self) -> Vec<UpgradeStatus> {
        let mut statuses: Vec<UpgradeStatus> = Vec::new();
        for progress in self.progress_history() {
            if statuses.last() != Some(&progress.status) {
                statuses.push(progress.status);
            }
        }
        statuses
    }

    fn is_stuck(&self, name: &str) -> bool {
        self.stuck.lock().unwrap().contains(name)
    }

    fn after_write(&self, resource: &ResourceDescriptor, stored: &DynamicObject) {
        let name = stored.name_any();
        let namespace = stored.metadata.namespace.as_deref();
        match resource.kind.as_str() {
            "Deployment" => {
                let ready = !self.is_stuck(&name);
                let _ = self
                    .inner
                    .update_status(resource, namespace, &name, |object| {
                        report_rollout(object, ready)
                    });
            }
            "CustomResourceDefinition" => {
                let _ = self
                    .inner
                    .update_status(resource, None, &name, report_established);
            }
            "ConfigMap" => self.observe_progress(stored),
            _ => {}
        }
    }

    fn observe_progress(&self, object: &DynamicObject) {
        let Some(raw) = object.data["data"][PROGRESS_KEY].as_str() else {
            return;
        };
        let Ok(progress) = serde_json::from_str::<UpgradeProgress>(raw) else {
            return;
        };
        let trigger = self.stall_trigger.lock().unwrap().clone();
        if let Some((status, namespace, name)) = trigger
            && progress.status == status
        {
            self.stall_deployment(&namespace, &name);
        }
        self.history.lock().unwrap().push(progress);
    }
}

/// Status a deployment controller reports once it has acted on the latest spec.
fn report_rollout(object: &mut DynamicObject, ready: bool) {
    let replicas = object.data["spec"]["replicas"].as_i64().unwrap_or(1);
    let generation = object.metadata.generation.unwrap_or(1);
    let (ready_replicas, available) = if ready {
        (replicas, "True")
    } else {
        (0, "False")
    };
    object.data["status"] = json!({
        "observedGeneration": generation,
        "replicas": replicas,
        "updatedReplicas": replicas,
        "readyReplicas": ready_replicas,
        "availableReplicas": ready_replicas,
        "conditions": [{"type": "Available", "status": available}],
    });
}

fn report_established(object: &mut DynamicObject) {
    let names = object.data["spec"]["names"].clone();
    object.data["status"] = json!({
        "acceptedNames": names,
        "conditions": [{"type": "Established", "status": "True"}],
    });
}

fn injected_failure() -> StoreError {
    let cause = serde_json::from_str::<Value>("{").unwrap_err();
    StoreError::Serialization(cause)
}

#[async_trait]
impl ObjectStore for SimulatedCluster {
    async fn get(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<DynamicObject> {
        self.inner.get(resource, namespace, name).await
    }

    async fn list(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
    ) -> StoreResult<Vec<DynamicObject>> {
        if self.failing_lists.lock().unwrap().contains(&resource.plural) {
            return Err(injected_failure());
        }
        self.inner.list(resource, namespace).await
    }

    async fn create(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> StoreResult<DynamicObject> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let created = self.inner.create(resource, namespace, object).await?;
        self.after_write(resource, &created);
        Ok(created)
    }

    async fn replace(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> StoreResult<DynamicObject> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let replaced = self.inner.replace(resource, namespace, object).await?;
        self.after_write(resource, &replaced);
        Ok(replaced)
    }

    async fn delete(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<()> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let republish = self
            .republished
            .lock()
            .unwrap()
            .contains(&(resource.plural.clone(), name.to_string()));
        if !republish {
            return self.inner.delete(resource, namespace, name).await;
        }
        let mut live = self.inner.get(resource, namespace, name).await?;
        self.inner.delete(resource, namespace, name).await?;
        live.metadata.resource_version = None;
        live.metadata.uid = None;
        self.inner.create(resource, namespace, &live).await?;
        Ok(())
    }
}
