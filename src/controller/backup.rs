//! Snapshot backup and restore of the product's cluster state
//!
//! A snapshot captures, in this order:
//! - every CRD of the product API group (`crd-<name>`)
//! - every ConfigMap in the namespace except the job's own records and the
//!   ones the cluster maintains itself (`configmap-<name>`)
//! - every Deployment in the namespace (`deployment-<name>`)
//! - every instance of every product CRD (`cr-<kind>-<name>`)
//!
//! Each object is stored as base64-encoded YAML under its key in a single
//! backup record. The record's payload is capped; once an object would push it
//! over the cap, the rest of that category is skipped.
//!
//! Restore deletes and recreates every object it finds in the record. It is a
//! best-effort reconstruction, not a transaction: individual failures are
//! reported and the remaining objects are still restored. Deleting a CRD also
//! deletes its live instances, which is why instances are restored last.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::ResourceExt;
use kube::api::{DynamicObject, ObjectMeta};
use tracing::{info, warn};

use super::context::Context;
use super::error::{UpgradeError, UpgradeResult};
use super::outcome::BestEffort;
use super::wait::{poll_until, wait_for_crds_established};
use crate::crd::{API_GROUP, CrdInfo, discover_product_crds, list_instances};
use crate::resources::common::{
    BACKUP_ID_ANNOTATION, RECORD_KIND_BACKUP, backup_id_of, backup_record_name, is_backup_record,
    is_upgrade_record, record_labels,
};
use crate::resources::manifest::apply_object;
use crate::store::{ObjectStore, ResourceDescriptor, decode, delete_if_exists, encode, get_opt};

pub const CRD_PREFIX: &str = "crd-";
pub const CONFIG_MAP_PREFIX: &str = "configmap-";
pub const DEPLOYMENT_PREFIX: &str = "deployment-";
pub const CUSTOM_RESOURCE_PREFIX: &str = "cr-";

/// Size-bounded key to encoded-object mapping.
#[derive(Clone, Debug)]
pub struct Snapshot {
    entries: BTreeMap<String, String>,
    size: usize,
    limit: usize,
}

impl Snapshot {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            size: 0,
            limit,
        }
    }

    /// Add one category of entries, stopping at the first entry that would
    /// exceed the cap. Returns how many entries were added.
    pub fn add_category<I>(&mut self, category: &str, entries: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut added = 0;
        let mut skipped = 0;
        let mut full = false;
        for (key, value) in entries {
            let entry_size = key.len() + value.len();
            if full || self.size + entry_size > self.limit {
                full = true;
                skipped += 1;
                continue;
            }
            self.size += entry_size;
            self.entries.insert(key, value);
            added += 1;
        }
        if skipped > 0 {
            warn!(
                category = %category,
                skipped,
                size = self.size,
                limit = self.limit,
                "Backup size limit reached, skipping the rest of the category"
            );
        }
        added
    }

    /// Sum of key and value lengths.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }
}

/// YAML, then base64.
pub fn encode_object(object: &DynamicObject) -> UpgradeResult<String> {
    let yaml =
        serde_yaml::to_string(object).map_err(|e| UpgradeError::BackupEncoding(e.to_string()))?;
    Ok(STANDARD.encode(yaml))
}

pub fn decode_object(value: &str) -> UpgradeResult<DynamicObject> {
    let yaml = STANDARD
        .decode(value)
        .map_err(|e| UpgradeError::BackupEncoding(e.to_string()))?;
    serde_yaml::from_slice(&yaml).map_err(|e| UpgradeError::BackupEncoding(e.to_string()))
}

/// ConfigMaps published into every namespace by the control plane.
const CLUSTER_MANAGED_CONFIG_MAPS: [&str; 1] = ["kube-root-ca.crt"];

/// Owned or control-plane published ConfigMaps are rebuilt by their owners.
fn is_cluster_managed(cm: &ConfigMap) -> bool {
    let owned = cm
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| !refs.is_empty());
    owned || CLUSTER_MANAGED_CONFIG_MAPS.contains(&cm.name_any().as_str())
}

/// Objects read back from a list carry no type metadata; restore needs it.
fn with_types(mut object: DynamicObject, resource: &ResourceDescriptor) -> DynamicObject {
    if object.types.is_none() {
        object.types = Some(resource.type_meta());
    }
    object
}

fn entry(
    prefix: &str,
    object: DynamicObject,
    resource: &ResourceDescriptor,
) -> UpgradeResult<(String, String)> {
    let key = format!("{prefix}{}", object.name_any());
    Ok((key, encode_object(&with_types(object, resource))?))
}

/// Snapshot the product's state into the backup record for `backup_id`.
pub async fn backup_resources(ctx: &Context, backup_id: &str) -> UpgradeResult<Snapshot> {
    let store = ctx.store();
    let ns = ctx.namespace();
    let mut snapshot = Snapshot::new(ctx.config.backup_size_limit);
    info!(backup_id = %backup_id, "Backing up resources");

    let crd_resource = ResourceDescriptor::custom_resource_definition();
    let mut crds = Vec::new();
    for object in store.list(&crd_resource, None).await? {
        let crd: CustomResourceDefinition = decode(&object)?;
        if crd.spec.group == API_GROUP {
            crds.push(entry(CRD_PREFIX, object, &crd_resource)?);
        }
    }
    snapshot.add_category("crds", crds);

    let cm_resource = ResourceDescriptor::config_map();
    let mut config_maps = Vec::new();
    for object in store.list(&cm_resource, Some(ns)).await? {
        let cm: ConfigMap = decode(&object)?;
        if !is_upgrade_record(&cm) && !is_cluster_managed(&cm) {
            config_maps.push(entry(CONFIG_MAP_PREFIX, object, &cm_resource)?);
        }
    }
    snapshot.add_category("configmaps", config_maps);

    let deploy_resource = ResourceDescriptor::deployment();
    let deployments = store
        .list(&deploy_resource, Some(ns))
        .await?
        .into_iter()
        .map(|object| entry(DEPLOYMENT_PREFIX, object, &deploy_resource))
        .collect::<UpgradeResult<Vec<_>>>()?;
    snapshot.add_category("deployments", deployments);

    let mut custom_resources = Vec::new();
    for info in discover_product_crds(store).await? {
        for object in list_instances(store, &info, ns).await? {
            let prefix = format!("{CUSTOM_RESOURCE_PREFIX}{}-", info.resource.kind);
            custom_resources.push(entry(&prefix, object, &info.resource)?);
        }
    }
    snapshot.add_category("custom resources", custom_resources);

    write_backup_record(store, ns, backup_id, &snapshot).await?;
    info!(
        backup_id = %backup_id,
        entries = snapshot.len(),
        size = snapshot.size(),
        "Backup completed"
    );
    Ok(snapshot)
}

/// Delete-then-create, so keys from an earlier attempt never linger.
async fn write_backup_record(
    store: &dyn ObjectStore,
    namespace: &str,
    backup_id: &str,
    snapshot: &Snapshot,
) -> UpgradeResult<()> {
    let resource = ResourceDescriptor::config_map();
    let name = backup_record_name(backup_id);
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(record_labels(RECORD_KIND_BACKUP)),
            annotations: Some(BTreeMap::from([(
                BACKUP_ID_ANNOTATION.to_string(),
                backup_id.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(snapshot.entries().clone()),
        ..Default::default()
    };

    delete_if_exists(store, &resource, Some(namespace), &name).await?;
    store
        .create(&resource, Some(namespace), &encode(&cm)?)
        .await?;
    Ok(())
}

/// Strip server-populated metadata so the object can be created again.
fn sanitize(mut object: DynamicObject) -> DynamicObject {
    let meta = &mut object.metadata;
    meta.resource_version = None;
    meta.uid = None;
    meta.creation_timestamp = None;
    meta.managed_fields = None;
    meta.generation = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    object
}

#[derive(Default)]
struct Decoded {
    crds: Vec<DynamicObject>,
    config_maps: Vec<DynamicObject>,
    deployments: Vec<DynamicObject>,
    custom_resources: Vec<DynamicObject>,
}

fn decode_entries(data: &BTreeMap<String, String>, report: &mut BestEffort) -> Decoded {
    let mut decoded = Decoded::default();
    for (key, value) in data {
        let Some(object) = report.absorb(format!("decode {key}"), decode_object(value)) else {
            continue;
        };
        if key.starts_with(CRD_PREFIX) {
            decoded.crds.push(object);
        } else if key.starts_with(CONFIG_MAP_PREFIX) {
            decoded.config_maps.push(object);
        } else if key.starts_with(DEPLOYMENT_PREFIX) {
            decoded.deployments.push(object);
        } else if key.starts_with(CUSTOM_RESOURCE_PREFIX) {
            decoded.custom_resources.push(object);
        } else {
            report.fail(format!("restore {key}"), "unrecognised backup key");
        }
    }
    decoded
}

/// Restore every object in the backup record for `backup_id`.
///
/// Fails only when the record cannot be read; everything after that is
/// best-effort and reported.
pub async fn restore_resources(ctx: &Context, backup_id: &str) -> UpgradeResult<BestEffort> {
    let store = ctx.store();
    let ns = ctx.namespace();
    let name = backup_record_name(backup_id);
    let Some(record) = get_opt(store, &ResourceDescriptor::config_map(), Some(ns), &name).await?
    else {
        return Err(UpgradeError::BackupNotFound(backup_id.to_string()));
    };
    let cm: ConfigMap = decode(&record)?;
    let data = cm.data.unwrap_or_default();
    info!(backup_id = %backup_id, entries = data.len(), "Restoring resources from backup");

    let mut report = BestEffort::new();
    let decoded = decode_entries(&data, &mut report);

    let crd_resource = ResourceDescriptor::custom_resource_definition();
    let mut crd_names = Vec::new();
    for object in decoded.crds {
        crd_names.push(object.name_any());
        restore_object(ctx, &crd_resource, None, object, &mut report).await;
    }

    let cm_resource = ResourceDescriptor::config_map();
    for object in decoded.config_maps {
        restore_object(ctx, &cm_resource, Some(ns), object, &mut report).await;
    }

    let deploy_resource = ResourceDescriptor::deployment();
    for object in decoded.deployments {
        restore_object(ctx, &deploy_resource, Some(ns), object, &mut report).await;
    }

    if !decoded.custom_resources.is_empty() {
        report.absorb(
            "wait for restored CRDs",
            wait_for_crds_established(ctx, &crd_names).await,
        );
        let kinds = report
            .absorb("discover product CRDs", discover_product_crds(store).await)
            .unwrap_or_default();
        for object in decoded.custom_resources {
            match descriptor_for(&kinds, &object) {
                Some(resource) => {
                    let scope = resource.namespaced.then_some(ns);
                    restore_object(ctx, resource, scope, object, &mut report).await;
                }
                None => report.fail(
                    format!("restore {}", object.name_any()),
                    "no installed CRD matches the object's kind",
                ),
            }
        }
    }

    if report.is_clean() {
        info!(backup_id = %backup_id, "Restore completed");
    } else {
        warn!(backup_id = %backup_id, failures = %report, "Restore completed with failures");
    }
    Ok(report)
}

fn descriptor_for<'a>(kinds: &'a [CrdInfo], object: &DynamicObject) -> Option<&'a ResourceDescriptor> {
    let types = object.types.as_ref()?;
    let group = types
        .api_version
        .split_once('/')
        .map(|(group, _)| group)
        .unwrap_or_default();
    kinds
        .iter()
        .map(|info| &info.resource)
        .find(|r| r.kind == types.kind && r.group == group)
}

/// Delete the live object, wait for it to disappear, then create it again.
///
/// Some objects are recreated by the cluster as soon as they are deleted. The
/// wait ends once the deleted incarnation is gone, and the backed-up content is
/// then applied over whatever is live.
async fn restore_object(
    ctx: &Context,
    resource: &ResourceDescriptor,
    namespace: Option<&str>,
    object: DynamicObject,
    report: &mut BestEffort,
) {
    let name = object.name_any();
    let mut object = sanitize(object);
    if resource.namespaced {
        object.metadata.namespace = namespace.map(str::to_string);
    }
    let operation = format!("restore {resource} {name}");
    let store = ctx.store();

    let Some(live) = report.absorb(
        operation.clone(),
        get_opt(store, resource, namespace, &name).await,
    ) else {
        return;
    };
    let deleted_uid = live.and_then(|live| live.metadata.uid);

    if report
        .absorb(
            operation.clone(),
            delete_if_exists(store, resource, namespace, &name).await,
        )
        .is_none()
    {
        return;
    }

    let name_ref = name.as_str();
    let deleted_uid = deleted_uid.as_deref();
    let waited = poll_until(
        ctx,
        &format!("{resource} {name} to be deleted"),
        ctx.config.deletion_timeout,
        ctx.config.poll_interval,
        move || async move {
            let current = get_opt(store, resource, namespace, name_ref).await?;
            Ok(current.is_none_or(|o| o.metadata.uid.as_deref() != deleted_uid))
        },
    )
    .await;
    if report.absorb(operation.clone(), waited).is_none() {
        return;
    }

    let retry = &ctx.config.conflict_retry;
    let applied = apply_object(store, retry, resource, namespace, &object).await;
    if report.absorb(operation, applied).is_some() {
        info!(resource = %resource, name = %name, "Restored");
    }
}

/// Delete the backup record of one attempt.
pub async fn cleanup_backup_config_maps(ctx: &Context, backup_id: &str) -> BestEffort {
    let mut report = BestEffort::new();
    let name = backup_record_name(backup_id);
    let deleted = delete_if_exists(
        ctx.store(),
        &ResourceDescriptor::config_map(),
        Some(ctx.namespace()),
        &name,
    )
    .await;
    if let Some(true) = report.absorb(format!("delete backup {backup_id}"), deleted) {
        info!(backup_id = %backup_id, "Deleted backup record");
    }
    report
}

/// Delete every backup record older than `current_backup_id`.
pub async fn cleanup_all_old_backups(ctx: &Context, current_backup_id: &str) -> BestEffort {
    let mut report = BestEffort::new();
    let resource = ResourceDescriptor::config_map();
    let ns = ctx.namespace();
    let Some(objects) = report.absorb("list backups", ctx.store().list(&resource, Some(ns)).await)
    else {
        return report;
    };

    for object in objects {
        let Some(cm) = report.absorb("decode backup record", decode::<ConfigMap>(&object)) else {
            continue;
        };
        if !is_backup_record(&cm) {
            continue;
        }
        let Some(id) = backup_id_of(&cm) else {
            continue;
        };
        if id.as_str() >= current_backup_id {
            continue;
        }
        let name = cm.name_any();
        let deleted = delete_if_exists(ctx.store(), &resource, Some(ns), &name).await;
        if let Some(true) = report.absorb(format!("delete backup {id}"), deleted) {
            info!(backup_id = %id, "Deleted old backup record");
        }
    }
    report
}
