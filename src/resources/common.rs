//! Names, labels and identifiers shared by the upgrade records
//!
//! The job persists two kinds of records as ConfigMaps in the operating
//! namespace: the progress record and one backup record per attempt. Both
//! carry the record label so they can be told apart from product ConfigMaps
//! and excluded from snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "vjailbreak-upgrade";

/// Label marking a ConfigMap as an upgrade record; value is the record kind
pub const RECORD_LABEL: &str = "vjailbreak.k8s.pf9.io/upgrade-record";

/// Record kind of the progress record
pub const RECORD_KIND_PROGRESS: &str = "progress";

/// Record kind of backup records
pub const RECORD_KIND_BACKUP: &str = "backup";

/// Annotation holding the exact (case-preserved) backup ID
pub const BACKUP_ID_ANNOTATION: &str = "vjailbreak.k8s.pf9.io/backup-id";

/// Data key of the progress record
pub const PROGRESS_KEY: &str = "progress";

const PROGRESS_PREFIX: &str = "vjailbreak-upgrade-progress";
const BACKUP_PREFIX: &str = "vjailbreak-upgrade-backup";
const MAX_NAME_LEN: usize = 253;

/// Layout of backup IDs: sortable UTC timestamps
pub const BACKUP_ID_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Name of the progress record, optionally scoped to a job.
pub fn progress_record_name(job_id: Option<&str>) -> String {
    match job_id.map(sanitize_name).filter(|id| !id.is_empty()) {
        Some(id) => truncate(format!("{PROGRESS_PREFIX}-{id}")),
        None => PROGRESS_PREFIX.to_string(),
    }
}

/// Name of the backup record for one attempt.
pub fn backup_record_name(backup_id: &str) -> String {
    truncate(format!("{BACKUP_PREFIX}-{}", sanitize_name(backup_id)))
}

pub fn new_backup_id(now: DateTime<Utc>) -> String {
    now.format(BACKUP_ID_FORMAT).to_string()
}

pub fn record_labels(kind: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (RECORD_LABEL.to_string(), kind.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
    ])
}

/// True for ConfigMaps the job itself owns (progress or backup records).
pub fn is_upgrade_record(cm: &ConfigMap) -> bool {
    cm.metadata
        .labels
        .as_ref()
        .is_some_and(|labels| labels.contains_key(RECORD_LABEL))
        || cm
            .metadata
            .name
            .as_deref()
            .is_some_and(|name| name.starts_with(PROGRESS_PREFIX) || name.starts_with(BACKUP_PREFIX))
}

pub fn is_backup_record(cm: &ConfigMap) -> bool {
    cm.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(RECORD_LABEL))
        .is_some_and(|kind| kind == RECORD_KIND_BACKUP)
}

/// Backup ID of a backup record, preferring the annotation over the name.
pub fn backup_id_of(cm: &ConfigMap) -> Option<String> {
    if let Some(id) = cm
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(BACKUP_ID_ANNOTATION))
    {
        return Some(id.clone());
    }
    cm.metadata
        .name
        .as_deref()
        .and_then(|name| name.strip_prefix(&format!("{BACKUP_PREFIX}-")))
        .map(str::to_uppercase)
}

/// Lowercase and replace anything outside `[a-z0-9-.]` with `-`.
fn sanitize_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches(|c| c == '-' || c == '.')
        .to_string()
}

fn truncate(mut name: String) -> String {
    if name.len() > MAX_NAME_LEN {
        name.truncate(MAX_NAME_LEN);
        while name.ends_with('-') || name.ends_with('.') {
            name.pop();
        }
    }
    name
}
