//! The version-config and settings ConfigMaps
//!
//! Both are convenience state read by the UI. Updating them is never
//! required for the product to run, so callers treat failures here as soft.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use tracing::{debug, info, warn};

use super::context::Context;
use super::error::{UpgradeError, UpgradeResult};
use crate::config::{SETTINGS_CONFIG_NAME, UNKNOWN_VERSION, VERSION_CONFIG_NAME, VERSION_KEY};
use crate::resources::manifest::{apply_object, parse_single, substitute_tag};
use crate::store::{ResourceDescriptor, decode, encode, get_opt};

async fn read_config_map(ctx: &Context, name: &str) -> UpgradeResult<Option<ConfigMap>> {
    let object = get_opt(
        ctx.store(),
        &ResourceDescriptor::config_map(),
        Some(ctx.namespace()),
        name,
    )
    .await?;
    Ok(object.map(|o| decode(&o)).transpose()?)
}

async fn write_config_map(ctx: &Context, cm: &ConfigMap) -> UpgradeResult<()> {
    apply_object(
        ctx.store(),
        &ctx.config.conflict_retry,
        &ResourceDescriptor::config_map(),
        Some(ctx.namespace()),
        &encode(cm)?,
    )
    .await?;
    Ok(())
}

/// Fetch a ConfigMap template for `tag` and substitute the tag into it.
async fn fetch_config_map(ctx: &Context, tag: &str, path: &str) -> UpgradeResult<ConfigMap> {
    let template = ctx.manifests.fetch(tag, path).await?;
    let object = parse_single(&substitute_tag(&template, tag), "ConfigMap")
        .map_err(|e| UpgradeError::manifest(path, e))?;
    let mut cm: ConfigMap = decode(&object)?;
    cm.metadata.namespace = Some(ctx.namespace().to_string());
    Ok(cm)
}

/// The installed version, or `unknown` when it cannot be read.
pub async fn read_current_version(ctx: &Context) -> String {
    match read_config_map(ctx, VERSION_CONFIG_NAME).await {
        Ok(Some(cm)) => cm
            .data
            .and_then(|mut data| data.remove(VERSION_KEY))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
        Ok(None) => {
            debug!("No version-config found");
            UNKNOWN_VERSION.to_string()
        }
        Err(e) => {
            warn!(error = %e, "Could not read the current version");
            UNKNOWN_VERSION.to_string()
        }
    }
}

/// Overwrite version-config with the release's template for `tag`.
pub async fn update_version_config(ctx: &Context, tag: &str) -> UpgradeResult<()> {
    let cm = fetch_config_map(ctx, tag, &ctx.config.manifests.version_config).await?;
    write_config_map(ctx, &cm).await?;
    info!(version = %tag, "Updated version-config");
    Ok(())
}

/// Add settings keys introduced by `tag`, keeping every value already set.
pub async fn update_settings(ctx: &Context, tag: &str) -> UpgradeResult<()> {
    let release = fetch_config_map(ctx, tag, &ctx.config.manifests.settings).await?;
    let Some(mut live) = read_config_map(ctx, SETTINGS_CONFIG_NAME).await? else {
        write_config_map(ctx, &release).await?;
        info!(version = %tag, "Created settings");
        return Ok(());
    };

    let data = live.data.get_or_insert_with(BTreeMap::new);
    let mut added = 0;
    for (key, value) in release.data.unwrap_or_default() {
        if !data.contains_key(&key) {
            data.insert(key, value);
            added += 1;
        }
    }
    if added == 0 {
        debug!("Settings already contain every release key");
        return Ok(());
    }
    write_config_map(ctx, &live).await?;
    info!(version = %tag, added, "Merged new settings keys");
    Ok(())
}

/// Write `version` into version-config without fetching anything.
pub async fn set_version(ctx: &Context, version: &str) -> UpgradeResult<()> {
    let mut cm = read_config_map(ctx, VERSION_CONFIG_NAME)
        .await?
        .unwrap_or_else(|| ConfigMap {
            metadata: ObjectMeta {
                name: Some(VERSION_CONFIG_NAME.to_string()),
                namespace: Some(ctx.namespace().to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
    cm.data
        .get_or_insert_with(BTreeMap::new)
        .insert(VERSION_KEY.to_string(), version.to_string());
    write_config_map(ctx, &cm).await
}
