//! Release manifests: fetching, parsing and applying
//!
//! Manifests come from the tagged release artifact store as YAML. CRD bundles
//! are multi-document streams, deployment manifests are single documents and
//! ConfigMap templates carry a `${TAG}` placeholder substituted before parsing.

use async_trait::async_trait;
use kube::api::DynamicObject;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::store::{ConflictRetry, ObjectStore, ResourceDescriptor, StoreResult, retry_on_conflict};

/// Placeholder replaced by the release tag in URLs and ConfigMap templates
pub const TAG_PLACEHOLDER: &str = "${TAG}";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Failed to fetch {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to fetch {url}: HTTP {status}")]
    Status { url: String, status: u16 },
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Manifest document is not a Kubernetes object: {0}")]
    Object(#[from] serde_json::Error),

    #[error("Manifest contains no documents")]
    Empty,

    #[error("Expected a {expected} manifest, found {found}")]
    UnexpectedKind { expected: String, found: String },

    #[error("Manifest object has no name")]
    MissingName,
}

/// Source of versioned release manifests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Raw bytes of `path` in release `tag`. No retries.
    async fn fetch(&self, tag: &str, path: &str) -> Result<Vec<u8>, FetchError>;
}

/// Fetches manifests over HTTP from a base URL templated with `${TAG}`.
#[derive(Clone)]
pub struct HttpManifestSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpManifestSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn url_for(&self, tag: &str, path: &str) -> String {
        let base = if self.base_url.contains(TAG_PLACEHOLDER) {
            self.base_url.replace(TAG_PLACEHOLDER, tag)
        } else {
            format!("{}/{}", self.base_url.trim_end_matches('/'), tag)
        };
        format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch(&self, tag: &str, path: &str) -> Result<Vec<u8>, FetchError> {
        let url = self.url_for(tag, path);
        debug!(url = %url, "Fetching manifest");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| FetchError::Http {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| FetchError::Http {
                url: url.clone(),
                source,
            })?;
        Ok(body.to_vec())
    }
}

/// Parse a `---` delimited YAML stream, skipping empty documents.
pub fn parse_documents(bytes: &[u8]) -> Result<Vec<DynamicObject>, ManifestError> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_slice(bytes) {
        let value = serde_json::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        objects.push(serde_json::from_value(value)?);
    }
    Ok(objects)
}

/// Parse a manifest that must hold exactly one object of `expected_kind`.
pub fn parse_single(bytes: &[u8], expected_kind: &str) -> Result<DynamicObject, ManifestError> {
    let object = parse_documents(bytes)?
        .into_iter()
        .next()
        .ok_or(ManifestError::Empty)?;
    ensure_kind(&object, expected_kind)?;
    if object.metadata.name.as_deref().is_none_or(str::is_empty) {
        return Err(ManifestError::MissingName);
    }
    Ok(object)
}

pub fn ensure_kind(object: &DynamicObject, expected_kind: &str) -> Result<(), ManifestError> {
    let found = object.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default();
    if found != expected_kind {
        return Err(ManifestError::UnexpectedKind {
            expected: expected_kind.to_string(),
            found: found.to_string(),
        });
    }
    Ok(())
}

/// Replace every `${TAG}` in a template with `tag`.
pub fn substitute_tag(template: &[u8], tag: &str) -> Vec<u8> {
    String::from_utf8_lossy(template)
        .replace(TAG_PLACEHOLDER, tag)
        .into_bytes()
}

/// Create `object` if absent, otherwise replace it carrying the live
/// resourceVersion. Conflicts are retried.
pub async fn apply_object(
    store: &dyn ObjectStore,
    retry: &ConflictRetry,
    resource: &ResourceDescriptor,
    namespace: Option<&str>,
    object: &DynamicObject,
) -> StoreResult<DynamicObject> {
    let name = object.metadata.name.as_deref().unwrap_or_default();
    let applied = retry_on_conflict(retry, "apply", move || async move {
        match store.get(resource, namespace, name).await {
            Ok(live) => {
                let mut desired = object.clone();
                desired.metadata.resource_version = live.metadata.resource_version;
                store.replace(resource, namespace, &desired).await
            }
            Err(e) if e.is_not_found() => store.create(resource, namespace, object).await,
            Err(e) => Err(e),
        }
    })
    .await?;
    debug!(resource = %resource, name = %name, "Applied object");
    Ok(applied)
}
