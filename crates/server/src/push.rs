//! Manifest-list publication.
//!
//! Assembly computes *what* to bind (see [`crate::assemble`]); pushing the
//! resulting list is behind [`ManifestPusher`] so the registry protocol
//! stays a library concern. [`RegistryClient`] implements the minimal
//! Docker Registry v2 flow: resolve each per-arch manifest's digest and
//! size, then PUT the list under the multi-arch reference.

use async_trait::async_trait;
use kiln_manifest::RegistryCredential;
use kiln_manifest::reference::split_reference;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

const MANIFEST_LIST_TYPE: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
const MANIFEST_V2_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
const OCI_MANIFEST_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

#[derive(Debug, Error)]
pub enum PushError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry returned {status} for {url}")]
    Status { status: StatusCode, url: String },

    #[error("no digest header on manifest response for {0}")]
    MissingDigest(String),
}

/// One per-arch image bound into a manifest list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Tag reference the worker pushed to.
    pub image: String,
    pub os: String,
    pub arch: String,
    pub variant: Option<String>,
}

/// Binds per-arch images under a single reference.
#[async_trait]
pub trait ManifestPusher: Send + Sync {
    async fn push_list(
        &self,
        destination: &str,
        entries: &[ManifestEntry],
        credentials: &[RegistryCredential],
    ) -> Result<(), PushError>;
}

/// Docker Registry v2 client backed by reqwest.
#[derive(Debug, Default)]
pub struct RegistryClient {
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolve_manifest(
        &self,
        image: &str,
        credentials: &[RegistryCredential],
    ) -> Result<serde_json::Value, PushError> {
        let (base, tag) = split_reference(image);
        let (host, repository) = split_registry(base);
        let url = format!("https://{host}/v2/{repository}/manifests/{}", tag.unwrap_or("latest"));

        let mut request = self
            .http
            .get(&url)
            .header(ACCEPT, format!("{MANIFEST_V2_TYPE}, {OCI_MANIFEST_TYPE}"));
        if let Some(credential) = credential_for(credentials, &host) {
            request = request.basic_auth(&credential.username, Some(&credential.password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(PushError::Status {
                status: response.status(),
                url,
            });
        }

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(MANIFEST_V2_TYPE)
            .to_string();
        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| PushError::MissingDigest(image.to_string()))?;
        let size = response.bytes().await?.len();

        debug!(image, %digest, size, "resolved per-arch manifest");
        Ok(json!({
            "mediaType": media_type,
            "size": size,
            "digest": digest,
        }))
    }
}

#[async_trait]
impl ManifestPusher for RegistryClient {
    async fn push_list(
        &self,
        destination: &str,
        entries: &[ManifestEntry],
        credentials: &[RegistryCredential],
    ) -> Result<(), PushError> {
        let mut manifests = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut descriptor = self.resolve_manifest(&entry.image, credentials).await?;
            let mut platform = json!({
                "architecture": entry.arch,
                "os": entry.os,
            });
            if let Some(variant) = &entry.variant {
                platform["variant"] = json!(variant);
            }
            descriptor["platform"] = platform;
            manifests.push(descriptor);
        }

        let list = json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_LIST_TYPE,
            "manifests": manifests,
        });

        let (base, tag) = split_reference(destination);
        let (host, repository) = split_registry(base);
        let url = format!("https://{host}/v2/{repository}/manifests/{}", tag.unwrap_or("latest"));

        let mut request = self
            .http
            .put(&url)
            .header(CONTENT_TYPE, MANIFEST_LIST_TYPE)
            .body(list.to_string());
        if let Some(credential) = credential_for(credentials, &host) {
            request = request.basic_auth(&credential.username, Some(&credential.password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(PushError::Status {
                status: response.status(),
                url,
            });
        }
        info!(destination, entries = entries.len(), "manifest list pushed");
        Ok(())
    }
}

/// Split `host/path` into registry host and repository path. A first
/// segment with a dot, a port, or `localhost` is a registry host; anything
/// else defaults to Docker Hub.
fn split_registry(base: &str) -> (String, String) {
    if let Some((head, rest)) = base.split_once('/')
        && (head.contains('.') || head.contains(':') || head == "localhost")
    {
        return (head.to_string(), rest.to_string());
    }
    let repository = if base.contains('/') {
        base.to_string()
    } else {
        format!("library/{base}")
    };
    ("registry-1.docker.io".to_string(), repository)
}

fn credential_for<'a>(
    credentials: &'a [RegistryCredential],
    host: &str,
) -> Option<&'a RegistryCredential> {
    credentials.iter().find(|c| c.registry == host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_hosts_split() {
        assert_eq!(
            split_registry("ghcr.io/org/app"),
            ("ghcr.io".to_string(), "org/app".to_string())
        );
        assert_eq!(
            split_registry("localhost:5000/app"),
            ("localhost:5000".to_string(), "app".to_string())
        );
        assert_eq!(
            split_registry("org/app"),
            ("registry-1.docker.io".to_string(), "org/app".to_string())
        );
        assert_eq!(
            split_registry("app"),
            ("registry-1.docker.io".to_string(), "library/app".to_string())
        );
    }
}
