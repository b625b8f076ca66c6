// SPDX-License-Identifier: Apache-2.0

//! Registry client: resolves references and fetches manifests and blobs over
//! the OCI distribution V2 HTTP API. The trait is the injection seam; the
//! default implementation speaks anonymous bearer-token auth and classifies
//! HTTP failures into the retryable/terminal taxonomy. Retries happen at the
//! call sites (see `retry`), not here.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::{header, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::RegistryError;
use crate::image::ImageReference;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

/// An image manifest, reduced to the fields the verifier consumes.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ImageManifest {
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Resolve the reference to its manifest digest (HEAD-equivalent).
    async fn head_digest(&self, reference: &ImageReference) -> Result<String, RegistryError>;

    async fn pull_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<ImageManifest, RegistryError>;

    async fn pull_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<Vec<u8>, RegistryError>;

    /// Fetch the image config blob referenced by the manifest.
    async fn pull_config(&self, reference: &ImageReference) -> Result<Vec<u8>, RegistryError> {
        let manifest = self.pull_manifest(reference).await?;
        if manifest.config.digest.is_empty() {
            return Err(RegistryError::Other(format!(
                "manifest for {reference} has no config descriptor"
            )));
        }
        self.pull_blob(reference, &manifest.config.digest).await
    }
}

/// Default HTTP-backed client.
pub struct OciRegistryClient {
    http: reqwest::Client,
    // bearer tokens keyed by repository
    tokens: Mutex<HashMap<String, String>>,
}

impl OciRegistryClient {
    /// Build a client, optionally trusting one extra root CA bundle (PEM) in
    /// addition to the platform roots.
    pub fn new(extra_root_ca: Option<&Path>) -> Result<Self, String> {
        let mut builder = reqwest::Client::builder().timeout(std::time::Duration::from_secs(30));
        if let Some(path) = extra_root_ca {
            let pem = std::fs::read(path)
                .map_err(|e| format!("unable to read root CA bundle {}: {e}", path.display()))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| format!("invalid root CA bundle {}: {e}", path.display()))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| format!("unable to build HTTP client: {e}"))?;
        Ok(OciRegistryClient {
            http,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn manifest_url(&self, reference: &ImageReference) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme_for(reference.registry()),
            reference.registry(),
            reference.path(),
            reference.identifier()
        )
    }

    fn blob_url(&self, reference: &ImageReference, digest: &str) -> String {
        format!(
            "{}://{}/v2/{}/blobs/{}",
            scheme_for(reference.registry()),
            reference.registry(),
            reference.path(),
            digest
        )
    }

    async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        accept: &str,
        reference: &ImageReference,
    ) -> Result<Response, RegistryError> {
        let token = self
            .tokens
            .lock()
            .unwrap()
            .get(&reference.repository)
            .cloned();

        let mut request = self
            .http
            .request(method.clone(), url)
            .header(header::ACCEPT, accept);
        if let Some(token) = &token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(map_transport_error)?;

        // One anonymous token negotiation round on 401.
        if response.status() == StatusCode::UNAUTHORIZED && token.is_none() {
            if let Some(challenge) = response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_bearer_challenge)
            {
                let fresh = self.fetch_token(&challenge, reference).await?;
                self.tokens
                    .lock()
                    .unwrap()
                    .insert(reference.repository.clone(), fresh.clone());
                let retried = self
                    .http
                    .request(method, url)
                    .header(header::ACCEPT, accept)
                    .bearer_auth(fresh)
                    .send()
                    .await
                    .map_err(map_transport_error)?;
                return check_status(retried, url);
            }
        }

        check_status(response, url)
    }

    async fn fetch_token(
        &self,
        challenge: &BearerChallenge,
        reference: &ImageReference,
    ) -> Result<String, RegistryError> {
        let scope = format!("repository:{}:pull", reference.path());
        debug!(realm = %challenge.realm, %scope, "negotiating registry token");
        let response = self
            .http
            .get(&challenge.realm)
            .query(&[("service", challenge.service.as_str()), ("scope", &scope)])
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(response, &challenge.realm)?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RegistryError::Other(format!("invalid token response: {e}")))?;
        body.get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| RegistryError::Unauthorized("token endpoint returned no token".into()))
    }
}

#[async_trait]
impl RegistryClient for OciRegistryClient {
    async fn head_digest(&self, reference: &ImageReference) -> Result<String, RegistryError> {
        let url = self.manifest_url(reference);
        let response = self
            .send(reqwest::Method::HEAD, &url, MANIFEST_ACCEPT, reference)
            .await?;
        if let Some(digest) = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
        {
            return Ok(digest.to_string());
        }

        // Not every registry answers HEAD with the digest header; fall back
        // to hashing the manifest body.
        let response = self
            .send(reqwest::Method::GET, &url, MANIFEST_ACCEPT, reference)
            .await?;
        let body = response.bytes().await.map_err(map_transport_error)?;
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(&body))))
    }

    async fn pull_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<ImageManifest, RegistryError> {
        let url = self.manifest_url(reference);
        let response = self
            .send(reqwest::Method::GET, &url, MANIFEST_ACCEPT, reference)
            .await?;
        let body = response.bytes().await.map_err(map_transport_error)?;
        let value: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| RegistryError::Other(format!("invalid manifest for {reference}: {e}")))?;
        if value.get("manifests").is_some() {
            return Err(RegistryError::Other(format!(
                "{reference} resolves to an image index, expected an image manifest"
            )));
        }
        serde_json::from_value(value)
            .map_err(|e| RegistryError::Other(format!("invalid manifest for {reference}: {e}")))
    }

    async fn pull_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        let url = self.blob_url(reference, digest);
        let response = self
            .send(reqwest::Method::GET, &url, "*/*", reference)
            .await?;
        Ok(response
            .bytes()
            .await
            .map_err(map_transport_error)?
            .to_vec())
    }
}

fn scheme_for(registry: &str) -> &'static str {
    let host = registry.split(':').next().unwrap_or(registry);
    if host == "localhost" || host == "127.0.0.1" {
        "http"
    } else {
        "https"
    }
}

fn map_transport_error(err: reqwest::Error) -> RegistryError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RegistryError::Transient(err.to_string())
    } else {
        RegistryError::Other(err.to_string())
    }
}

fn check_status(response: Response, url: &str) -> Result<Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(classify_status(status, url))
}

fn classify_status(status: StatusCode, url: &str) -> RegistryError {
    match status {
        StatusCode::NOT_FOUND => RegistryError::NotFound(url.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RegistryError::Unauthorized(url.to_string())
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RegistryError::Transient(format!("HTTP {status} from {url}"))
        }
        s if s.is_server_error() => RegistryError::Transient(format!("HTTP {s} from {url}")),
        s => RegistryError::Other(format!("HTTP {s} from {url}")),
    }
}

#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: String,
}

/// Parse a `WWW-Authenticate: Bearer realm="...",service="..."` challenge.
fn parse_bearer_challenge(value: &str) -> Option<BearerChallenge> {
    let rest = value.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    for part in rest.split(',') {
        let (key, val) = part.trim().split_once('=')?;
        let val = val.trim_matches('"');
        match key {
            "realm" => realm = Some(val.to_string()),
            "service" => service = Some(val.to_string()),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service: service.unwrap_or_default(),
    })
}
