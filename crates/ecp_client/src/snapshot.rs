// SPDX-License-Identifier: Apache-2.0

//! The per-image aggregate. One [`ApplicationSnapshotImage`] drives a single
//! verification: resolve the reference, verify signatures and attestations
//! through the claim callbacks, decode and validate the attestations, fetch
//! image metadata, and serialize everything into the input document the
//! policy engine consumes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::attestation::Attestation;
use crate::cosign::{bundle_metadata, claims, SignatureCandidate, TrustConfig};
use crate::error::EcpError;
use crate::image::{self, ImageReference};
use crate::layers::{maybe_gunzip, tar_entries};
use crate::retry::with_retry;
use crate::runtime::RunContext;
use crate::signature::{split_pem_chain, EntitySignature};
use crate::syntax;

/// Config label naming the parent (base) image reference.
const PARENT_IMAGE_LABEL: &str = "org.opencontainers.image.base.name";
/// Config label naming the directory of operator bundle manifests.
const MANIFESTS_DIR_LABEL: &str = "operators.operatorframework.io.bundle.manifests.v1";

/// The snapshot component this image originates from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotComponent {
    #[serde(default)]
    pub container_image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSource {
    pub revision: String,
    pub url: String,
}

/// Mutable per-image aggregate. Operations are idempotent after success and
/// check their preconditions; a failure in an earlier step is never masked
/// by a later one.
pub struct ApplicationSnapshotImage {
    reference: ImageReference,
    trust: TrustConfig,
    signatures: Vec<EntitySignature>,
    attestations: Vec<Attestation>,
    config_json: Option<Value>,
    parent_ref: Option<ImageReference>,
    parent_config_json: Option<Value>,
    files: BTreeMap<String, Value>,
    component: Option<SnapshotComponent>,
}

impl ApplicationSnapshotImage {
    pub fn new(reference: ImageReference, trust: TrustConfig) -> Self {
        ApplicationSnapshotImage {
            reference,
            trust,
            signatures: Vec::new(),
            attestations: Vec::new(),
            config_json: None,
            parent_ref: None,
            parent_config_json: None,
            files: BTreeMap::new(),
            component: None,
        }
    }

    pub fn with_component(mut self, component: SnapshotComponent) -> Self {
        self.component = Some(component);
        self
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    pub fn signatures(&self) -> &[EntitySignature] {
        &self.signatures
    }

    pub fn attestations(&self) -> &[Attestation] {
        &self.attestations
    }

    /// Resolve the reference, confirming the registry serves it. Transient
    /// failures are retried; exhaustion surfaces as EV005.
    pub async fn validate_image_access(&mut self, ctx: &RunContext) -> Result<(), EcpError> {
        let resolved = image::resolve(ctx, &self.reference)
            .await
            .map_err(|e| EcpError::image_access(self.reference.to_string(), e))?;
        debug!(reference = %resolved, "image access validated");
        self.reference = resolved;
        Ok(())
    }

    /// Verify the image signatures, accepting only candidates whose signed
    /// claim binds them to this image's digest.
    pub async fn validate_image_signature(&mut self, ctx: &RunContext) -> Result<(), EcpError> {
        let mut opts = self.trust.check_opts();
        opts.claim_verifier = Some(claims::image_claim_verifier());
        let (accepted, _bundle_verified) = ctx
            .signatures()
            .verify_image_signatures(&self.reference, &opts)
            .await
            .map_err(|e| EcpError::signature_verification(self.reference.to_string(), e))?;
        self.signatures = accepted.iter().map(entity_signature).collect();
        Ok(())
    }

    /// Verify the attestation signatures and decode the accepted envelopes
    /// into [`Attestation`] values.
    pub async fn validate_attestation_signature(
        &mut self,
        ctx: &RunContext,
    ) -> Result<(), EcpError> {
        let mut opts = self.trust.check_opts();
        opts.claim_verifier = Some(claims::attestation_claim_verifier());
        let (accepted, _bundle_verified) = ctx
            .signatures()
            .verify_image_attestations(&self.reference, &opts)
            .await
            .map_err(|e| EcpError::signature_verification(self.reference.to_string(), e))?;

        let mut attestations = Vec::with_capacity(accepted.len());
        for candidate in &accepted {
            attestations.push(Attestation::from_candidate(&self.reference, candidate)?);
        }
        self.attestations = attestations;
        Ok(())
    }

    /// Validate the syntax of the collected attestations. Calling this
    /// before any attestations were collected is a caller contract
    /// violation, not a verification failure.
    pub fn validate_attestation_syntax(&self) -> Result<(), EcpError> {
        if self.attestations.is_empty() {
            return Err(EcpError::NoAttestationData(self.reference.to_string()));
        }
        syntax::validate_attestation_syntax(&self.reference.to_string(), &self.attestations)
    }

    /// Fetch the image config blob.
    pub async fn fetch_image_config(&mut self, ctx: &RunContext) -> Result<(), EcpError> {
        if self.config_json.is_some() {
            return Ok(());
        }
        self.config_json = Some(fetch_config_json(ctx, &self.reference).await?);
        Ok(())
    }

    /// Fetch the parent image config, when the conventional base-image label
    /// names one. An absent label is not an error.
    pub async fn fetch_parent_image_config(&mut self, ctx: &RunContext) -> Result<(), EcpError> {
        if self.parent_config_json.is_some() {
            return Ok(());
        }
        if self.config_json.is_none() {
            self.fetch_image_config(ctx).await?;
        }
        let labels = self.config_json.as_ref().and_then(config_labels);
        let parent = match labels.and_then(|l| l.get(PARENT_IMAGE_LABEL)).and_then(Value::as_str) {
            Some(value) if !value.is_empty() => value.to_string(),
            _ => {
                debug!(reference = %self.reference, "image config names no parent image");
                return Ok(());
            }
        };

        let parent_ref = ImageReference::parse(&parent)
            .map_err(|e| EcpError::image_access(self.reference.to_string(), e))?;
        self.parent_config_json = Some(fetch_config_json(ctx, &parent_ref).await?);
        self.parent_ref = Some(parent_ref);
        Ok(())
    }

    /// Extract the files named by the manifests-directory label from the
    /// image's layer tarballs, converting YAML to JSON for the files map.
    pub async fn fetch_image_files(&mut self, ctx: &RunContext) -> Result<(), EcpError> {
        if !self.files.is_empty() {
            return Ok(());
        }
        if self.config_json.is_none() {
            self.fetch_image_config(ctx).await?;
        }
        let prefix = match self
            .config_json
            .as_ref()
            .and_then(config_labels)
            .and_then(|l| l.get(MANIFESTS_DIR_LABEL))
            .and_then(Value::as_str)
        {
            Some(prefix) if !prefix.is_empty() => prefix.to_string(),
            _ => return Ok(()),
        };

        let reference = self.reference.clone();
        let manifest = with_retry(ctx.cancellation(), "fetch image manifest", || {
            let registry = ctx.registry_handle();
            let reference = reference.clone();
            async move { registry.pull_manifest(&reference).await }
        })
        .await
        .map_err(|e| EcpError::image_access(reference.to_string(), e))?;

        for layer in &manifest.layers {
            let blob = with_retry(ctx.cancellation(), "fetch image layer", || {
                let registry = ctx.registry_handle();
                let reference = reference.clone();
                let digest = layer.digest.clone();
                async move { registry.pull_blob(&reference, &digest).await }
            })
            .await
            .map_err(|e| EcpError::image_access(reference.to_string(), e))?;

            let contents = maybe_gunzip(&blob);
            let Some(entries) = tar_entries(&contents) else {
                warn!(digest = %layer.digest, "layer is not a tar archive, skipping");
                continue;
            };
            for (path, bytes) in entries {
                if !path.starts_with(&prefix) {
                    continue;
                }
                match file_to_json(&bytes) {
                    Some(value) => {
                        self.files.insert(path, value);
                    }
                    None => warn!(%path, "unable to convert file to JSON, skipping"),
                }
            }
        }
        Ok(())
    }

    /// Serialize the aggregate into a fresh scratch directory on the
    /// injected filesystem. Returns both the path and the bytes written.
    pub fn write_input_file(&self, ctx: &RunContext) -> Result<(PathBuf, Vec<u8>), EcpError> {
        let input = self.input_document()?;
        let bytes = serde_json::to_vec(&input).map_err(|e| {
            EcpError::Configuration(format!("unable to serialize input document: {e}"))
        })?;

        let dir = ctx
            .fs()
            .temp_dir()
            .join(format!("ecp_input.{}", rand::random::<u32>()));
        ctx.fs().create_dir_all(&dir)?;
        let path = dir.join("input.json");
        ctx.fs().write(&path, &bytes)?;
        Ok((path, bytes))
    }

    /// The canonical input document. Object keys are emitted alphabetically
    /// and empty values omitted.
    fn input_document(&self) -> Result<Value, EcpError> {
        let mut image = serde_json::Map::new();
        image.insert("ref".to_string(), json!(self.reference.to_string()));
        if let Some(config) = &self.config_json {
            image.insert("config".to_string(), config.clone());
        }
        if !self.files.is_empty() {
            image.insert(
                "files".to_string(),
                Value::Object(self.files.clone().into_iter().collect()),
            );
        }
        if let Some(parent_ref) = &self.parent_ref {
            let mut parent = serde_json::Map::new();
            if let Some(config) = &self.parent_config_json {
                parent.insert("config".to_string(), config.clone());
            }
            parent.insert("ref".to_string(), json!(parent_ref.to_string()));
            image.insert("parent".to_string(), Value::Object(parent));
        }
        if !self.signatures.is_empty() {
            image.insert("signatures".to_string(), json!(self.signatures));
        }
        if let Some(git) = self.component.as_ref().and_then(|c| c.git.as_ref()) {
            image.insert("source".to_string(), json!({ "git": git }));
        }

        let mut document = serde_json::Map::new();
        if !self.attestations.is_empty() {
            let mut attestations = Vec::with_capacity(self.attestations.len());
            for attestation in &self.attestations {
                let statement: Value =
                    serde_json::from_slice(attestation.statement()).map_err(|e| {
                        EcpError::AttestationDecode {
                            reference: self.reference.to_string(),
                            cause: e.to_string(),
                        }
                    })?;
                let mut record = serde_json::Map::new();
                if !attestation.signatures().is_empty() {
                    record.insert("signatures".to_string(), json!(attestation.signatures()));
                }
                record.insert("statement".to_string(), statement);
                attestations.push(Value::Object(record));
            }
            document.insert("attestations".to_string(), Value::Array(attestations));
        }
        document.insert("image".to_string(), Value::Object(image));
        Ok(Value::Object(document))
    }
}

/// Convert an accepted signature candidate into its input-document record.
fn entity_signature(candidate: &SignatureCandidate) -> EntitySignature {
    EntitySignature {
        certificate: candidate.certificate.clone(),
        chain: candidate
            .chain
            .as_deref()
            .map(split_pem_chain)
            .unwrap_or_default(),
        keyid: String::new(),
        metadata: bundle_metadata(candidate),
        sig: candidate.base64_signature.clone(),
    }
}

async fn fetch_config_json(
    ctx: &RunContext,
    reference: &ImageReference,
) -> Result<Value, EcpError> {
    let bytes = with_retry(ctx.cancellation(), "fetch image config", || {
        let registry = ctx.registry_handle();
        let reference = reference.clone();
        async move { registry.pull_config(&reference).await }
    })
    .await
    .map_err(|e| EcpError::image_access(reference.to_string(), e))?;
    serde_json::from_slice(&bytes).map_err(|e| EcpError::ImageAccess {
        reference: reference.to_string(),
        cause: format!("image config is not valid JSON: {e}"),
    })
}

/// Image config labels, whether nested under `config` (OCI config files) or
/// top level (bare label maps).
fn config_labels(config: &Value) -> Option<&serde_json::Map<String, Value>> {
    config
        .get("config")
        .and_then(|c| c.get("Labels"))
        .or_else(|| config.get("Labels"))
        .and_then(Value::as_object)
}

/// Parse a file as JSON, falling back to YAML conversion.
fn file_to_json(bytes: &[u8]) -> Option<Value> {
    if let Ok(value) = serde_json::from_slice(bytes) {
        return Some(value);
    }
    let yaml: serde_yaml::Value = serde_yaml::from_slice(bytes).ok()?;
    serde_json::to_value(yaml).ok()
}
