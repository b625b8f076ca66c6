// SPDX-License-Identifier: Apache-2.0

//! Fetches image signatures and attestations from their cosign sibling tags
//! and verifies each candidate against the configured trust material: a
//! public key, or a certificate chained to Fulcio roots matching identity
//! constraints, optionally with a Rekor transparency-log bundle. A candidate
//! is accepted only after the injected claim verifier confirms it binds to
//! the expected image digest.

pub mod claims;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sigstore::cosign::{Client as SigstoreClient, CosignCapabilities};
use sigstore::crypto::{CosignVerificationKey, Signature, SigningScheme};
use tracing::debug;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;

use crate::error::{ClaimError, RegistryError, VerifyError};
use crate::image::ImageReference;
use crate::models::dsse::{construct_pae, DsseEnvelope};
use crate::registry::RegistryClient;
use crate::retry::with_retry;
use crate::runtime::CancellationToken;

pub const SIGNATURE_ANNOTATION: &str = "dev.cosignproject.cosign/signature";
pub const CERTIFICATE_ANNOTATION: &str = "dev.sigstore.cosign/certificate";
pub const CHAIN_ANNOTATION: &str = "dev.sigstore.cosign/chain";
pub const BUNDLE_ANNOTATION: &str = "dev.sigstore.cosign/bundle";

// Fulcio encodes the OIDC issuer in this certificate extension.
const FULCIO_ISSUER_OID: &str = "1.3.6.1.4.1.57264.1.1";

/// An image digest split into its `algorithm:hex` halves. Comparison is
/// case-sensitive on the hex portion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDigest {
    pub algorithm: String,
    pub hex: String,
}

impl ImageDigest {
    pub fn parse(digest: &str) -> Option<ImageDigest> {
        let (algorithm, hex) = digest.split_once(':')?;
        if algorithm.is_empty() || hex.is_empty() {
            return None;
        }
        Some(ImageDigest {
            algorithm: algorithm.to_string(),
            hex: hex.to_string(),
        })
    }
}

impl fmt::Display for ImageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// One signature or attestation layer pulled from a cosign sibling image,
/// before or after verification.
#[derive(Debug, Clone, Default)]
pub struct SignatureCandidate {
    /// Layer bytes: a SimpleSigning document for image signatures, a DSSE
    /// envelope for attestations.
    pub payload: Vec<u8>,
    /// Detached base64 signature from the layer annotations; empty for
    /// attestations, whose signatures live inside the envelope.
    pub base64_signature: String,
    /// Signing certificate (PEM), present for keyless signatures.
    pub certificate: Option<String>,
    /// Certificate chain bundle (PEM).
    pub chain: Option<String>,
    /// Rekor bundle attached by cosign at signing time.
    pub rekor_bundle: Option<Value>,
    pub media_type: String,
}

/// Callback deciding whether a cryptographically valid candidate actually
/// binds to the expected image digest (and annotations, where applicable).
pub type ClaimVerifier = Arc<
    dyn Fn(&SignatureCandidate, &ImageDigest, Option<&BTreeMap<String, String>>) -> Result<(), ClaimError>
        + Send
        + Sync,
>;

/// Identity constraints applied to Fulcio-issued certificates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificateIdentity {
    /// Expected subject (an email or URI SAN).
    pub subject: String,
    /// Expected OIDC issuer, when constrained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

/// Trust material supplied by the caller. At least one of `public_key` and
/// `certificate_identity` must be present for verification to succeed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rekor_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fulcio_certs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_identity: Option<CertificateIdentity>,
    #[serde(default)]
    pub ignore_rekor: bool,
}

impl TrustConfig {
    /// Expand into check options, without a claim verifier; callers attach
    /// the verifier matching what is being checked.
    pub fn check_opts(&self) -> CheckOpts {
        CheckOpts {
            public_key: self.public_key.clone(),
            rekor_url: self.rekor_url.clone(),
            rekor_public_key: None,
            fulcio_certs: self.fulcio_certs.clone(),
            certificate_identity: self.certificate_identity.clone(),
            ignore_rekor: self.ignore_rekor,
            annotations: BTreeMap::new(),
            claim_verifier: None,
        }
    }
}

/// Aggregated options for one verification pass: trust material, expected
/// annotations, and the claim verifier callback.
#[derive(Clone, Default)]
pub struct CheckOpts {
    pub public_key: Option<String>,
    pub rekor_url: Option<String>,
    /// Pre-fetched Rekor log key (PEM); when absent and a rekor URL is set,
    /// the client fetches it from the log.
    pub rekor_public_key: Option<String>,
    pub fulcio_certs: Vec<String>,
    pub certificate_identity: Option<CertificateIdentity>,
    pub ignore_rekor: bool,
    pub annotations: BTreeMap<String, String>,
    pub claim_verifier: Option<ClaimVerifier>,
}

impl fmt::Debug for CheckOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckOpts")
            .field("public_key", &self.public_key.is_some())
            .field("rekor_url", &self.rekor_url)
            .field("certificate_identity", &self.certificate_identity)
            .field("ignore_rekor", &self.ignore_rekor)
            .field("annotations", &self.annotations)
            .field("claim_verifier", &self.claim_verifier.is_some())
            .finish()
    }
}

/// Verification surface consumed by the aggregator; tests provide mocks.
#[async_trait]
pub trait SignatureClient: Send + Sync {
    /// Verify the image signatures stored alongside `reference`. Returns the
    /// accepted candidates and whether every one of them was covered by a
    /// verified transparency-log bundle.
    async fn verify_image_signatures(
        &self,
        reference: &ImageReference,
        opts: &CheckOpts,
    ) -> Result<(Vec<SignatureCandidate>, bool), VerifyError>;

    /// Verify the attestations stored alongside `reference`.
    async fn verify_image_attestations(
        &self,
        reference: &ImageReference,
        opts: &CheckOpts,
    ) -> Result<(Vec<SignatureCandidate>, bool), VerifyError>;
}

enum PayloadKind {
    SimpleSigning,
    DsseEnvelope,
}

/// Default client implementing the cosign storage conventions on top of the
/// injected registry client.
pub struct CosignClient {
    registry: Arc<dyn RegistryClient>,
    cancel: CancellationToken,
    http: reqwest::Client,
}

impl CosignClient {
    pub fn new(registry: Arc<dyn RegistryClient>, cancel: CancellationToken) -> Self {
        CosignClient {
            registry,
            cancel,
            http: reqwest::Client::new(),
        }
    }

    async fn verify(
        &self,
        reference: &ImageReference,
        opts: &CheckOpts,
        kind: PayloadKind,
        suffix: &str,
    ) -> Result<(Vec<SignatureCandidate>, bool), VerifyError> {
        if opts.public_key.is_none() && opts.certificate_identity.is_none() {
            return Err(VerifyError::TrustMaterialMissing);
        }
        let expected = reference
            .digest
            .as_deref()
            .and_then(ImageDigest::parse)
            .ok_or_else(|| {
                VerifyError::Registry(RegistryError::InvalidReference {
                    reference: reference.to_string(),
                    cause: "reference must be resolved before verification".to_string(),
                })
            })?;

        let sibling = reference.cosign_sibling(suffix)?;
        let candidates = match self.collect(&sibling).await {
            Ok(candidates) => candidates,
            Err(RegistryError::NotFound(_)) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        if candidates.is_empty() {
            return Err(VerifyError::NoSignaturesFound);
        }

        let rekor_key = self.rekor_key(opts).await?;

        let mut accepted = Vec::new();
        let mut reasons = Vec::new();
        let mut all_covered = true;
        for candidate in candidates {
            match self.verify_candidate(&candidate, opts, rekor_key.as_ref(), &expected, &kind) {
                Ok(covered) => {
                    all_covered &= covered;
                    accepted.push(candidate);
                }
                Err(reason) => {
                    debug!(%reference, %reason, "rejecting signature candidate");
                    reasons.push(reason);
                }
            }
        }

        if accepted.is_empty() {
            return Err(VerifyError::AllSignaturesInvalid { reasons });
        }
        Ok((accepted, rekor_key.is_some() && all_covered))
    }

    /// Pull the sibling image's layers together with their signature
    /// annotations.
    async fn collect(
        &self,
        sibling: &ImageReference,
    ) -> Result<Vec<SignatureCandidate>, RegistryError> {
        let manifest = with_retry(&self.cancel, "fetch signature manifest", || {
            let registry = self.registry.clone();
            let sibling = sibling.clone();
            async move { registry.pull_manifest(&sibling).await }
        })
        .await?;

        let mut candidates = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            let payload = with_retry(&self.cancel, "fetch signature layer", || {
                let registry = self.registry.clone();
                let sibling = sibling.clone();
                let digest = layer.digest.clone();
                async move { registry.pull_blob(&sibling, &digest).await }
            })
            .await?;

            let annotations = layer.annotations.clone().unwrap_or_default();
            candidates.push(SignatureCandidate {
                payload,
                base64_signature: annotations
                    .get(SIGNATURE_ANNOTATION)
                    .cloned()
                    .unwrap_or_default(),
                certificate: annotations
                    .get(CERTIFICATE_ANNOTATION)
                    .filter(|s| !s.is_empty())
                    .cloned(),
                chain: annotations
                    .get(CHAIN_ANNOTATION)
                    .filter(|s| !s.is_empty())
                    .cloned(),
                rekor_bundle: annotations
                    .get(BUNDLE_ANNOTATION)
                    .and_then(|s| serde_json::from_str(s).ok()),
                media_type: layer.media_type.clone(),
            });
        }
        Ok(candidates)
    }

    fn verify_candidate(
        &self,
        candidate: &SignatureCandidate,
        opts: &CheckOpts,
        rekor_key: Option<&CosignVerificationKey>,
        expected: &ImageDigest,
        kind: &PayloadKind,
    ) -> Result<bool, String> {
        match kind {
            PayloadKind::SimpleSigning => self.verify_detached_signature(candidate, opts)?,
            PayloadKind::DsseEnvelope => self.verify_envelope_signatures(candidate, opts)?,
        }

        let covered = match rekor_key {
            Some(key) => {
                verify_rekor_bundle(candidate, key)?;
                true
            }
            None => false,
        };

        if let Some(claim_verifier) = &opts.claim_verifier {
            let annotations = match kind {
                PayloadKind::SimpleSigning => Some(&opts.annotations),
                PayloadKind::DsseEnvelope => None,
            };
            claim_verifier(candidate, expected, annotations).map_err(|e| e.to_string())?;
        }

        Ok(covered)
    }

    /// Image signatures: the payload is signed directly, with the signature
    /// detached into the layer annotation.
    fn verify_detached_signature(
        &self,
        candidate: &SignatureCandidate,
        opts: &CheckOpts,
    ) -> Result<(), String> {
        if candidate.base64_signature.is_empty() {
            return Err("layer carries no signature annotation".to_string());
        }
        self.verify_blob_signature(&candidate.base64_signature, &candidate.payload, candidate, opts)
    }

    /// Attestations: the layer is a DSSE envelope; each inner signature is
    /// over the PAE of the envelope payload, and one valid signature accepts
    /// the envelope.
    fn verify_envelope_signatures(
        &self,
        candidate: &SignatureCandidate,
        opts: &CheckOpts,
    ) -> Result<(), String> {
        let envelope: DsseEnvelope = serde_json::from_slice(&candidate.payload)
            .map_err(|e| format!("unable to decode DSSE envelope: {e}"))?;
        if envelope.signatures.is_empty() {
            return Err("DSSE envelope carries no signatures".to_string());
        }
        let payload = STANDARD
            .decode(&envelope.payload)
            .map_err(|e| format!("unable to decode DSSE payload: {e}"))?;
        let pae = construct_pae(&envelope.payload_type, &payload);

        let mut failures = Vec::new();
        for signature in &envelope.signatures {
            match self.verify_blob_signature(&signature.sig, &pae, candidate, opts) {
                Ok(()) => return Ok(()),
                Err(reason) => failures.push(reason),
            }
        }
        Err(failures.join("; "))
    }

    /// Verify one base64 signature over `message` using the configured trust
    /// material: an explicit public key wins, otherwise the candidate's
    /// certificate must verify and satisfy the identity constraints.
    fn verify_blob_signature(
        &self,
        base64_signature: &str,
        message: &[u8],
        candidate: &SignatureCandidate,
        opts: &CheckOpts,
    ) -> Result<(), String> {
        if let Some(public_key) = &opts.public_key {
            let key = CosignVerificationKey::from_pem(
                public_key.as_bytes(),
                &SigningScheme::ECDSA_P256_SHA256_ASN1,
            )
            .map_err(|e| format!("unable to load public key: {e}"))?;
            return key
                .verify_signature(Signature::Base64Encoded(base64_signature.as_bytes()), message)
                .map_err(|e| format!("signature does not verify with the supplied key: {e}"));
        }

        let certificate = candidate
            .certificate
            .as_deref()
            .ok_or_else(|| "candidate carries no certificate and no public key is configured".to_string())?;
        SigstoreClient::verify_blob(certificate, base64_signature, message)
            .map_err(|e| format!("signature does not verify with the embedded certificate: {e}"))?;
        self.check_certificate_chain(certificate, opts)?;
        self.check_certificate_identity(certificate, opts)
    }

    /// When Fulcio roots are configured, the signing certificate must be
    /// issued by one of them.
    fn check_certificate_chain(
        &self,
        certificate_pem: &str,
        opts: &CheckOpts,
    ) -> Result<(), String> {
        if opts.fulcio_certs.is_empty() {
            return Ok(());
        }
        let (_, pem) = parse_x509_pem(certificate_pem.as_bytes())
            .map_err(|e| format!("unable to parse signing certificate PEM: {e}"))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| format!("unable to parse signing certificate: {e}"))?;

        for root_pem in &opts.fulcio_certs {
            let Ok((_, root)) = parse_x509_pem(root_pem.as_bytes()) else {
                continue;
            };
            let Ok(root_cert) = root.parse_x509() else {
                continue;
            };
            if cert.verify_signature(Some(root_cert.public_key())).is_ok() {
                return Ok(());
            }
        }
        Err("certificate does not chain to any configured Fulcio root".to_string())
    }

    /// Enforce the configured identity constraints against a signing
    /// certificate's SANs and Fulcio issuer extension.
    fn check_certificate_identity(
        &self,
        certificate_pem: &str,
        opts: &CheckOpts,
    ) -> Result<(), String> {
        let identity = opts
            .certificate_identity
            .as_ref()
            .ok_or_else(|| "certificate identity constraints are required for keyless verification".to_string())?;

        let (_, pem) = parse_x509_pem(certificate_pem.as_bytes())
            .map_err(|e| format!("unable to parse signing certificate PEM: {e}"))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| format!("unable to parse signing certificate: {e}"))?;

        let mut subject_matched = false;
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::RFC822Name(email)
                        if email.eq_ignore_ascii_case(&identity.subject) =>
                    {
                        subject_matched = true;
                        break;
                    }
                    GeneralName::URI(uri) if *uri == identity.subject => {
                        subject_matched = true;
                        break;
                    }
                    _ => {}
                }
            }
        }
        if !subject_matched {
            return Err(format!(
                "expected identity '{}' not found in certificate SAN",
                identity.subject
            ));
        }

        if let Some(expected_issuer) = &identity.issuer {
            let issuer = cert
                .extensions()
                .iter()
                .find(|ext| ext.oid.to_id_string() == FULCIO_ISSUER_OID)
                .map(|ext| String::from_utf8_lossy(ext.value).trim().to_string());
            match issuer {
                Some(issuer) if issuer == *expected_issuer => {}
                Some(issuer) => {
                    return Err(format!(
                        "certificate issuer '{issuer}' does not match expected '{expected_issuer}'"
                    ));
                }
                None => {
                    return Err("certificate carries no issuer extension".to_string());
                }
            }
        }

        Ok(())
    }

    /// Load the Rekor log key when transparency-log checks are enabled.
    async fn rekor_key(&self, opts: &CheckOpts) -> Result<Option<CosignVerificationKey>, VerifyError> {
        if opts.ignore_rekor {
            return Ok(None);
        }
        let url = match &opts.rekor_url {
            Some(url) => url.clone(),
            None => return Ok(None),
        };

        let pem = match &opts.rekor_public_key {
            Some(pem) => pem.clone(),
            None => {
                let key_url = format!("{}/api/v1/log/publicKey", url.trim_end_matches('/'));
                with_retry(&self.cancel, "fetch rekor public key", || {
                    let http = self.http.clone();
                    let key_url = key_url.clone();
                    async move {
                        let response = http.get(&key_url).send().await.map_err(|e| {
                            if e.is_timeout() || e.is_connect() {
                                RegistryError::Transient(e.to_string())
                            } else {
                                RegistryError::Other(e.to_string())
                            }
                        })?;
                        if !response.status().is_success() {
                            return Err(RegistryError::Transient(format!(
                                "HTTP {} from {key_url}",
                                response.status()
                            )));
                        }
                        response
                            .text()
                            .await
                            .map_err(|e| RegistryError::Other(e.to_string()))
                    }
                })
                .await?
            }
        };

        let key = CosignVerificationKey::from_pem(
            pem.as_bytes(),
            &SigningScheme::ECDSA_P256_SHA256_ASN1,
        )
        .map_err(|e| {
            VerifyError::Registry(RegistryError::Other(format!(
                "invalid rekor public key: {e}"
            )))
        })?;
        Ok(Some(key))
    }
}

/// Verify the signed entry timestamp of the candidate's Rekor bundle. The
/// SET signs the canonical JSON of the bundle payload.
fn verify_rekor_bundle(
    candidate: &SignatureCandidate,
    rekor_key: &CosignVerificationKey,
) -> Result<(), String> {
    let bundle = candidate
        .rekor_bundle
        .as_ref()
        .ok_or_else(|| "no transparency log bundle attached to signature".to_string())?;
    let set = bundle
        .get("SignedEntryTimestamp")
        .and_then(Value::as_str)
        .ok_or_else(|| "transparency log bundle has no SignedEntryTimestamp".to_string())?;
    let payload = bundle
        .get("Payload")
        .ok_or_else(|| "transparency log bundle has no Payload".to_string())?;
    // serde_json maps are ordered, so this is the canonical encoding.
    let canonical = serde_json::to_vec(payload)
        .map_err(|e| format!("unable to canonicalize bundle payload: {e}"))?;
    rekor_key
        .verify_signature(Signature::Base64Encoded(set.as_bytes()), &canonical)
        .map_err(|e| format!("signed entry timestamp does not verify: {e}"))
}

#[async_trait]
impl SignatureClient for CosignClient {
    async fn verify_image_signatures(
        &self,
        reference: &ImageReference,
        opts: &CheckOpts,
    ) -> Result<(Vec<SignatureCandidate>, bool), VerifyError> {
        self.verify(reference, opts, PayloadKind::SimpleSigning, ".sig")
            .await
    }

    async fn verify_image_attestations(
        &self,
        reference: &ImageReference,
        opts: &CheckOpts,
    ) -> Result<(Vec<SignatureCandidate>, bool), VerifyError> {
        self.verify(reference, opts, PayloadKind::DsseEnvelope, ".att")
            .await
    }
}

/// Extract rekor bundle metadata (log index, log id, integration time) for
/// the signature record, when a bundle is attached.
pub fn bundle_metadata(candidate: &SignatureCandidate) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    if let Some(payload) = candidate
        .rekor_bundle
        .as_ref()
        .and_then(|b| b.get("Payload"))
    {
        if let Some(index) = payload.get("logIndex").and_then(Value::as_i64) {
            metadata.insert("logIndex".to_string(), index.to_string());
        }
        if let Some(id) = payload.get("logID").and_then(Value::as_str) {
            metadata.insert("logID".to_string(), id.to_string());
        }
        if let Some(time) = payload.get("integratedTime").and_then(Value::as_i64) {
            metadata.insert("integratedTime".to_string(), time.to_string());
        }
    }
    metadata
}
