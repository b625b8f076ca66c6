// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors raised by the registry client layer. Only [`RegistryError::Transient`]
/// is eligible for retry; everything else surfaces immediately.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid image reference '{reference}': {cause}")]
    InvalidReference { reference: String, cause: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("transient registry failure: {0}")]
    Transient(String),

    #[error("registry unreachable: {0}")]
    Unreachable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl RegistryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Transient(_))
    }
}

/// Rejections produced by a claim verifier callback. The messages are part of
/// the user-facing contract and must not change casually.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClaimError {
    #[error("invalid or missing digest in claim: {0}")]
    InvalidOrMissingDigest(String),

    #[error("missing or incorrect annotation")]
    MissingOrIncorrectAnnotation,

    #[error("no matching subject digest found")]
    NoMatchingSubjectDigest,

    #[error("malformed signature payload: {0}")]
    Malformed(String),
}

/// Outcome of a signature or attestation verification pass.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("no signatures found")]
    NoSignaturesFound,

    #[error("no valid signatures: {}", reasons.join("; "))]
    AllSignaturesInvalid { reasons: Vec<String> },

    #[error("trust material missing: a public key or a certificate identity is required")]
    TrustMaterialMissing,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// User-facing errors. The `EVnnn` codes are stable identifiers consumed by
/// reporting tooling downstream.
#[derive(Debug, Error)]
pub enum EcpError {
    #[error("EV001: Unable to access image, {reference}, caused by: {cause}")]
    ImageAccess { reference: String, cause: String },

    #[error("EV002: Unable to decode attestation data from attestation image, {reference}, caused by: {cause}")]
    AttestationDecode { reference: String, cause: String },

    #[error("EV003: Attestation syntax validation failed, {reference}, caused by:\n{details}")]
    AttestationSyntax { reference: String, details: String },

    #[error("EV004: Unable to verify signature, {reference}, caused by: {cause}")]
    SignatureVerification { reference: String, cause: String },

    #[error("EV005: Registry unreachable, {reference}, caused by: {cause}")]
    RegistryUnreachable { reference: String, cause: String },

    #[error("no attestation data associated with image {0}")]
    NoAttestationData(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("input/output error: {0}")]
    Io(#[from] std::io::Error),
}

impl EcpError {
    /// Wrap a registry failure while accessing `reference` with the matching
    /// user-facing code (EV005 when retries were exhausted, EV001 otherwise).
    pub fn image_access(reference: impl Into<String>, err: RegistryError) -> Self {
        match err {
            RegistryError::Cancelled => EcpError::Cancelled,
            RegistryError::Unreachable(cause) => EcpError::RegistryUnreachable {
                reference: reference.into(),
                cause,
            },
            other => EcpError::ImageAccess {
                reference: reference.into(),
                cause: other.to_string(),
            },
        }
    }

    /// Wrap a verification failure for `reference` under EV004, preserving
    /// cancellation and registry exhaustion.
    pub fn signature_verification(reference: impl Into<String>, err: VerifyError) -> Self {
        match err {
            VerifyError::Registry(inner) => EcpError::image_access(reference, inner),
            other => EcpError::SignatureVerification {
                reference: reference.into(),
                cause: other.to_string(),
            },
        }
    }
}
