// SPDX-License-Identifier: Apache-2.0

//! Claim verifiers: the step that ensures a cryptographically valid
//! signature is actually over *this* image's digest. Image signatures carry
//! a SimpleSigning document; attestation signatures carry a DSSE envelope
//! whose statement subjects must match the digest.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;

use crate::error::ClaimError;
use crate::models::dsse::DsseEnvelope;
use crate::models::simple_signing::SimpleContainerImage;
use crate::models::statement::StatementHeader;

use super::ClaimVerifier;

/// Claim verifier for image signatures. Accepts when the signed
/// `docker-manifest-digest` equals the expected digest and every expected
/// annotation is present with an equal value in the signed optional map.
pub fn image_claim_verifier() -> ClaimVerifier {
    Arc::new(|candidate, expected, annotations| {
        let payload: SimpleContainerImage = serde_json::from_slice(&candidate.payload)
            .map_err(|e| ClaimError::Malformed(e.to_string()))?;

        let claimed = payload.critical.image.docker_manifest_digest;
        if claimed != expected.to_string() {
            return Err(ClaimError::InvalidOrMissingDigest(claimed));
        }

        if let Some(expected_annotations) = annotations {
            let signed = payload.optional.map(|o| o.extra).unwrap_or_default();
            for (key, value) in expected_annotations {
                match signed.get(key) {
                    Some(Value::String(s)) if s == value => {}
                    _ => return Err(ClaimError::MissingOrIncorrectAnnotation),
                }
            }
        }

        Ok(())
    })
}

/// Claim verifier for attestation signatures. Accepts when at least one
/// statement subject carries a digest entry matching the expected digest on
/// both algorithm and hex.
pub fn attestation_claim_verifier() -> ClaimVerifier {
    Arc::new(|candidate, expected, _annotations| {
        let envelope: DsseEnvelope = serde_json::from_slice(&candidate.payload)
            .map_err(|e| ClaimError::Malformed(e.to_string()))?;
        let statement = STANDARD
            .decode(&envelope.payload)
            .map_err(|e| ClaimError::Malformed(e.to_string()))?;
        let header: StatementHeader = serde_json::from_slice(&statement)
            .map_err(|e| ClaimError::Malformed(e.to_string()))?;

        for subject in &header.subject {
            if subject.digest.get(&expected.algorithm) == Some(&expected.hex) {
                return Ok(());
            }
        }
        Err(ClaimError::NoMatchingSubjectDigest)
    })
}
