// SPDX-License-Identifier: Apache-2.0

//! Reconstructs verified attestation signatures into [`Attestation`] values:
//! the DSSE payload is base64-decoded and the in-toto statement retained
//! verbatim so downstream rules can hash or re-parse it.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::cosign::{bundle_metadata, SignatureCandidate};
use crate::error::EcpError;
use crate::image::ImageReference;
use crate::models::dsse::DsseEnvelope;
use crate::models::statement::{StatementHeader, Subject};
use crate::signature::{split_pem_chain, EntitySignature};

const EMPTY_JSON_CAUSE: &str = "unexpected end of JSON input";

/// A decoded, verified in-toto statement together with the signatures that
/// covered it.
#[derive(Debug, Clone)]
pub struct Attestation {
    statement: Vec<u8>,
    statement_type: String,
    predicate_type: String,
    subjects: Vec<Subject>,
    signatures: Vec<EntitySignature>,
}

impl Attestation {
    /// Decode an accepted attestation candidate. Failures surface as EV002.
    pub fn from_candidate(
        reference: &ImageReference,
        candidate: &SignatureCandidate,
    ) -> Result<Attestation, EcpError> {
        let decode_err = |cause: String| EcpError::AttestationDecode {
            reference: reference.to_string(),
            cause,
        };

        if candidate.payload.is_empty() {
            return Err(decode_err(EMPTY_JSON_CAUSE.to_string()));
        }
        let envelope: DsseEnvelope = serde_json::from_slice(&candidate.payload)
            .map_err(|e| decode_err(e.to_string()))?;
        if envelope.payload.is_empty() {
            return Err(decode_err(EMPTY_JSON_CAUSE.to_string()));
        }
        let statement = STANDARD
            .decode(&envelope.payload)
            .map_err(|e| decode_err(e.to_string()))?;
        if statement.is_empty() {
            return Err(decode_err(EMPTY_JSON_CAUSE.to_string()));
        }
        let header: StatementHeader =
            serde_json::from_slice(&statement).map_err(|e| decode_err(e.to_string()))?;

        let chain = candidate
            .chain
            .as_deref()
            .map(split_pem_chain)
            .unwrap_or_default();
        let metadata = bundle_metadata(candidate);
        let signatures = envelope
            .signatures
            .iter()
            .map(|s| EntitySignature {
                certificate: candidate.certificate.clone(),
                chain: chain.clone(),
                keyid: s.keyid.clone(),
                metadata: metadata.clone(),
                sig: s.sig.clone(),
            })
            .collect();

        Ok(Attestation {
            statement_type: header.statement_type,
            predicate_type: header.predicate_type,
            subjects: header.subject,
            statement,
            signatures,
        })
    }

    /// Build an attestation directly from statement bytes. The header is
    /// parsed best-effort; syntax validation reports malformed statements.
    pub fn from_statement(
        statement: impl Into<Vec<u8>>,
        signatures: Vec<EntitySignature>,
    ) -> Attestation {
        let statement = statement.into();
        let header: StatementHeader = serde_json::from_slice(&statement).unwrap_or_default();
        Attestation {
            statement_type: header.statement_type,
            predicate_type: header.predicate_type,
            subjects: header.subject,
            statement,
            signatures,
        }
    }

    /// The statement bytes, verbatim.
    pub fn statement(&self) -> &[u8] {
        &self.statement
    }

    pub fn statement_type(&self) -> &str {
        &self.statement_type
    }

    pub fn predicate_type(&self) -> &str {
        &self.predicate_type
    }

    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    pub fn signatures(&self) -> &[EntitySignature] {
        &self.signatures
    }
}
