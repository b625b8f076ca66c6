// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// A DSSE envelope as stored in attestation image layers.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DsseEnvelope {
    /// Base64 encoded payload (an in-toto statement).
    pub payload: String,
    /// e.g. `application/vnd.in-toto+json`.
    #[serde(default)]
    pub payload_type: String,
    #[serde(default)]
    pub signatures: Vec<EnvelopeSignature>,
}

/// A single signature inside a DSSE envelope.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EnvelopeSignature {
    /// Base64 encoded signature over the PAE.
    pub sig: String,
    #[serde(default)]
    pub keyid: String,
}

/// DSSE v1 Pre-Authentication Encoding:
/// `PAE(type, payload) = "DSSEv1" SP len(type) SP type SP len(payload) SP payload`
pub fn construct_pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let header = format!(
        "DSSEv1 {} {} {} ",
        payload_type.len(),
        payload_type,
        payload.len()
    );
    let mut pae = Vec::with_capacity(header.len() + payload.len());
    pae.extend_from_slice(header.as_bytes());
    pae.extend_from_slice(payload);
    pae
}
