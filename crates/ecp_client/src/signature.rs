// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

/// A single signature over an artifact, in the shape the input document
/// exposes to the policy engine. Keys serialize in alphabetical order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySignature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
    pub keyid: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub sig: String,
}

/// Split a PEM bundle into individual certificates, delimiters included.
pub fn split_pem_chain(bundle: &str) -> Vec<String> {
    const END: &str = "-----END CERTIFICATE-----";
    let mut certs = Vec::new();
    let mut rest = bundle;
    while let Some(idx) = rest.find(END) {
        let (cert, tail) = rest.split_at(idx + END.len());
        let cert = cert.trim();
        if !cert.is_empty() {
            certs.push(format!("{cert}\n"));
        }
        rest = tail;
    }
    certs
}

/// Re-encode DER certificate bytes as a single PEM block.
pub fn der_to_pem(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}
