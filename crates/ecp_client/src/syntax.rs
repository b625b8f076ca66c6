// SPDX-License-Identifier: Apache-2.0

//! Syntax validation of decoded attestations. Statements are classified by
//! their `predicateType` and checked against the matching embedded JSON
//! schema; unknown predicate types only need a well-formed in-toto statement
//! header. Validation never stops at the first failing attestation: the
//! union of all violations is reported under EV003.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use jsonschema::Validator;
use serde_json::Value;
use tracing::debug;

use crate::attestation::Attestation;
use crate::error::EcpError;

pub const PREDICATE_SLSA_PROVENANCE_V02: &str = "https://slsa.dev/provenance/v0.2";
pub const PREDICATE_SLSA_PROVENANCE_V1: &str = "https://slsa.dev/provenance/v1";

const SLSA_PROVENANCE_V02_SCHEMA: &str = include_str!("schemas/slsa_provenance_v02.json");
const SLSA_PROVENANCE_V1_SCHEMA: &str = include_str!("schemas/slsa_provenance_v1.json");

/// Compiled schema registry, keyed by predicate type. Extending support for
/// a new predicate is one more entry here.
fn schema_registry() -> &'static BTreeMap<&'static str, Validator> {
    static REGISTRY: OnceLock<BTreeMap<&'static str, Validator>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut registry = BTreeMap::new();
        for (predicate_type, source) in [
            (PREDICATE_SLSA_PROVENANCE_V02, SLSA_PROVENANCE_V02_SCHEMA),
            (PREDICATE_SLSA_PROVENANCE_V1, SLSA_PROVENANCE_V1_SCHEMA),
        ] {
            let schema: Value =
                serde_json::from_str(source).expect("embedded schema is valid JSON");
            let validator = jsonschema::options()
                .should_validate_formats(true)
                .build(&schema)
                .expect("embedded schema compiles");
            registry.insert(predicate_type, validator);
        }
        registry
    })
}

/// Validate every attestation, reporting the union of schema violations.
/// Undecodable statements surface as EV002, violations as EV003 carrying
/// one `JSON pointer: message` line per finding, grouped by schema.
pub fn validate_attestation_syntax(
    reference: &str,
    attestations: &[Attestation],
) -> Result<(), EcpError> {
    let mut violations: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for attestation in attestations {
        let statement = attestation.statement();
        if statement.is_empty() {
            return Err(EcpError::AttestationDecode {
                reference: reference.to_string(),
                cause: "unexpected end of JSON input".to_string(),
            });
        }
        let value: Value = serde_json::from_slice(statement).map_err(|e| {
            EcpError::AttestationDecode {
                reference: reference.to_string(),
                cause: e.to_string(),
            }
        })?;

        match schema_registry().get(attestation.predicate_type()) {
            Some(validator) => {
                let lines: Vec<String> = validator
                    .iter_errors(&value)
                    .map(|error| format!(" - {}: {}", error.instance_path, error))
                    .collect();
                if !lines.is_empty() {
                    violations
                        .entry(attestation.predicate_type().to_string())
                        .or_default()
                        .extend(lines);
                }
            }
            None => {
                debug!(
                    predicate_type = attestation.predicate_type(),
                    "unknown predicate type, applying statement header check"
                );
                let lines = check_statement_header(&value);
                if !lines.is_empty() {
                    violations
                        .entry("in-toto statement header".to_string())
                        .or_default()
                        .extend(lines);
                }
            }
        }
    }

    if violations.is_empty() {
        return Ok(());
    }

    let details = violations
        .into_iter()
        .map(|(schema, lines)| format!("Schema ID: {schema}\n{}", lines.join("\n")))
        .collect::<Vec<_>>()
        .join("\n");
    Err(EcpError::AttestationSyntax {
        reference: reference.to_string(),
        details,
    })
}

/// Structure-only check applied to statements with unknown predicate types.
fn check_statement_header(value: &Value) -> Vec<String> {
    let mut lines = Vec::new();
    match value.get("_type") {
        Some(Value::String(s)) if !s.is_empty() => {}
        _ => lines.push(" - /_type: a non-empty statement type is required".to_string()),
    }
    match value.get("predicateType") {
        Some(Value::String(s)) if !s.is_empty() => {}
        _ => lines.push(" - /predicateType: a non-empty predicate type is required".to_string()),
    }
    if let Some(subject) = value.get("subject") {
        if !subject.is_array() {
            lines.push(" - /subject: must be an array of resource descriptors".to_string());
        }
    }
    lines
}
