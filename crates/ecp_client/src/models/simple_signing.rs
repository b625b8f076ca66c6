// SPDX-License-Identifier: Apache-2.0

//! Payload format of simple signing, the document cosign signs for image
//! signatures. The format is documented in containers-signature.5.md in
//! the containers/image repository.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SimpleContainerImage {
    pub critical: Critical,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<Optional>,
}

/// Data critical to evaluating the validity of a signature.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Critical {
    #[serde(rename = "type", default)]
    pub type_name: String,
    pub image: Image,
    #[serde(default)]
    pub identity: Identity,
}

/// Identifies the container image the signature applies to.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Image {
    pub docker_manifest_digest: String,
}

/// The claimed identity of the image, as asserted by the signer.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Identity {
    #[serde(default)]
    pub docker_reference: String,
}

/// Optional annotations attached by the signer.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Optional {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(flatten, default)]
    pub extra: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_kebab_case_payload() {
        let payload: SimpleContainerImage = serde_json::from_str(
            r#"{
                "critical": {
                    "identity": {"docker-reference": "registry.io/repo:tag"},
                    "image": {"docker-manifest-digest": "sha256:dabbad00"},
                    "type": "atomic container signature"
                },
                "optional": {"creator": "cosign", "a": "x"}
            }"#,
        )
        .unwrap();
        assert_eq!(
            payload.critical.image.docker_manifest_digest,
            "sha256:dabbad00"
        );
        assert_eq!(payload.critical.identity.docker_reference, "registry.io/repo:tag");
        let optional = payload.optional.unwrap();
        assert_eq!(optional.creator.as_deref(), Some("cosign"));
        assert_eq!(optional.extra.get("a"), Some(&Value::String("x".into())));
    }

    #[test]
    fn digest_only_payload_is_enough() {
        let payload: SimpleContainerImage = serde_json::from_str(
            r#"{"critical":{"image":{"docker-manifest-digest":"sha256:dabbad00"}}}"#,
        )
        .unwrap();
        assert!(payload.optional.is_none());
        assert_eq!(
            payload.critical.image.docker_manifest_digest,
            "sha256:dabbad00"
        );
    }
}
