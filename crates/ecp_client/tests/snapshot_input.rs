// SPDX-License-Identifier: Apache-2.0

//! Input document tests: the aggregator must write a uniquely named
//! `ecp_input.<n>/input.json` whose bytes match the returned JSON, with
//! alphabetical keys and empty values omitted.

mod common;

use std::path::Path;

use serde_json::{json, Value};

use common::{dsse_candidate, harness, slsa02_statement, FakeRegistry, MockSignatures};
use ecp_client::cosign::{SignatureCandidate, TrustConfig};
use ecp_client::fileio::Filesystem;
use ecp_client::image::ImageReference;
use ecp_client::registry::{Descriptor, ImageManifest};
use ecp_client::snapshot::{ApplicationSnapshotImage, GitSource, SnapshotComponent};

fn reference() -> ImageReference {
    ImageReference::parse("registry.io/repository/image:tag").unwrap()
}

fn path_matches_input_pattern(path: &Path) -> bool {
    let mut parts = path.components().rev();
    let file = parts.next().unwrap().as_os_str().to_string_lossy().into_owned();
    let dir = parts.next().unwrap().as_os_str().to_string_lossy().into_owned();
    file == "input.json"
        && dir.starts_with("ecp_input.")
        && dir["ecp_input.".len()..].chars().all(|c| c.is_ascii_digit())
        && !dir["ecp_input.".len()..].is_empty()
}

async fn write_and_parse(
    snapshot: &ApplicationSnapshotImage,
    h: &common::TestHarness,
) -> (Value, Vec<u8>) {
    let (path, bytes) = snapshot.write_input_file(&h.ctx).unwrap();
    assert!(path_matches_input_pattern(&path), "{}", path.display());
    assert!(h.fs.exists(&path));

    // bytes on disk are identical to the returned bytes
    let on_disk = h.fs.read(&path).unwrap();
    assert_eq!(on_disk, bytes);

    (serde_json::from_slice(&bytes).unwrap(), bytes)
}

#[tokio::test]
async fn single_attestation() {
    let mut signatures = MockSignatures::default();
    signatures.attestations = vec![dsse_candidate(&slsa02_statement())];
    let h = harness(FakeRegistry::default(), signatures);

    let mut snapshot = ApplicationSnapshotImage::new(reference(), TrustConfig::default());
    snapshot.validate_attestation_signature(&h.ctx).await.unwrap();

    let (doc, _) = write_and_parse(&snapshot, &h).await;
    assert_eq!(doc["image"]["ref"], json!("registry.io/repository/image:tag"));
    let attestations = doc["attestations"].as_array().unwrap();
    assert_eq!(attestations.len(), 1);
    assert_eq!(
        attestations[0]["statement"]["predicateType"],
        json!("https://slsa.dev/provenance/v0.2")
    );
    assert_eq!(
        attestations[0]["signatures"][0]["sig"],
        json!("c2lnbmF0dXJl")
    );
}

#[tokio::test]
async fn multiple_attestations() {
    let mut signatures = MockSignatures::default();
    signatures.attestations = vec![
        dsse_candidate(&slsa02_statement()),
        dsse_candidate(&slsa02_statement()),
    ];
    let h = harness(FakeRegistry::default(), signatures);

    let mut snapshot = ApplicationSnapshotImage::new(reference(), TrustConfig::default());
    snapshot.validate_attestation_signature(&h.ctx).await.unwrap();

    let (doc, _) = write_and_parse(&snapshot, &h).await;
    assert_eq!(doc["attestations"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn image_signatures_with_certificates() {
    let mut signatures = MockSignatures::default();
    signatures.image_signatures = vec![
        SignatureCandidate {
            payload: b"{}".to_vec(),
            base64_signature: "signature1".to_string(),
            certificate: Some("certificate1".to_string()),
            chain: Some(
                "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n\
                 -----BEGIN CERTIFICATE-----\nBBBB\n-----END CERTIFICATE-----\n"
                    .to_string(),
            ),
            ..Default::default()
        },
        SignatureCandidate {
            payload: b"{}".to_vec(),
            base64_signature: "signature2".to_string(),
            ..Default::default()
        },
    ];
    signatures.attestations = vec![dsse_candidate(&slsa02_statement())];
    let h = harness(FakeRegistry::default(), signatures);

    let mut snapshot = ApplicationSnapshotImage::new(reference(), TrustConfig::default());
    snapshot.validate_image_signature(&h.ctx).await.unwrap();
    snapshot.validate_attestation_signature(&h.ctx).await.unwrap();

    let (doc, _) = write_and_parse(&snapshot, &h).await;
    let sigs = doc["image"]["signatures"].as_array().unwrap();
    assert_eq!(sigs.len(), 2);
    assert_eq!(sigs[0]["sig"], json!("signature1"));
    assert_eq!(sigs[0]["certificate"], json!("certificate1"));
    assert_eq!(sigs[0]["chain"].as_array().unwrap().len(), 2);
    assert_eq!(sigs[1]["sig"], json!("signature2"));
    assert!(sigs[1].get("certificate").is_none());
}

#[tokio::test]
async fn image_config() {
    let registry = FakeRegistry::default();
    registry.put_manifest(
        "registry.io/repository/image:tag",
        ImageManifest {
            config: Descriptor {
                media_type: "application/vnd.oci.image.config.v1+json".into(),
                digest: "sha256:config".into(),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    registry.put_blob(
        "sha256:config",
        br#"{"Labels":{"io.k8s.display-name":"Test Image"}}"#,
    );
    let h = harness(registry, MockSignatures::default());

    let mut snapshot = ApplicationSnapshotImage::new(reference(), TrustConfig::default());
    snapshot.fetch_image_config(&h.ctx).await.unwrap();

    let (doc, _) = write_and_parse(&snapshot, &h).await;
    assert_eq!(
        doc["image"]["config"]["Labels"]["io.k8s.display-name"],
        json!("Test Image")
    );
}

#[tokio::test]
async fn parent_image_config() {
    let registry = FakeRegistry::default();
    registry.put_manifest(
        "registry.io/repository/image:tag",
        ImageManifest {
            config: Descriptor {
                digest: "sha256:config".into(),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    registry.put_blob(
        "sha256:config",
        br#"{"Labels":{"org.opencontainers.image.base.name":"registry.io/repository/parent:tag"}}"#,
    );
    registry.put_manifest(
        "registry.io/repository/parent:tag",
        ImageManifest {
            config: Descriptor {
                digest: "sha256:parent-config".into(),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    registry.put_blob(
        "sha256:parent-config",
        br#"{"Labels":{"io.k8s.display-name":"Base Image"}}"#,
    );
    let h = harness(registry, MockSignatures::default());

    let mut snapshot = ApplicationSnapshotImage::new(reference(), TrustConfig::default());
    snapshot.fetch_parent_image_config(&h.ctx).await.unwrap();

    let (doc, _) = write_and_parse(&snapshot, &h).await;
    assert_eq!(
        doc["image"]["parent"]["ref"],
        json!("registry.io/repository/parent:tag")
    );
    assert_eq!(
        doc["image"]["parent"]["config"]["Labels"]["io.k8s.display-name"],
        json!("Base Image")
    );
}

#[tokio::test]
async fn missing_parent_label_is_not_an_error() {
    let registry = FakeRegistry::default();
    registry.put_manifest(
        "registry.io/repository/image:tag",
        ImageManifest {
            config: Descriptor {
                digest: "sha256:config".into(),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    registry.put_blob("sha256:config", br#"{"Labels":{}}"#);
    let h = harness(registry, MockSignatures::default());

    let mut snapshot = ApplicationSnapshotImage::new(reference(), TrustConfig::default());
    snapshot.fetch_parent_image_config(&h.ctx).await.unwrap();

    let (doc, _) = write_and_parse(&snapshot, &h).await;
    assert!(doc["image"].get("parent").is_none());
}

#[tokio::test]
async fn component_with_source() {
    let h = harness(FakeRegistry::default(), MockSignatures::default());

    let snapshot = ApplicationSnapshotImage::new(reference(), TrustConfig::default())
        .with_component(SnapshotComponent {
            container_image: "registry.io/repository/image:tag".to_string(),
            git: Some(GitSource {
                revision: "main".to_string(),
                url: "git.local/repository".to_string(),
            }),
        });

    let (doc, _) = write_and_parse(&snapshot, &h).await;
    assert_eq!(doc["image"]["source"]["git"]["url"], json!("git.local/repository"));
    assert_eq!(doc["image"]["source"]["git"]["revision"], json!("main"));
}

#[tokio::test]
async fn keys_are_alphabetical_and_empties_omitted() {
    let registry = FakeRegistry::default();
    registry.put_manifest(
        "registry.io/repository/image:tag",
        ImageManifest {
            config: Descriptor {
                digest: "sha256:config".into(),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    registry.put_blob("sha256:config", br#"{"Labels":{"a":"b"}}"#);

    let mut signatures = MockSignatures::default();
    signatures.attestations = vec![dsse_candidate(&slsa02_statement())];
    let h = harness(registry, signatures);

    let mut snapshot = ApplicationSnapshotImage::new(reference(), TrustConfig::default());
    snapshot.validate_attestation_signature(&h.ctx).await.unwrap();
    snapshot.fetch_image_config(&h.ctx).await.unwrap();

    let (doc, bytes) = write_and_parse(&snapshot, &h).await;
    let text = String::from_utf8(bytes).unwrap();

    // top level: attestations before image
    assert!(text.find("\"attestations\"").unwrap() < text.find("\"image\"").unwrap());
    // inside image: config before ref
    assert!(text.find("\"config\"").unwrap() < text.find("\"ref\"").unwrap());
    // empty collections are omitted entirely
    assert!(doc["image"].get("files").is_none());
    assert!(doc["image"].get("signatures").is_none());
    assert!(doc["image"].get("source").is_none());
}

#[tokio::test]
async fn each_write_uses_a_fresh_directory() {
    let h = harness(FakeRegistry::default(), MockSignatures::default());
    let snapshot = ApplicationSnapshotImage::new(reference(), TrustConfig::default());

    let (first, _) = snapshot.write_input_file(&h.ctx).unwrap();
    let (second, _) = snapshot.write_input_file(&h.ctx).unwrap();
    assert_ne!(first, second);
    assert!(h.fs.exists(&first));
    assert!(h.fs.exists(&second));
}
