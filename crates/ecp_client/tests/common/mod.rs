// SPDX-License-Identifier: Apache-2.0

//! Shared fakes for integration tests: an in-memory registry, a scriptable
//! signature client, and a context wired to the in-memory filesystem.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};

use ecp_client::cosign::{CheckOpts, SignatureCandidate, SignatureClient};
use ecp_client::error::{RegistryError, VerifyError};
use ecp_client::fileio::MemFs;
use ecp_client::image::ImageReference;
use ecp_client::registry::{ImageManifest, RegistryClient};
use ecp_client::runtime::{CancellationToken, RunContext};

#[derive(Default)]
pub struct FakeRegistry {
    pub digest: Mutex<Option<String>>,
    pub manifests: Mutex<BTreeMap<String, ImageManifest>>,
    pub blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    /// Number of transient failures to inject before HEAD succeeds.
    pub head_failures: AtomicU32,
    pub head_calls: AtomicU32,
}

impl FakeRegistry {
    pub fn with_digest(digest: &str) -> Self {
        FakeRegistry {
            digest: Mutex::new(Some(digest.to_string())),
            ..Default::default()
        }
    }

    pub fn put_manifest(&self, reference: &str, manifest: ImageManifest) {
        self.manifests
            .lock()
            .unwrap()
            .insert(reference.to_string(), manifest);
    }

    pub fn put_blob(&self, digest: &str, contents: &[u8]) {
        self.blobs
            .lock()
            .unwrap()
            .insert(digest.to_string(), contents.to_vec());
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn head_digest(&self, reference: &ImageReference) -> Result<String, RegistryError> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.head_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.head_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RegistryError::Transient("timed out".to_string()));
        }
        self.digest
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| RegistryError::NotFound(reference.to_string()))
    }

    async fn pull_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<ImageManifest, RegistryError> {
        self.manifests
            .lock()
            .unwrap()
            .get(&reference.to_string())
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(reference.to_string()))
    }

    async fn pull_blob(
        &self,
        _reference: &ImageReference,
        digest: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        self.blobs
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(digest.to_string()))
    }
}

/// A signature client whose results are scripted by each test.
#[derive(Default)]
pub struct MockSignatures {
    pub image_signatures: Vec<SignatureCandidate>,
    pub attestations: Vec<SignatureCandidate>,
    pub fail_signatures_with_no_signatures: bool,
}

#[async_trait]
impl SignatureClient for MockSignatures {
    async fn verify_image_signatures(
        &self,
        _reference: &ImageReference,
        _opts: &CheckOpts,
    ) -> Result<(Vec<SignatureCandidate>, bool), VerifyError> {
        if self.fail_signatures_with_no_signatures {
            return Err(VerifyError::NoSignaturesFound);
        }
        Ok((self.image_signatures.clone(), false))
    }

    async fn verify_image_attestations(
        &self,
        _reference: &ImageReference,
        _opts: &CheckOpts,
    ) -> Result<(Vec<SignatureCandidate>, bool), VerifyError> {
        Ok((self.attestations.clone(), false))
    }
}

pub struct TestHarness {
    pub registry: Arc<FakeRegistry>,
    pub signatures: Arc<MockSignatures>,
    pub fs: Arc<MemFs>,
    pub cancel: CancellationToken,
    pub ctx: RunContext,
}

pub fn harness(registry: FakeRegistry, signatures: MockSignatures) -> TestHarness {
    let registry = Arc::new(registry);
    let signatures = Arc::new(signatures);
    let fs = Arc::new(MemFs::new());
    let cancel = CancellationToken::default();
    let ctx = RunContext::new(
        registry.clone(),
        signatures.clone(),
        fs.clone(),
        cancel.clone(),
    );
    TestHarness {
        registry,
        signatures,
        fs,
        cancel,
        ctx,
    }
}

/// An attestation candidate wrapping `statement` in a DSSE envelope, the
/// shape the cosign client hands to the decoder.
pub fn dsse_candidate(statement: &Value) -> SignatureCandidate {
    let payload = STANDARD.encode(serde_json::to_vec(statement).unwrap());
    SignatureCandidate {
        payload: serde_json::to_vec(&json!({
            "payload": payload,
            "payloadType": "application/vnd.in-toto+json",
            "signatures": [{"sig": "c2lnbmF0dXJl", "keyid": ""}]
        }))
        .unwrap(),
        media_type: "application/vnd.dsse.envelope.v1+json".to_string(),
        ..Default::default()
    }
}

/// A minimal SLSA v0.2 provenance statement of the kind Tekton Chains
/// produces for a pipeline run.
pub fn slsa02_statement() -> Value {
    json!({
        "_type": "https://in-toto.io/Statement/v0.1",
        "predicateType": "https://slsa.dev/provenance/v0.2",
        "subject": [{"name": "hello", "digest": {"sha256": "dabbad00"}}],
        "predicate": {
            "builder": {"id": "https://tekton.dev/chains/v2"},
            "buildType": "https://tekton.dev/attestations/chains/pipelinerun@v2"
        }
    })
}
