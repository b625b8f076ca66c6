// SPDX-License-Identifier: Apache-2.0

//! Classifies a Tekton bundle image into the tracker collections it belongs
//! to. A bundle is a pipeline bundle if it packages a `Pipeline` resource
//! and a task bundle if it packages a `Task`; one bundle may be both.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, warn};

use crate::error::EcpError;
use crate::image::ImageReference;
use crate::layers::{maybe_gunzip, tar_entries};
use crate::retry::with_retry;
use crate::runtime::RunContext;

/// Layer annotation used by `tkn bundle push` to name the packaged resource
/// kind.
const TEKTON_KIND_ANNOTATION: &str = "dev.tekton.image.kind";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Collection {
    PipelineBundles,
    TaskBundles,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::PipelineBundles => "pipeline-bundles",
            Collection::TaskBundles => "task-bundles",
        }
    }

    fn from_kind(kind: &str) -> Option<Collection> {
        match kind.to_ascii_lowercase().as_str() {
            "pipeline" => Some(Collection::PipelineBundles),
            "task" => Some(Collection::TaskBundles),
            _ => None,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The collections a bundle belongs to.
#[derive(Debug, Default)]
pub struct BundleInfo {
    pub collections: BTreeSet<Collection>,
}

/// Inspect the bundle's manifest and layers to determine its collections.
/// Layer annotations are preferred; unannotated layers are fetched and their
/// YAML documents scanned for `kind`.
pub async fn bundle_info(
    ctx: &RunContext,
    reference: &ImageReference,
) -> Result<BundleInfo, EcpError> {
    let manifest = with_retry(ctx.cancellation(), "fetch bundle manifest", || {
        let registry = ctx.registry_handle();
        let reference = reference.clone();
        async move { registry.pull_manifest(&reference).await }
    })
    .await
    .map_err(|e| EcpError::image_access(reference.to_string(), e))?;

    let mut info = BundleInfo::default();
    for layer in &manifest.layers {
        if let Some(kind) = layer
            .annotations
            .as_ref()
            .and_then(|a| a.get(TEKTON_KIND_ANNOTATION))
        {
            match Collection::from_kind(kind) {
                Some(collection) => {
                    debug!(%reference, %collection, "bundle layer annotated");
                    info.collections.insert(collection);
                }
                None => warn!(%reference, kind, "ignoring layer with unexpected resource kind"),
            }
            continue;
        }

        let blob = with_retry(ctx.cancellation(), "fetch bundle layer", || {
            let registry = ctx.registry_handle();
            let reference = reference.clone();
            let digest = layer.digest.clone();
            async move { registry.pull_blob(&reference, &digest).await }
        })
        .await
        .map_err(|e| EcpError::image_access(reference.to_string(), e))?;

        for kind in layer_resource_kinds(&blob) {
            if let Some(collection) = Collection::from_kind(&kind) {
                info.collections.insert(collection);
            }
        }
    }

    if info.collections.is_empty() {
        warn!(%reference, "bundle contains no Tekton Pipeline or Task resources");
    }
    Ok(info)
}

/// Resource kinds declared in the YAML documents of a layer blob. Handles
/// gzip-compressed layers, tarred layers, and bare YAML documents.
fn layer_resource_kinds(blob: &[u8]) -> Vec<String> {
    let contents = maybe_gunzip(blob);
    let documents: Vec<Vec<u8>> = match tar_entries(&contents) {
        Some(entries) => entries.into_iter().map(|(_, bytes)| bytes).collect(),
        None => vec![contents],
    };

    let mut kinds = Vec::new();
    for document in documents {
        let Ok(text) = std::str::from_utf8(&document) else {
            continue;
        };
        // multi-document YAML streams are split on the document separator
        for chunk in text.split("\n---") {
            if let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(chunk) {
                if let Some(kind) = value.get("kind").and_then(serde_yaml::Value::as_str) {
                    kinds.push(kind.to_string());
                }
            }
        }
    }
    kinds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_collections() {
        assert_eq!(
            Collection::from_kind("pipeline"),
            Some(Collection::PipelineBundles)
        );
        assert_eq!(Collection::from_kind("Task"), Some(Collection::TaskBundles));
        assert_eq!(Collection::from_kind("TaskRun"), None);
    }

    #[test]
    fn bare_yaml_layer_kinds() {
        let kinds = layer_resource_kinds(b"apiVersion: tekton.dev/v1\nkind: Task\n");
        assert_eq!(kinds, vec!["Task".to_string()]);
    }

    #[test]
    fn multi_document_yaml_layer_kinds() {
        let kinds = layer_resource_kinds(
            b"apiVersion: tekton.dev/v1\nkind: Pipeline\n\n---\napiVersion: tekton.dev/v1\nkind: Task\n",
        );
        assert_eq!(kinds, vec!["Pipeline".to_string(), "Task".to_string()]);
    }

    #[test]
    fn tarred_layer_kinds() {
        let tar = crate::layers::tests::tar_with(&[
            ("pipeline.yaml", b"kind: Pipeline\n"),
            ("task.yaml", b"kind: Task\n"),
        ]);
        let mut kinds = layer_resource_kinds(&tar);
        kinds.sort();
        assert_eq!(kinds, vec!["Pipeline".to_string(), "Task".to_string()]);
    }

    #[test]
    fn binary_layers_yield_no_kinds() {
        assert!(layer_resource_kinds(&[0u8, 159, 146, 150]).is_empty());
    }
}
