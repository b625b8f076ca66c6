// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use futures::stream::{self, StreamExt};

use crate::error::RegistryError;
use crate::retry::with_retry;
use crate::runtime::RunContext;

/// Upper bound on concurrent registry resolutions.
const RESOLVE_PARALLELISM: usize = 5;

/// A parsed registry coordinate: `registry/repository[:tag][@digest]`.
///
/// References are immutable; [`ImageReference::resolved`] returns a copy with
/// the digest filled in. Components downstream of the registry client only
/// ever see resolved references.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Full repository, including the registry host (e.g. `quay.io/org/repo`).
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference string. The repository must contain a registry host
    /// segment; a trailing `@sha256:...` digest and a `:tag` are both
    /// optional.
    pub fn parse(input: &str) -> Result<Self, RegistryError> {
        let invalid = |cause: &str| RegistryError::InvalidReference {
            reference: input.to_string(),
            cause: cause.to_string(),
        };

        let (rest, digest) = match input.split_once('@') {
            Some((rest, digest)) => {
                if !digest.contains(':') {
                    return Err(invalid("digest must be of the form algorithm:hex"));
                }
                (rest, Some(digest.to_string()))
            }
            None => (input, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to
        // a registry port.
        let (repository, tag) = match rest.rfind(':') {
            Some(idx) if idx > rest.rfind('/').unwrap_or(0) => {
                (&rest[..idx], Some(rest[idx + 1..].to_string()))
            }
            _ => (rest, None),
        };

        if repository.is_empty() {
            return Err(invalid("repository is empty"));
        }
        if !repository.contains('/') {
            return Err(invalid("reference must include a registry host"));
        }
        if let Some(tag) = &tag {
            if tag.is_empty() {
                return Err(invalid("tag is empty"));
            }
        }

        Ok(ImageReference {
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// The registry host portion of the repository.
    pub fn registry(&self) -> &str {
        self.repository.split('/').next().unwrap_or_default()
    }

    /// The repository path below the registry host.
    pub fn path(&self) -> &str {
        match self.repository.split_once('/') {
            Some((_, path)) => path,
            None => "",
        }
    }

    /// The tag or digest to use when talking to the registry, digest
    /// preferred.
    pub fn identifier(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or("latest")
    }

    pub fn is_resolved(&self) -> bool {
        self.digest.is_some()
    }

    /// Copy of this reference with `digest` filled in.
    pub fn resolved(&self, digest: impl Into<String>) -> Self {
        ImageReference {
            repository: self.repository.clone(),
            tag: self.tag.clone(),
            digest: Some(digest.into()),
        }
    }

    /// Sibling reference where cosign stores signatures (`.sig`) or
    /// attestations (`.att`) for this image, derived from the resolved
    /// digest.
    pub fn cosign_sibling(&self, suffix: &str) -> Result<ImageReference, RegistryError> {
        let digest = self.digest.as_deref().ok_or_else(|| {
            RegistryError::InvalidReference {
                reference: self.to_string(),
                cause: "reference must be resolved before triangulation".to_string(),
            }
        })?;
        Ok(ImageReference {
            repository: self.repository.clone(),
            tag: Some(format!("{}{}", digest.replace(':', "-"), suffix)),
            digest: None,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Resolve `reference` to its digest with the shared retry policy.
pub async fn resolve(
    ctx: &RunContext,
    reference: &ImageReference,
) -> Result<ImageReference, RegistryError> {
    let digest = with_retry(ctx.cancellation(), "resolve image digest", || {
        ctx.registry().head_digest(reference)
    })
    .await?;
    Ok(reference.resolved(digest))
}

/// Parse and resolve every input, preserving input order, with bounded
/// concurrency. With `strict` set each result must carry both a tag and a
/// digest, the form the bundle tracker requires.
pub async fn parse_and_resolve_all(
    ctx: &RunContext,
    urls: &[String],
    strict: bool,
) -> Result<Vec<ImageReference>, RegistryError> {
    let resolved: Vec<Result<ImageReference, RegistryError>> = stream::iter(urls.iter())
        .map(|url| async move {
            let reference = ImageReference::parse(url)?;
            let reference = if reference.is_resolved() {
                reference
            } else {
                resolve(ctx, &reference).await?
            };
            if strict && reference.tag.is_none() {
                return Err(RegistryError::InvalidReference {
                    reference: url.clone(),
                    cause: "a tag is required in addition to the digest".to_string(),
                });
            }
            Ok(reference)
        })
        .buffered(RESOLVE_PARALLELISM)
        .collect()
        .await;

    resolved.into_iter().collect()
}
