// SPDX-License-Identifier: Apache-2.0

//! Per-invocation context. Instead of process globals, every operation
//! receives its registry client, signature client, filesystem, and
//! cancellation token through a [`RunContext`] value; tests swap in fakes.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::cosign::{CosignClient, SignatureClient};
use crate::error::EcpError;
use crate::fileio::{Filesystem, OsFs};
use crate::registry::{OciRegistryClient, RegistryClient};

/// Cooperative cancellation flag shared across an invocation. Once
/// cancelled, in-flight registry calls and backoff sleeps abort with a
/// `Cancelled` error.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Handle bundle threaded through every core operation.
#[derive(Clone)]
pub struct RunContext {
    registry: Arc<dyn RegistryClient>,
    signatures: Arc<dyn SignatureClient>,
    fs: Arc<dyn Filesystem>,
    cancel: CancellationToken,
}

impl RunContext {
    /// Production wiring: HTTP registry client (optionally trusting an extra
    /// root CA bundle), cosign signature client on top of it, OS filesystem.
    pub fn for_production(extra_root_ca: Option<&Path>) -> Result<Self, EcpError> {
        let cancel = CancellationToken::default();
        let registry: Arc<dyn RegistryClient> =
            Arc::new(OciRegistryClient::new(extra_root_ca).map_err(EcpError::Configuration)?);
        let signatures: Arc<dyn SignatureClient> =
            Arc::new(CosignClient::new(registry.clone(), cancel.clone()));
        Ok(RunContext {
            registry,
            signatures,
            fs: Arc::new(OsFs),
            cancel,
        })
    }

    /// Explicit wiring, used by tests and embedders. The signature client is
    /// not derived from the registry client here; callers supply both.
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        signatures: Arc<dyn SignatureClient>,
        fs: Arc<dyn Filesystem>,
        cancel: CancellationToken,
    ) -> Self {
        RunContext {
            registry,
            signatures,
            fs,
            cancel,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn RegistryClient>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_signatures(mut self, signatures: Arc<dyn SignatureClient>) -> Self {
        self.signatures = signatures;
        self
    }

    pub fn with_filesystem(mut self, fs: Arc<dyn Filesystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn registry(&self) -> &dyn RegistryClient {
        self.registry.as_ref()
    }

    pub fn registry_handle(&self) -> Arc<dyn RegistryClient> {
        self.registry.clone()
    }

    pub fn signatures(&self) -> &dyn SignatureClient {
        self.signatures.as_ref()
    }

    pub fn fs(&self) -> &dyn Filesystem {
        self.fs.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_resolves_after_cancel() {
        let token = CancellationToken::default();
        assert!(!token.is_cancelled());

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        token.cancel();
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn token_resolves_immediately_when_already_cancelled() {
        let token = CancellationToken::default();
        token.cancel();
        token.cancelled().await;
    }
}
