// SPDX-License-Identifier: Apache-2.0

//! Retry policy for transient registry failures: capped exponential backoff,
//! applied at the call sites above the registry client so injected fakes see
//! every attempt.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::RegistryError;
use crate::runtime::CancellationToken;

const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(8);
const MAX_ATTEMPTS: u32 = 5;

/// Delay before the retry following attempt number `attempt` (zero-based).
fn backoff_delay(attempt: u32) -> Duration {
    let millis = (BASE_DELAY.as_millis() as u64).saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(millis.min(MAX_DELAY.as_millis() as u64))
}

/// Run `operation` until it succeeds, fails with a non-transient error, or
/// the attempt budget is exhausted. Exhaustion surfaces as
/// [`RegistryError::Unreachable`]. Cancellation is checked before every
/// attempt and during backoff sleeps, and is never converted into a retry.
pub async fn with_retry<T, F, Fut>(
    cancel: &CancellationToken,
    what: &str,
    mut operation: F,
) -> Result<T, RegistryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RegistryError>>,
{
    let mut last_failure = String::new();

    for attempt in 0..MAX_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        if attempt > 0 {
            let delay = backoff_delay(attempt - 1);
            debug!(what, attempt, ?delay, "retrying after transient failure");
            tokio::select! {
                _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => last_failure = err.to_string(),
            Err(err) => return Err(err),
        }
    }

    Err(RegistryError::Unreachable(format!("{what}: {last_failure}")))
}
