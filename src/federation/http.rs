// SPDX-License-Identifier: Apache-2.0

//! Bounded HTTP calls for the network-backed strategies.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::engine::error::{EngineError, EngineResult};

const BACKOFF_STEP: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            max_retries,
        }
    }
}

fn is_retryable(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::Network { .. } | EngineError::Timeout { .. }
    )
}

/// Runs `attempt` under a per-attempt timeout, retrying network failures
/// with linear backoff.
pub async fn with_retries<F, Fut, T>(
    operation: &str,
    policy: RetryPolicy,
    mut attempt: F,
) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut tries = 0u32;
    loop {
        let outcome = match tokio::time::timeout(policy.timeout, attempt()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::timeout(
                operation,
                policy.timeout.as_millis() as u64,
            )),
        };

        match outcome {
            Err(err) if is_retryable(&err) && tries < policy.max_retries => {
                tries += 1;
                warn!(operation, attempt = tries, error = %err, "retrying request");
                tokio::time::sleep(BACKOFF_STEP * tries).await;
            }
            other => return other,
        }
    }
}

/// Maps a transport error, keeping timeouts distinct.
pub fn transport_error(operation: &str, timeout: Duration, err: reqwest::Error) -> EngineError {
    if err.is_timeout() {
        EngineError::timeout(operation, timeout.as_millis() as u64)
    } else {
        EngineError::network(format!("{operation}: {err}"))
    }
}

/// Fails on non-success statuses, carrying the response body.
pub async fn ensure_success(
    operation: &str,
    response: reqwest::Response,
) -> EngineResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail: String = body.chars().take(300).collect();
    if status.is_server_error() {
        Err(EngineError::network(format!("{operation}: HTTP {status}: {detail}")))
    } else {
        Err(EngineError::execution_error(format!(
            "{operation}: HTTP {status}: {detail}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_network_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(Duration::from_secs(1), 2);
        let value = with_retries("fetch", policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::network("reset"))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn configuration_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(Duration::from_secs(1), 3);
        let err = with_retries("fetch", policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(EngineError::configuration("missing host")) }
        })
        .await
        .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expiry_names_the_operation() {
        let policy = RetryPolicy::new(Duration::from_millis(10), 0);
        let err = with_retries("tab discovery", policy, || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, EngineError>(())
        })
        .await
        .unwrap_err();
        match err {
            EngineError::Timeout { operation, timeout_ms } => {
                assert_eq!(operation, "tab discovery");
                assert_eq!(timeout_ms, 10);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
