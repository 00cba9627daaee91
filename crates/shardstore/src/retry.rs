// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caller-side retry and deadline helpers.
//!
//! The store never retries on its own. A retryable error (lock contention, timeout,
//! transient connection failure) means the whole transaction was lost, so the
//! closure handed to [`retry_transient`] must open and commit a fresh transaction
//! on every attempt.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Result, StoreError};

/// Bounded exponential backoff for retryable store errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Sleep before the first retry.
    pub initial_backoff: Duration,
    /// Ceiling for the doubled backoff.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(250),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy
/// runs out of retries.
///
/// ```ignore
/// let policy = RetryPolicy::default();
/// retry_transient("advance_workflow", &policy, || async {
///     let mut tx = store.begin(shard_id).await?;
///     tx.write_lock_execution(&key).await?;
///     tx.update_execution(&record).await?;
///     tx.commit().await
/// })
/// .await?;
/// ```
pub async fn retry_transient<T, Op, Fut>(
    operation: &'static str,
    policy: &RetryPolicy,
    mut op: Op,
) -> Result<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    let mut backoff = policy.initial_backoff;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries && err.is_retryable() => {
                attempt += 1;
                warn!(
                    operation,
                    attempt,
                    error_code = err.error_code(),
                    error = %err,
                    "Retryable store error; retrying transaction"
                );
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff.saturating_mul(2), policy.max_backoff);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Fail with a retryable [`StoreError::Timeout`] if `fut` does not finish within
/// `deadline`. The abandoned future is dropped, which rolls back any transaction
/// it owned.
pub async fn with_deadline<T, Fut>(operation: &str, deadline: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, deadline_ms = deadline.as_millis() as u64, "Deadline elapsed");
            Err(StoreError::Timeout {
                operation: operation.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn contention() -> StoreError {
        StoreError::LockContention {
            operation: "write_lock_execution".to_string(),
            details: "database is locked".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let value = retry_transient("op", &RetryPolicy::default(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(contention())
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

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let err = retry_transient("op", &RetryPolicy::default(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(contention())
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.error_code(), "LOCK_CONTENTION");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let err = retry_transient("op", &RetryPolicy::default(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::conflict("insert_current_execution", "duplicate key"))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.error_code(), "CONFLICT");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_times_out() {
        let err = with_deadline("slow_scan", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StoreError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_with_deadline_passes_through() {
        let value = with_deadline("fast", Duration::from_secs(1), async { Ok(3) })
            .await
            .unwrap();
        assert_eq!(value, 3);

        let err = with_deadline("fast", Duration::from_secs(1), async {
            Err::<(), _>(StoreError::validation("page_size", "must be greater than zero"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }
}
