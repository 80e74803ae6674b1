//! Retry utilities with exponential backoff and jitter.
//!
//! Every retry loop in the harness goes through [`retry_with_backoff_if`]:
//! client construction retries every failure, declared-state updates retry
//! only optimistic-concurrency conflicts.
//!
//! # Example
//!
//! ```ignore
//! use mcm_e2e_common::retry::retry_on_conflict;
//!
//! retry_on_conflict("MachineDeployment/test-machine-deployment", || async {
//!     let mut md = api.get("test-machine-deployment").await?;
//!     md.data["spec"]["replicas"] = 6.into();
//!     api.replace("test-machine-deployment", &PostParams::default(), &md).await?;
//!     Ok(())
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Short, bounded budget for optimistic-concurrency conflicts on update.
    ///
    /// A conflict is resolved by re-reading the object, so there is no point
    /// in backing off for long: 5 attempts, 10ms apart.
    pub fn conflict() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 1.0,
        }
    }
}

/// Execute an async operation with exponential backoff and jitter,
/// retrying every error.
///
/// Retries indefinitely (or up to max_attempts if set) until success.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, |_| true, operation).await
}

/// Execute an async operation with exponential backoff and jitter,
/// retrying only the errors `is_retryable` accepts.
///
/// Errors rejected by the predicate are returned immediately. When
/// `max_attempts` is exhausted the last error is returned.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_retryable(&e) => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                // Exponential backoff, capped at max_delay
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Run a read-modify-write against the API server, retrying on 409 Conflict.
///
/// Non-conflict errors are returned as-is. Once the [`RetryConfig::conflict`]
/// budget is spent the conflict is surfaced as [`Error::Conflict`].
pub async fn retry_on_conflict<F, Fut, T>(resource: &str, operation: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let config = RetryConfig::conflict();
    match retry_with_backoff_if(&config, resource, Error::is_conflict, operation).await {
        Err(e) if e.is_conflict() => Err(Error::Conflict {
            resource: resource.to_string(),
            attempts: config.max_attempts,
        }),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    fn conflict() -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }))
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: Result<i32, &str> =
            retry_with_backoff(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast_config(5), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast_config(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff_if(
            &fast_config(5),
            "op",
            |e: &&str| *e == "transient",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("fatal")
                }
            },
        )
        .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conflict_retry_resolves_once_the_race_clears() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = retry_on_conflict("MachineDeployment/md", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(conflict())
                } else {
                    Ok(6)
                }
            }
        })
        .await;

        assert_eq!(result.ok(), Some(6));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_conflict_retry_surfaces_conflict_error_after_budget() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), Error> = retry_on_conflict("MachineDeployment/md", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            }
        })
        .await;

        match result {
            Err(Error::Conflict { resource, attempts }) => {
                assert_eq!(resource, "MachineDeployment/md");
                assert_eq!(attempts, 5);
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_conflict_retry_passes_other_errors_through() {
        let result: Result<(), Error> = retry_on_conflict("Machine/m", || async {
            Err(Error::Yaml("broken".to_string()))
        })
        .await;

        assert!(matches!(result, Err(Error::Yaml(_))));
    }
}
