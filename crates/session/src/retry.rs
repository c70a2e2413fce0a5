use std::future::Future;
use tokio::time::Instant;
use tracing::{debug, warn};

use moltlink_core::{RetryConfig, TransportError};

use crate::error::{Result, SessionError};

/// Run a transport call, absorbing transient failures.
///
/// `Unavailable` is retried with exponential backoff until `max_attempts` calls
/// have failed. `RateLimited` waits at least `rate_limit_delay` and draws on its
/// own budget. No wait is started that would end after `deadline`.
pub async fn with_retry<T, F, Fut>(
    retry: &RetryConfig,
    operation: &'static str,
    deadline: Option<Instant>,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, TransportError>>,
{
    let mut attempts = 0u32;
    let mut waits = 0u32;

    loop {
        let delay = match call().await {
            Ok(value) => return Ok(value),
            Err(TransportError::Unavailable(reason)) => {
                attempts += 1;
                if attempts >= retry.max_attempts {
                    warn!("{} failed after {} attempts: {}", operation, attempts, reason);
                    return Err(SessionError::TransportUnavailable {
                        operation,
                        attempts,
                        last_error: reason,
                    });
                }
                let delay = retry.backoff(attempts);
                debug!(
                    "{} unavailable ({}), retry {}/{} in {:?}",
                    operation, reason, attempts, retry.max_attempts, delay
                );
                if past(deadline, delay) {
                    return Err(SessionError::TransportUnavailable {
                        operation,
                        attempts,
                        last_error: reason,
                    });
                }
                delay
            }
            Err(TransportError::RateLimited { retry_after_ms }) => {
                waits += 1;
                if waits > retry.max_rate_limit_waits {
                    warn!("{} still rate limited after {} back-offs", operation, waits - 1);
                    return Err(SessionError::RateLimited {
                        operation,
                        waits: waits - 1,
                    });
                }
                let delay = retry.rate_limit_wait(retry_after_ms);
                debug!("{} rate limited, backing off {:?}", operation, delay);
                if past(deadline, delay) {
                    return Err(SessionError::RateLimited { operation, waits });
                }
                delay
            }
        };

        tokio::time::sleep(delay).await;
    }
}

fn past(deadline: Option<Instant>, delay: std::time::Duration) -> bool {
    deadline.is_some_and(|deadline| Instant::now() + delay > deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
            rate_limit_delay_ms: 2,
            max_rate_limit_waits: 2,
        }
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(), "publish", None, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TransportError::Unavailable("flaky".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(), "publish", None, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Unavailable("down".into()))
        })
        .await;

        assert_eq!(
            result,
            Err(SessionError::TransportUnavailable {
                operation: "publish",
                attempts: 3,
                last_error: "down".into(),
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rate_limits_use_separate_budget() {
        let calls = AtomicU32::new(0);
        // two quota rejections and two outages: neither budget is exhausted
        let result = with_retry(&fast(), "list", None, || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 2 => Err(TransportError::RateLimited { retry_after_ms: None }),
                1 | 3 => Err(TransportError::Unavailable("blip".into())),
                _ => Ok("ok"),
            }
        })
        .await;

        assert_eq!(result, Ok("ok"));
    }

    #[tokio::test]
    async fn test_rate_limit_budget_exhausted() {
        let result: Result<()> = with_retry(&fast(), "search", None, || async {
            Err(TransportError::RateLimited { retry_after_ms: Some(1) })
        })
        .await;

        assert_eq!(
            result,
            Err(SessionError::RateLimited {
                operation: "search",
                waits: 2,
            })
        );
    }

    #[tokio::test]
    async fn test_deadline_cuts_waiting_short() {
        let retry = RetryConfig {
            base_delay_ms: 10_000,
            max_delay_ms: 10_000,
            ..fast()
        };
        let deadline = Instant::now() + Duration::from_millis(50);
        let started = Instant::now();

        let result: Result<()> = with_retry(&retry, "list", Some(deadline), || async {
            Err(TransportError::Unavailable("down".into()))
        })
        .await;

        assert!(matches!(
            result,
            Err(SessionError::TransportUnavailable { attempts: 1, .. })
        ));
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
