use crate::error::{Result, SweepError};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "initial_backoff_ms")]
    pub initial_backoff: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "max_backoff_ms")]
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempts run out. Exhaustion is reported as
    /// [`SweepError::EmbeddingUnavailable`] for `model`.
    pub async fn run<F, Fut, T>(&self, model: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_retryable() => return Err(error),
                Err(error) => {
                    if attempt + 1 < attempts {
                        let backoff = self.backoff(attempt);
                        debug!(
                            model,
                            attempt = attempt + 1,
                            max_attempts = attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %error,
                            "retrying embedding call after backoff"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    last_error = Some(error);
                }
            }
        }

        Err(SweepError::EmbeddingUnavailable {
            model: model.to_string(),
            attempts,
            reason: last_error
                .map(|error| error.to_string())
                .unwrap_or_else(|| "no attempt was made".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    fn rate_limited() -> SweepError {
        SweepError::Transient {
            backend: "remote".to_string(),
            details: "429".to_string(),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(250));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(10), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() -> Result<()> {
        let calls = &AtomicU32::new(0);
        let value = fast()
            .run("m", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(rate_limited())
                } else {
                    Ok(7)
                }
            })
            .await?;
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn exhaustion_becomes_embedding_unavailable() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = fast()
            .run("m", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(rate_limited())
            })
            .await;
        assert!(matches!(
            result,
            Err(SweepError::EmbeddingUnavailable { attempts: 3, ref model, .. }) if model == "m"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = fast()
            .run("m", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SweepError::BackendResponse {
                    backend: "remote".to_string(),
                    details: "401".to_string(),
                })
            })
            .await;
        assert!(matches!(result, Err(SweepError::BackendResponse { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
