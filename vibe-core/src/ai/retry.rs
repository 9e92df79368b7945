//! Exponential backoff with jitter for retryable AI-client errors.
//!
//! Shape (max attempts, initial/max delay, multiplier) and delay formula
//! `min(maxDelay, initial * multiplier^attempt) * U(0.5, 1.0)` follow the
//! common capped-exponential-backoff-with-jitter `RetryConfig` shape.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::AiError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        let jittered = capped * rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_secs_f64(jittered)
    }
}

/// Runs `f` up to `config.max_attempts` times, sleeping with jittered
/// exponential backoff between attempts while the error stays retryable.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, mut f: F) -> Result<T, AiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AiError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt + 1 < config.max_attempts => {
                tracing::warn!(attempt, error = %e, "retrying ai call after backoff");
                tokio::time::sleep(config.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_retryable_errors_up_to_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        };
        let result = with_retry(&config, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AiError::Transport("boom".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_fatal_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::default();
        let result = with_retry(&config, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AiError::Fatal("nope".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_first_call_works() {
        let config = RetryConfig::default();
        let result: Result<u32, AiError> = with_retry(&config, || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
