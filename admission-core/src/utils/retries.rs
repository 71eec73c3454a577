use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};

use crate::error::Error;

/*
 * Retry policy for the external call, configured via RetryConfig in the TOML.
 * Certain errors (rate limiting, storage failures) are non-retryable and
 * short-circuit the loop.
 *
 * Built on the backon crate; backon is used only in this file so every caller
 * goes through RetryConfig.
 */

#[derive(Debug, Deserialize, Copy, Clone, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_num_retries")]
    pub num_retries: usize,
    #[serde(default = "default_base_delay_s")]
    pub base_delay_s: f32,
    #[serde(default = "default_max_delay_s")]
    pub max_delay_s: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            num_retries: default_num_retries(),
            base_delay_s: default_base_delay_s(),
            max_delay_s: default_max_delay_s(),
        }
    }
}

fn default_num_retries() -> usize {
    1
}

fn default_base_delay_s() -> f32 {
    1.5
}

fn default_max_delay_s() -> f32 {
    10.0
}

impl RetryConfig {
    /// Runs `func` up to `num_retries + 1` times, sleeping between attempts
    /// with exponential backoff plus jitter so concurrently throttled workers
    /// don't retry in lockstep. Non-retryable errors short-circuit.
    pub fn retry<R, F: Future<Output = Result<R, Error>>>(
        &self,
        func: impl FnMut() -> F,
    ) -> impl Future<Output = Result<R, Error>> {
        let backoff = self.get_backoff();
        func.retry(backoff).when(Error::is_retryable)
    }

    fn get_backoff(&self) -> backon::ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs_f32(self.base_delay_s))
            .with_jitter()
            .with_max_delay(Duration::from_secs_f32(self.max_delay_s))
            .with_max_times(self.num_retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorDetails;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_retries(num_retries: usize) -> RetryConfig {
        RetryConfig {
            num_retries,
            base_delay_s: 0.001,
            max_delay_s: 0.01,
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let attempts = AtomicUsize::new(0);
        let result: Result<u32, Error> = fast_retries(3)
            .retry(|| async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::new(ErrorDetails::InferenceClient {
                        message: "connection reset".to_string(),
                        target_name: "primary".to_string(),
                    }))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_retry_budget() {
        let attempts = AtomicUsize::new(0);
        let result: Result<u32, Error> = fast_retries(2)
            .retry(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::new(ErrorDetails::InferenceClient {
                    message: "connection reset".to_string(),
                    target_name: "primary".to_string(),
                }))
            })
            .await;
        assert!(result.is_err());
        // num_retries = 2 means 3 attempts total
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_short_circuits() {
        let attempts = AtomicUsize::new(0);
        let result: Result<u32, Error> = fast_retries(5)
            .retry(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::new(ErrorDetails::Config {
                    message: "bad config".to_string(),
                }))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
