use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{IncrementBucketRequest, RateLimitQueries};
use crate::error::Error;
use crate::utils::quota_window::{minute_window_start, seconds_until_next_minute};

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_per_minute_limit")]
    pub per_minute_limit: u64,
    /// Buckets older than this are pruned opportunistically on each check.
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute_limit: default_per_minute_limit(),
            retention_minutes: default_retention_minutes(),
        }
    }
}

fn default_per_minute_limit() -> u64 {
    20
}

fn default_retention_minutes() -> i64 {
    10
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RateLimitDecision {
    Allowed {
        count: u64,
    },
    Denied {
        count: u64,
        retry_after_seconds: u64,
    },
}

impl RateLimitConfig {
    /// Answers "is this client over its per-minute cap?", incrementing the
    /// client's current minute bucket if not. The store serializes concurrent
    /// callers on the bucket row, so the count is exact across workers.
    pub async fn check_and_increment(
        &self,
        client: &impl RateLimitQueries,
        client_address: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, Error> {
        let window_start = minute_window_start(now);
        let request = IncrementBucketRequest {
            client_address: client_address.to_string(),
            window_start,
            limit: self.per_minute_limit,
            prune_before: window_start - chrono::Duration::minutes(self.retention_minutes),
            now,
        };
        let receipt = client.increment_bucket(&request).await?;
        if receipt.allowed {
            Ok(RateLimitDecision::Allowed {
                count: receipt.count,
            })
        } else {
            Ok(RateLimitDecision::Denied {
                count: receipt.count,
                retry_after_seconds: seconds_until_next_minute(now),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{IncrementBucketReceipt, MockRateLimitQueries};
    use chrono::TimeZone;

    fn test_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 10, 7, 42).unwrap()
    }

    #[tokio::test]
    async fn test_allowed_uses_minute_bucket_key() {
        let config = RateLimitConfig {
            per_minute_limit: 10,
            retention_minutes: 10,
        };
        let mut client = MockRateLimitQueries::new();
        client
            .expect_increment_bucket()
            .withf(|request| {
                request.client_address == "203.0.113.7"
                    && request.window_start
                        == Utc.with_ymd_and_hms(2026, 3, 14, 10, 7, 0).unwrap()
                    && request.limit == 10
                    && request.prune_before
                        == Utc.with_ymd_and_hms(2026, 3, 14, 9, 57, 0).unwrap()
            })
            .times(1)
            .returning(|_| {
                Box::pin(async move {
                    Ok(IncrementBucketReceipt {
                        allowed: true,
                        count: 3,
                    })
                })
            });

        let decision = config
            .check_and_increment(&client, "203.0.113.7", test_now())
            .await
            .unwrap();
        assert_eq!(decision, RateLimitDecision::Allowed { count: 3 });
    }

    #[tokio::test]
    async fn test_denied_carries_retry_after_until_next_minute() {
        let config = RateLimitConfig {
            per_minute_limit: 10,
            retention_minutes: 10,
        };
        let mut client = MockRateLimitQueries::new();
        client.expect_increment_bucket().times(1).returning(|_| {
            Box::pin(async move {
                Ok(IncrementBucketReceipt {
                    allowed: false,
                    count: 10,
                })
            })
        });

        let decision = config
            .check_and_increment(&client, "203.0.113.7", test_now())
            .await
            .unwrap();
        assert_eq!(
            decision,
            RateLimitDecision::Denied {
                count: 10,
                retry_after_seconds: 18,
            }
        );
    }
}
