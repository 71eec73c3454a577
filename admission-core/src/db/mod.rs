use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::quota::ReservationHandle;

pub mod fake_store;
pub mod postgres;

pub use postgres::PostgresConnectionInfo;

/// Storage operations backing the per-client minute rate limiter.
///
/// The whole check-and-increment runs as one atomic operation on the store so
/// concurrent workers are serialized by the database row lock, not by any
/// in-process state.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait RateLimitQueries: Send + Sync {
    async fn increment_bucket(
        &self,
        request: &IncrementBucketRequest,
    ) -> Result<IncrementBucketReceipt, Error>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct IncrementBucketRequest {
    pub client_address: String,
    pub window_start: DateTime<Utc>,
    /// Checked under the row lock so the compare-and-increment is atomic.
    pub limit: u64,
    /// Buckets with `window_start` before this are pruned opportunistically.
    pub prune_before: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IncrementBucketReceipt {
    pub allowed: bool,
    /// The bucket count after the operation (unchanged when denied).
    pub count: u64,
}

/// Storage operations backing the daily quota ledger.
///
/// `reserve_quota` is the crux: its check-then-insert executes in a single
/// transaction holding the subject's counter row lock, so the effective
/// `consumed + outstanding` can never exceed the limit under concurrency.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait QuotaQueries: Send + Sync {
    /// Sweeps the subject's expired `reserved` rows to `released` and prunes
    /// terminal rows from days before `prune_days_before`. Idempotent.
    async fn release_expired_reservations(
        &self,
        subject_id: &str,
        prune_days_before: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<u64, Error>;

    async fn reserve_quota(
        &self,
        request: &ReserveQuotaRequest,
    ) -> Result<ReserveQuotaReceipt, Error>;

    async fn finalize_reservation(
        &self,
        handle: &ReservationHandle,
        now: DateTime<Utc>,
    ) -> Result<FinalizeReceipt, Error>;

    /// Returns whether the reservation transitioned `reserved -> released`.
    /// A `false` return means it was already resolved; that is not an error.
    async fn release_reservation(
        &self,
        handle: &ReservationHandle,
        now: DateTime<Utc>,
    ) -> Result<bool, Error>;

    async fn get_daily_usage(&self, subject_id: &str, day: NaiveDate) -> Result<u64, Error>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReserveQuotaRequest {
    pub reservation_id: Uuid,
    pub subject_id: String,
    pub day: NaiveDate,
    pub daily_limit: u64,
    /// Optional cap on concurrently outstanding reservations per subject.
    pub max_outstanding: Option<u64>,
    pub request_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReserveQuotaReceipt {
    pub success: bool,
    pub consumed: u64,
    /// `reserved` rows for the subject's day, including the new one on success.
    pub outstanding: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FinalizeReceipt {
    /// False when the reservation was no longer `reserved` (idempotent no-op).
    pub finalized: bool,
    pub consumed: u64,
}
