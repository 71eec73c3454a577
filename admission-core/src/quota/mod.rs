//! The daily quota ledger: a reserve -> finalize/release protocol over the
//! shared store, so failed or abandoned attempts never consume quota.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{FinalizeReceipt, QuotaQueries, ReserveQuotaRequest};
use crate::error::Error;
use crate::utils::quota_window::QuotaWindow;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QuotaConfig {
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,
    /// How long a reservation may stay `reserved` before the sweep reclaims
    /// it. Bounds the quota held by a crashed worker to this window.
    #[serde(default = "default_reservation_ttl_s")]
    pub reservation_ttl_s: u64,
    /// Terminal reservation rows older than this are pruned during the sweep.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Optional cap on concurrently outstanding reservations per subject.
    #[serde(default)]
    pub max_outstanding: Option<u64>,
    /// Subjects that bypass quota entirely (rate limiting still applies).
    #[serde(default)]
    pub exempt_subjects: Vec<String>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            reservation_ttl_s: default_reservation_ttl_s(),
            retention_days: default_retention_days(),
            max_outstanding: None,
            exempt_subjects: Vec::new(),
        }
    }
}

fn default_daily_limit() -> u64 {
    5
}

fn default_reservation_ttl_s() -> u64 {
    600
}

fn default_retention_days() -> u32 {
    7
}

/// A provisional hold against a subject's daily quota. Resolved exactly once:
/// `finalize` on success, `release` on any failure path.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReservationHandle {
    pub id: Uuid,
    pub subject_id: String,
    pub day: NaiveDate,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReserveOutcome {
    Reserved(ReservationHandle),
    Denied {
        consumed: u64,
        reserved: u64,
        retry_after_seconds: u64,
    },
}

impl QuotaConfig {
    pub fn is_exempt(&self, subject_id: &str) -> bool {
        self.exempt_subjects.iter().any(|s| s == subject_id)
    }

    /// Answers "may this subject start one more costly operation today?" by
    /// inserting a `reserved` row if `consumed + outstanding` is under the
    /// limit. The check-then-insert is atomic in the store; expired
    /// reservations are swept first so they never count toward outstanding.
    pub async fn reserve(
        &self,
        client: &impl QuotaQueries,
        window: &QuotaWindow,
        subject_id: &str,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, Error> {
        let prune_days_before = window.day - Duration::days(i64::from(self.retention_days));
        if let Err(e) = client
            .release_expired_reservations(subject_id, prune_days_before, now)
            .await
        {
            // The reserve transaction is still safe without the sweep; stale
            // rows just keep counting toward outstanding until the next pass.
            tracing::warn!(subject_id, "Failed to sweep expired reservations: {e}");
        }

        let request = ReserveQuotaRequest {
            reservation_id: Uuid::now_v7(),
            subject_id: subject_id.to_string(),
            day: window.day,
            daily_limit: self.daily_limit,
            max_outstanding: self.max_outstanding,
            request_id,
            expires_at: now + Duration::seconds(self.reservation_ttl_s as i64),
            now,
        };
        let receipt = client.reserve_quota(&request).await?;
        if receipt.success {
            Ok(ReserveOutcome::Reserved(ReservationHandle {
                id: request.reservation_id,
                subject_id: request.subject_id,
                day: request.day,
            }))
        } else {
            Ok(ReserveOutcome::Denied {
                consumed: receipt.consumed,
                reserved: receipt.outstanding,
                retry_after_seconds: window.retry_after_seconds,
            })
        }
    }

    /// Consumes a reservation, incrementing the day's counter. Idempotent:
    /// a reservation that is no longer `reserved` is left untouched.
    /// This is the only path that increments `consumed_count`.
    pub async fn finalize(
        &self,
        client: &impl QuotaQueries,
        handle: &ReservationHandle,
        now: DateTime<Utc>,
    ) -> Result<FinalizeReceipt, Error> {
        let receipt = client.finalize_reservation(handle, now).await?;
        if !receipt.finalized {
            tracing::warn!(
                subject_id = %handle.subject_id,
                reservation_id = %handle.id,
                "Reservation was already resolved before finalize",
            );
        }
        Ok(receipt)
    }

    /// Returns a reservation without consuming quota. Idempotent.
    pub async fn release(
        &self,
        client: &impl QuotaQueries,
        handle: &ReservationHandle,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        client.release_reservation(handle, now).await
    }

    /// Read-only consumed count for the subject's current day.
    pub async fn current_usage(
        &self,
        client: &impl QuotaQueries,
        window: &QuotaWindow,
        subject_id: &str,
    ) -> Result<u64, Error> {
        client.get_daily_usage(subject_id, window.day).await
    }
}
