use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Postgres, Row, Transaction};

use crate::db::postgres::PostgresConnectionInfo;
use crate::db::{FinalizeReceipt, QuotaQueries, ReserveQuotaReceipt, ReserveQuotaRequest};
use crate::error::Error;
use crate::quota::ReservationHandle;

/// Creates the subject's counter row if absent and locks it, returning the
/// consumed count. Insert-or-ignore followed by lock-and-read so first-ever
/// use never surfaces a duplicate-key error on the concurrent path.
async fn lock_usage_row(
    tx: &mut Transaction<'_, Postgres>,
    subject_id: &str,
    day: NaiveDate,
    now: DateTime<Utc>,
) -> Result<u64, Error> {
    sqlx::query(
        "INSERT INTO admission.quota_usage (subject_id, day, consumed_count, updated_at) \
         VALUES ($1, $2, 0, $3) \
         ON CONFLICT (subject_id, day) DO NOTHING",
    )
    .bind(subject_id)
    .bind(day)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    let row = sqlx::query(
        "SELECT consumed_count FROM admission.quota_usage \
         WHERE subject_id = $1 AND day = $2 \
         FOR UPDATE",
    )
    .bind(subject_id)
    .bind(day)
    .fetch_one(&mut **tx)
    .await?;
    let consumed: i64 = row.try_get("consumed_count")?;
    Ok(consumed.max(0) as u64)
}

#[async_trait]
impl QuotaQueries for PostgresConnectionInfo {
    async fn release_expired_reservations(
        &self,
        subject_id: &str,
        prune_days_before: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let pool = self.get_pool_result()?;

        let swept = sqlx::query(
            "UPDATE admission.quota_reservations \
             SET status = 'released', updated_at = $2 \
             WHERE subject_id = $1 AND status = 'reserved' AND expires_at < $2",
        )
        .bind(subject_id)
        .bind(now)
        .execute(pool)
        .await?;

        // Terminal rows older than the retention horizon carry no further
        // audit value for the admission path.
        sqlx::query(
            "DELETE FROM admission.quota_reservations \
             WHERE subject_id = $1 AND day < $2 AND status <> 'reserved'",
        )
        .bind(subject_id)
        .bind(prune_days_before)
        .execute(pool)
        .await?;

        Ok(swept.rows_affected())
    }

    /// The check-then-insert runs in one transaction holding the counter row
    /// lock, so concurrent reservers for the same subject are serialized by
    /// the database and `consumed + outstanding` can never exceed the limit.
    async fn reserve_quota(
        &self,
        request: &ReserveQuotaRequest,
    ) -> Result<ReserveQuotaReceipt, Error> {
        let pool = self.get_pool_result()?;
        let mut tx = pool.begin().await?;

        let consumed = lock_usage_row(&mut tx, &request.subject_id, request.day, request.now).await?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS outstanding FROM admission.quota_reservations \
             WHERE subject_id = $1 AND day = $2 AND status = 'reserved'",
        )
        .bind(&request.subject_id)
        .bind(request.day)
        .fetch_one(&mut *tx)
        .await?;
        let outstanding: i64 = row.try_get("outstanding")?;
        let outstanding = outstanding.max(0) as u64;

        let over_outstanding_cap = request
            .max_outstanding
            .is_some_and(|cap| outstanding >= cap);
        if consumed + outstanding >= request.daily_limit || over_outstanding_cap {
            tx.rollback().await?;
            return Ok(ReserveQuotaReceipt {
                success: false,
                consumed,
                outstanding,
            });
        }

        sqlx::query(
            "INSERT INTO admission.quota_reservations \
             (id, subject_id, day, status, request_id, created_at, expires_at, updated_at) \
             VALUES ($1, $2, $3, 'reserved', $4, $5, $6, $5)",
        )
        .bind(request.reservation_id)
        .bind(&request.subject_id)
        .bind(request.day)
        .bind(request.request_id)
        .bind(request.now)
        .bind(request.expires_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(ReserveQuotaReceipt {
            success: true,
            consumed,
            outstanding: outstanding + 1,
        })
    }

    async fn finalize_reservation(
        &self,
        handle: &ReservationHandle,
        now: DateTime<Utc>,
    ) -> Result<FinalizeReceipt, Error> {
        let pool = self.get_pool_result()?;
        let mut tx = pool.begin().await?;

        let row = sqlx::query(
            "SELECT status FROM admission.quota_reservations \
             WHERE id = $1 AND subject_id = $2 AND day = $3 \
             FOR UPDATE",
        )
        .bind(handle.id)
        .bind(&handle.subject_id)
        .bind(handle.day)
        .fetch_optional(&mut *tx)
        .await?;

        let still_reserved = match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                status == "reserved"
            }
            None => false,
        };
        if !still_reserved {
            // Already resolved by a sweep or a second caller; report the
            // current count without touching anything.
            tx.rollback().await?;
            let consumed = self.get_daily_usage(&handle.subject_id, handle.day).await?;
            return Ok(FinalizeReceipt {
                finalized: false,
                consumed,
            });
        }

        let consumed = lock_usage_row(&mut tx, &handle.subject_id, handle.day, now).await?;
        sqlx::query(
            "UPDATE admission.quota_usage \
             SET consumed_count = consumed_count + 1, updated_at = $3 \
             WHERE subject_id = $1 AND day = $2",
        )
        .bind(&handle.subject_id)
        .bind(handle.day)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE admission.quota_reservations SET status = 'consumed', updated_at = $2 \
             WHERE id = $1",
        )
        .bind(handle.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(FinalizeReceipt {
            finalized: true,
            consumed: consumed + 1,
        })
    }

    async fn release_reservation(
        &self,
        handle: &ReservationHandle,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let pool = self.get_pool_result()?;

        // Single guarded UPDATE; the status predicate makes this idempotent
        // without an explicit lock-and-read.
        let result = sqlx::query(
            "UPDATE admission.quota_reservations \
             SET status = 'released', updated_at = $4 \
             WHERE id = $1 AND subject_id = $2 AND day = $3 AND status = 'reserved'",
        )
        .bind(handle.id)
        .bind(&handle.subject_id)
        .bind(handle.day)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_daily_usage(&self, subject_id: &str, day: NaiveDate) -> Result<u64, Error> {
        let pool = self.get_pool_result()?;
        let row = sqlx::query(
            "SELECT consumed_count FROM admission.quota_usage WHERE subject_id = $1 AND day = $2",
        )
        .bind(subject_id)
        .bind(day)
        .fetch_optional(pool)
        .await?;
        match row {
            Some(row) => {
                let consumed: i64 = row.try_get("consumed_count")?;
                Ok(consumed.max(0) as u64)
            }
            None => Ok(0),
        }
    }
}
