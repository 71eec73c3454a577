use async_trait::async_trait;
use sqlx::Row;

use crate::db::postgres::PostgresConnectionInfo;
use crate::db::{IncrementBucketReceipt, IncrementBucketRequest, RateLimitQueries};
use crate::error::Error;

#[async_trait]
impl RateLimitQueries for PostgresConnectionInfo {
    /// Creates the minute bucket if absent, then increments it under a row
    /// lock. A raced duplicate insert is "already exists", never an error.
    /// Over-limit requests roll back so the count reflects admitted traffic.
    async fn increment_bucket(
        &self,
        request: &IncrementBucketRequest,
    ) -> Result<IncrementBucketReceipt, Error> {
        let pool = self.get_pool_result()?;
        let mut tx = pool.begin().await?;

        // Opportunistic retention cleanup rides along with the write we're
        // already making; old windows can never be read again.
        sqlx::query("DELETE FROM admission.rate_buckets WHERE window_start < $1")
            .bind(request.prune_before)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO admission.rate_buckets (client_address, window_start, count, updated_at) \
             VALUES ($1, $2, 0, $3) \
             ON CONFLICT (client_address, window_start) DO NOTHING",
        )
        .bind(&request.client_address)
        .bind(request.window_start)
        .bind(request.now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            "SELECT count FROM admission.rate_buckets \
             WHERE client_address = $1 AND window_start = $2 \
             FOR UPDATE",
        )
        .bind(&request.client_address)
        .bind(request.window_start)
        .fetch_one(&mut *tx)
        .await?;
        let count: i64 = row.try_get("count")?;
        let count = count.max(0) as u64;

        if count >= request.limit {
            tx.rollback().await?;
            return Ok(IncrementBucketReceipt {
                allowed: false,
                count,
            });
        }

        sqlx::query(
            "UPDATE admission.rate_buckets SET count = count + 1, updated_at = $3 \
             WHERE client_address = $1 AND window_start = $2",
        )
        .bind(&request.client_address)
        .bind(request.window_start)
        .bind(request.now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(IncrementBucketReceipt {
            allowed: true,
            count: count + 1,
        })
    }
}
