//! Simple in-memory implementation of the storage traits for testing.
//!
//! Every operation holds one lock for its whole duration, serializing
//! concurrent callers the way the row-locked Postgres transactions do. This
//! makes it suitable for exercising the admission components, including their
//! concurrency properties, without a database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::{
    FinalizeReceipt, IncrementBucketReceipt, IncrementBucketRequest, QuotaQueries,
    RateLimitQueries, ReserveQuotaReceipt, ReserveQuotaRequest,
};
use crate::error::Error;
use crate::quota::ReservationHandle;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FakeReservationStatus {
    Reserved,
    Consumed,
    Released,
}

#[derive(Clone, Debug)]
struct FakeReservation {
    subject_id: String,
    day: NaiveDate,
    status: FakeReservationStatus,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct FakeState {
    buckets: HashMap<(String, DateTime<Utc>), u64>,
    usage: HashMap<(String, NaiveDate), u64>,
    reservations: HashMap<Uuid, FakeReservation>,
}

#[derive(Clone, Debug, Default)]
pub struct FakeAdmissionStore {
    state: Arc<Mutex<FakeState>>,
}

impl FakeAdmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reservation_status(&self, id: Uuid) -> Option<FakeReservationStatus> {
        let state = self.state.lock().await;
        state.reservations.get(&id).map(|r| r.status)
    }

    /// `reserved` rows for the subject's day.
    pub async fn outstanding(&self, subject_id: &str, day: NaiveDate) -> u64 {
        let state = self.state.lock().await;
        count_outstanding(&state, subject_id, day)
    }

    pub async fn bucket_count(&self, client_address: &str, window_start: DateTime<Utc>) -> u64 {
        let state = self.state.lock().await;
        state
            .buckets
            .get(&(client_address.to_string(), window_start))
            .copied()
            .unwrap_or(0)
    }
}

fn count_outstanding(state: &FakeState, subject_id: &str, day: NaiveDate) -> u64 {
    state
        .reservations
        .values()
        .filter(|r| {
            r.subject_id == subject_id
                && r.day == day
                && r.status == FakeReservationStatus::Reserved
        })
        .count() as u64
}

#[async_trait]
impl RateLimitQueries for FakeAdmissionStore {
    async fn increment_bucket(
        &self,
        request: &IncrementBucketRequest,
    ) -> Result<IncrementBucketReceipt, Error> {
        let mut state = self.state.lock().await;
        state.buckets.retain(|key, _| key.1 >= request.prune_before);
        let count = state
            .buckets
            .entry((request.client_address.clone(), request.window_start))
            .or_insert(0);
        if *count >= request.limit {
            return Ok(IncrementBucketReceipt {
                allowed: false,
                count: *count,
            });
        }
        *count += 1;
        Ok(IncrementBucketReceipt {
            allowed: true,
            count: *count,
        })
    }
}

#[async_trait]
impl QuotaQueries for FakeAdmissionStore {
    async fn release_expired_reservations(
        &self,
        subject_id: &str,
        prune_days_before: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let mut state = self.state.lock().await;
        let mut swept = 0;
        for reservation in state.reservations.values_mut() {
            if reservation.subject_id == subject_id
                && reservation.status == FakeReservationStatus::Reserved
                && reservation.expires_at < now
            {
                reservation.status = FakeReservationStatus::Released;
                swept += 1;
            }
        }
        state.reservations.retain(|_, r| {
            r.subject_id != subject_id
                || r.day >= prune_days_before
                || r.status == FakeReservationStatus::Reserved
        });
        Ok(swept)
    }

    async fn reserve_quota(
        &self,
        request: &ReserveQuotaRequest,
    ) -> Result<ReserveQuotaReceipt, Error> {
        let mut state = self.state.lock().await;
        let consumed = *state
            .usage
            .entry((request.subject_id.clone(), request.day))
            .or_insert(0);
        let outstanding = count_outstanding(&state, &request.subject_id, request.day);
        let over_outstanding_cap = request
            .max_outstanding
            .is_some_and(|cap| outstanding >= cap);
        if consumed + outstanding >= request.daily_limit || over_outstanding_cap {
            return Ok(ReserveQuotaReceipt {
                success: false,
                consumed,
                outstanding,
            });
        }
        state.reservations.insert(
            request.reservation_id,
            FakeReservation {
                subject_id: request.subject_id.clone(),
                day: request.day,
                status: FakeReservationStatus::Reserved,
                expires_at: request.expires_at,
            },
        );
        Ok(ReserveQuotaReceipt {
            success: true,
            consumed,
            outstanding: outstanding + 1,
        })
    }

    async fn finalize_reservation(
        &self,
        handle: &ReservationHandle,
        _now: DateTime<Utc>,
    ) -> Result<FinalizeReceipt, Error> {
        let mut state = self.state.lock().await;
        let still_reserved = state
            .reservations
            .get(&handle.id)
            .is_some_and(|r| r.status == FakeReservationStatus::Reserved);
        if !still_reserved {
            let consumed = state
                .usage
                .get(&(handle.subject_id.clone(), handle.day))
                .copied()
                .unwrap_or(0);
            return Ok(FinalizeReceipt {
                finalized: false,
                consumed,
            });
        }
        if let Some(reservation) = state.reservations.get_mut(&handle.id) {
            reservation.status = FakeReservationStatus::Consumed;
        }
        let consumed = state
            .usage
            .entry((handle.subject_id.clone(), handle.day))
            .or_insert(0);
        *consumed += 1;
        Ok(FinalizeReceipt {
            finalized: true,
            consumed: *consumed,
        })
    }

    async fn release_reservation(
        &self,
        handle: &ReservationHandle,
        _now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let mut state = self.state.lock().await;
        match state.reservations.get_mut(&handle.id) {
            Some(reservation) if reservation.status == FakeReservationStatus::Reserved => {
                reservation.status = FakeReservationStatus::Released;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_daily_usage(&self, subject_id: &str, day: NaiveDate) -> Result<u64, Error> {
        let state = self.state.lock().await;
        Ok(state
            .usage
            .get(&(subject_id.to_string(), day))
            .copied()
            .unwrap_or(0))
    }
}
