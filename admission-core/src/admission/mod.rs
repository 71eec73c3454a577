//! The admission orchestrator: the entry point used by request handlers.
//!
//! Ordering is fixed: the rate limiter runs first (cheapest check), then the
//! quota reservation (the gate), then the external call. The reservation is
//! what admits the request, not the call; the call's outcome drives finalize
//! or release so quota is never debited for work that failed.

use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use crate::config::AdmissionConfig;
use crate::db::{QuotaQueries, RateLimitQueries};
use crate::error::{Error, ErrorDetails};
use crate::inference::{CallTarget, InferenceCaller, OutputSchema, TargetKind};
use crate::quota::ReserveOutcome;
use crate::rate_limiting::RateLimitDecision;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeniedKind {
    RateLimited,
    QuotaExceeded,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    MalformedOutput,
    TransportError,
}

#[derive(Clone, Debug, Serialize)]
pub struct AdmissionSuccess {
    pub output: Value,
    pub target: TargetKind,
    pub target_name: String,
    pub duration_ms: u64,
    pub request_id: Uuid,
}

#[derive(Clone, Debug, Serialize)]
pub struct AdmissionDenied {
    pub kind: DeniedKind,
    pub retry_after_seconds: u64,
    /// For quota denials, the day's consumed count; for rate-limit denials,
    /// the requests already admitted in the current minute window.
    pub consumed: u64,
    pub reserved: u64,
    pub request_id: Uuid,
}

#[derive(Clone, Debug, Serialize)]
pub struct AdmissionFailure {
    pub kind: FailureKind,
    pub last_error_summary: String,
    pub request_id: Uuid,
}

/// The uniform result handed back to the excluded presentation layer.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdmissionOutcome {
    Allowed(AdmissionSuccess),
    Denied(AdmissionDenied),
    Failure(AdmissionFailure),
}

pub struct AdmissionController<C> {
    config: AdmissionConfig,
    caller: InferenceCaller,
    client: C,
}

impl<C: RateLimitQueries + QuotaQueries> AdmissionController<C> {
    pub fn new(config: AdmissionConfig, client: C) -> Self {
        let caller = InferenceCaller::new(config.call);
        Self {
            config,
            caller,
            client,
        }
    }

    /// Enforces the configured output schema on every validated response.
    pub fn with_output_schema(mut self, schema: OutputSchema) -> Self {
        self.caller = InferenceCaller::new(self.config.call).with_output_schema(schema);
        self
    }

    /// Read-only consumed count for the subject's current quota day.
    pub async fn current_usage(&self, subject_id: &str) -> Result<u64, Error> {
        let window = self.config.quota_window.compute(Utc::now());
        self.config
            .quota
            .current_usage(&self.client, &window, subject_id)
            .await
    }

    /// Rate limit, reserve, call, then finalize or release.
    ///
    /// Returns `Err` only for storage-layer failures; every admission-level
    /// result (allowed, denied, call failure) is an `AdmissionOutcome`.
    #[instrument(skip_all, fields(subject_id = %subject_id, client_address = %client_address))]
    pub async fn admit_and_run(
        &self,
        subject_id: &str,
        client_address: &str,
        primary: &CallTarget,
        fallback: Option<&CallTarget>,
    ) -> Result<AdmissionOutcome, Error> {
        let request_id = Uuid::now_v7();
        let now = Utc::now();

        if let RateLimitDecision::Denied {
            count,
            retry_after_seconds,
        } = self
            .config
            .rate_limit
            .check_and_increment(&self.client, client_address, now)
            .await?
        {
            tracing::info!(%request_id, decision = "rate_limited", count);
            return Ok(AdmissionOutcome::Denied(AdmissionDenied {
                kind: DeniedKind::RateLimited,
                retry_after_seconds,
                consumed: count,
                reserved: 0,
                request_id,
            }));
        }

        let window = self.config.quota_window.compute(now);
        let handle = if self.config.quota.is_exempt(subject_id) {
            tracing::info!(%request_id, decision = "quota_exempt");
            None
        } else {
            match self
                .config
                .quota
                .reserve(&self.client, &window, subject_id, request_id, now)
                .await?
            {
                ReserveOutcome::Reserved(handle) => Some(handle),
                ReserveOutcome::Denied {
                    consumed,
                    reserved,
                    retry_after_seconds,
                } => {
                    tracing::info!(%request_id, decision = "quota_exceeded", consumed, reserved);
                    return Ok(AdmissionOutcome::Denied(AdmissionDenied {
                        kind: DeniedKind::QuotaExceeded,
                        retry_after_seconds,
                        consumed,
                        reserved,
                        request_id,
                    }));
                }
            }
        };

        // The reservation is the gate; the call itself runs outside any lock
        let started = Instant::now();
        let result = self.caller.invoke(primary, fallback).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                if let Some(handle) = &handle {
                    // The call already succeeded; a failed increment here only
                    // under-counts, so log and return the result anyway.
                    if let Err(error) = self
                        .config
                        .quota
                        .finalize(&self.client, handle, Utc::now())
                        .await
                    {
                        tracing::warn!(%request_id, "Failed to finalize reservation: {error}");
                    }
                }
                tracing::info!(
                    %request_id,
                    decision = "allowed",
                    target_name = %response.target_name,
                    duration_ms,
                );
                Ok(AdmissionOutcome::Allowed(AdmissionSuccess {
                    output: response.output,
                    target: response.target,
                    target_name: response.target_name,
                    duration_ms,
                    request_id,
                }))
            }
            Err(error) => {
                if let Some(handle) = &handle {
                    if let Err(release_error) = self
                        .config
                        .quota
                        .release(&self.client, handle, Utc::now())
                        .await
                    {
                        tracing::warn!(%request_id, "Failed to release reservation: {release_error}");
                    }
                }
                let kind = classify_failure(error.get_details());
                tracing::info!(%request_id, decision = "failed", kind = ?kind, duration_ms);
                Ok(AdmissionOutcome::Failure(AdmissionFailure {
                    kind,
                    last_error_summary: error.get_details().public_summary(),
                    request_id,
                }))
            }
        }
    }
}

/// Maps the wrapper's last error onto the exposed failure taxonomy.
fn classify_failure(details: &ErrorDetails) -> FailureKind {
    match details {
        ErrorDetails::AttemptTimeout { .. } => FailureKind::Timeout,
        ErrorDetails::OutputParsing { .. } | ErrorDetails::OutputValidation { .. } => {
            FailureKind::MalformedOutput
        }
        ErrorDetails::TargetsExhausted { errors } => errors
            .last()
            .map(|(_, error)| classify_failure(error.get_details()))
            .unwrap_or(FailureKind::TransportError),
        _ => FailureKind::TransportError,
    }
}
