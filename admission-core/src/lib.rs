//! Admission control for a costly, unreliable external inference call.
//!
//! Many independent, stateless worker processes share one Postgres store as
//! their sole synchronization primitive. This crate provides the layers those
//! workers run before (and around) the expensive call:
//!
//! - a per-client minute rate limiter ([`rate_limiting`]),
//! - a per-subject daily quota ledger with a reserve -> finalize/release
//!   protocol ([`quota`]),
//! - a resilient call wrapper with timeouts, backoff, target fallback, and
//!   output-shape validation ([`inference`]),
//! - and the orchestrator gluing them together ([`admission`]).

pub mod admission;
pub mod config;
pub mod db;
pub mod error;
pub mod inference;
pub mod observability;
pub mod quota;
pub mod rate_limiting;
pub mod utils;

pub use admission::{
    AdmissionController, AdmissionDenied, AdmissionFailure, AdmissionOutcome, AdmissionSuccess,
    DeniedKind, FailureKind,
};
pub use config::AdmissionConfig;
pub use db::PostgresConnectionInfo;
pub use error::{Error, ErrorDetails};
pub use inference::{
    CallPolicy, CallTarget, FnProducer, InferenceCaller, InferenceResponse, OutputSchema, Producer,
    TargetKind,
};
