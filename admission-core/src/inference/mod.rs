//! The resilient call wrapper around the external inference request.
//!
//! Each target gets its own retry budget with exponential backoff and jitter;
//! every attempt runs under a hard wall-clock timeout, and responses must
//! validate as a single structured object before they count as success. The
//! wrapper never touches the quota ledger; the orchestrator wires its
//! outcome to finalize/release.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::error::Elapsed;

use crate::error::{Error, ErrorDetails};
use crate::utils::retries::RetryConfig;

pub mod output;

pub use output::{OutputSchema, parse_structured_output};

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct CallPolicy {
    /// Hard per-attempt ceiling; exceeding it is a failed attempt, not a crash.
    #[serde(default = "default_timeout_s")]
    pub timeout_s: f32,
    #[serde(default)]
    pub retries: RetryConfig,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout_s: default_timeout_s(),
            retries: RetryConfig::default(),
        }
    }
}

fn default_timeout_s() -> f32 {
    170.0
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Primary,
    Fallback,
}

/// Performs the actual external call, returning raw text. Implemented by the
/// excluded request-handling layer; `FnProducer` adapts plain closures.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn call(&self) -> Result<String, Error>;
}

pub struct FnProducer<F>(F);

impl<F> FnProducer<F> {
    pub fn new(func: F) -> Self {
        Self(func)
    }
}

#[async_trait]
impl<F, Fut> Producer for FnProducer<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, Error>> + Send,
{
    async fn call(&self) -> Result<String, Error> {
        (self.0)().await
    }
}

/// A named inference target (e.g. a model) and its producer.
pub struct CallTarget {
    name: String,
    producer: Box<dyn Producer>,
}

impl CallTarget {
    pub fn new(name: impl Into<String>, producer: impl Producer + 'static) -> Self {
        Self {
            name: name.into(),
            producer: Box::new(producer),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A validated response, tagged with the target that produced it.
#[derive(Clone, Debug, Serialize)]
pub struct InferenceResponse {
    pub output: Value,
    pub target_name: String,
    pub target: TargetKind,
    pub latency: Duration,
}

pub struct InferenceCaller {
    policy: CallPolicy,
    output_schema: Option<OutputSchema>,
}

impl InferenceCaller {
    pub fn new(policy: CallPolicy) -> Self {
        Self {
            policy,
            output_schema: None,
        }
    }

    pub fn with_output_schema(mut self, schema: OutputSchema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Tries the primary target with its full retry budget, then the fallback
    /// with its own. Returns the first valid structured result, or
    /// `TargetsExhausted` carrying each target's last error in attempt order.
    pub async fn invoke(
        &self,
        primary: &CallTarget,
        fallback: Option<&CallTarget>,
    ) -> Result<InferenceResponse, Error> {
        let mut errors = IndexMap::new();
        let targets = std::iter::once((TargetKind::Primary, primary))
            .chain(fallback.map(|target| (TargetKind::Fallback, target)));
        for (kind, target) in targets {
            let started = Instant::now();
            match self.policy.retries.retry(|| self.attempt(target)).await {
                Ok(output) => {
                    return Ok(InferenceResponse {
                        output,
                        target_name: target.name.clone(),
                        target: kind,
                        latency: started.elapsed(),
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        target_name = %target.name,
                        "Inference target exhausted its retry budget: {error}"
                    );
                    errors.insert(target.name.clone(), error);
                }
            }
        }
        Err(Error::new(ErrorDetails::TargetsExhausted { errors }))
    }

    async fn attempt(&self, target: &CallTarget) -> Result<Value, Error> {
        let timeout = Duration::from_secs_f32(self.policy.timeout_s);
        let raw = tokio::time::timeout(timeout, target.producer.call())
            .await
            // Convert the outer `Elapsed` into a retryable attempt failure
            .unwrap_or_else(|_: Elapsed| {
                Err(Error::new(ErrorDetails::AttemptTimeout {
                    target_name: target.name.clone(),
                    timeout,
                }))
            })?;
        let output = parse_structured_output(&raw)?;
        if let Some(schema) = &self.output_schema {
            schema.validate(&output)?;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(num_retries: usize) -> CallPolicy {
        CallPolicy {
            timeout_s: 5.0,
            retries: RetryConfig {
                num_retries,
                base_delay_s: 0.001,
                max_delay_s: 0.01,
            },
        }
    }

    fn counting_target(
        name: &str,
        attempts: Arc<AtomicUsize>,
        result_for_attempt: impl Fn(usize) -> Result<String, Error> + Send + Sync + 'static,
    ) -> CallTarget {
        CallTarget::new(
            name,
            FnProducer::new(move || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let result = result_for_attempt(attempt);
                async move { result }
            }),
        )
    }

    fn transport_error(target_name: &str) -> Error {
        Error::new(ErrorDetails::InferenceClient {
            message: "connection reset".to_string(),
            target_name: target_name.to_string(),
        })
    }

    #[tokio::test]
    async fn test_primary_success_is_tagged_primary() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let primary = counting_target("model-a", attempts.clone(), |_| {
            Ok(r#"{"ok": true}"#.to_string())
        });
        let caller = InferenceCaller::new(fast_policy(1));

        let response = caller.invoke(&primary, None).await.unwrap();
        assert_eq!(response.target, TargetKind::Primary);
        assert_eq!(response.target_name, "model-a");
        assert_eq!(response.output, json!({"ok": true}));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_runs_after_primary_exhausts_its_budget() {
        let primary_attempts = Arc::new(AtomicUsize::new(0));
        let fallback_attempts = Arc::new(AtomicUsize::new(0));
        // Primary fails transport once, then returns an invalid shape
        let primary = counting_target("model-a", primary_attempts.clone(), |attempt| {
            if attempt == 0 {
                Err(transport_error("model-a"))
            } else {
                Ok("[1, 2, 3]".to_string())
            }
        });
        let fallback = counting_target("model-b", fallback_attempts.clone(), |_| {
            Ok(r#"{"ok": true}"#.to_string())
        });
        let caller = InferenceCaller::new(fast_policy(1));

        let response = caller.invoke(&primary, Some(&fallback)).await.unwrap();
        assert_eq!(response.target, TargetKind::Fallback);
        assert_eq!(response.target_name, "model-b");
        // num_retries = 1 means the primary burned both of its attempts
        assert_eq!(primary_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(fallback_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_targets_preserve_attempt_order() {
        let primary_attempts = Arc::new(AtomicUsize::new(0));
        let fallback_attempts = Arc::new(AtomicUsize::new(0));
        let primary = counting_target("model-a", primary_attempts, |_| {
            Err(transport_error("model-a"))
        });
        let fallback = counting_target("model-b", fallback_attempts, |_| {
            Ok("not json at all".to_string())
        });
        let caller = InferenceCaller::new(fast_policy(0));

        let error = caller.invoke(&primary, Some(&fallback)).await.unwrap_err();
        match error.get_details() {
            ErrorDetails::TargetsExhausted { errors } => {
                let target_names: Vec<_> = errors.keys().cloned().collect();
                assert_eq!(target_names, vec!["model-a", "model-b"]);
                assert!(matches!(
                    errors["model-b"].get_details(),
                    ErrorDetails::OutputParsing { .. }
                ));
            }
            details => panic!("Expected TargetsExhausted, got {details:?}"),
        }
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_a_failed_attempt() {
        let slow = CallTarget::new(
            "model-a",
            FnProducer::new(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(r#"{"ok": true}"#.to_string())
            }),
        );
        let caller = InferenceCaller::new(CallPolicy {
            timeout_s: 0.01,
            retries: RetryConfig {
                num_retries: 0,
                base_delay_s: 0.001,
                max_delay_s: 0.01,
            },
        });

        let error = caller.invoke(&slow, None).await.unwrap_err();
        match error.get_details() {
            ErrorDetails::TargetsExhausted { errors } => {
                assert!(matches!(
                    errors["model-a"].get_details(),
                    ErrorDetails::AttemptTimeout { .. }
                ));
            }
            details => panic!("Expected TargetsExhausted, got {details:?}"),
        }
    }

    #[tokio::test]
    async fn test_schema_violation_fails_the_attempt() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let primary = counting_target("model-a", attempts.clone(), |_| {
            Ok(r#"{"overall_score": "high"}"#.to_string())
        });
        let schema = OutputSchema::from_value(json!({
            "type": "object",
            "properties": { "overall_score": { "type": "number" } },
        }))
        .unwrap();
        let caller = InferenceCaller::new(fast_policy(1)).with_output_schema(schema);

        let error = caller.invoke(&primary, None).await.unwrap_err();
        assert!(matches!(
            error.get_details(),
            ErrorDetails::TargetsExhausted { .. }
        ));
        // Schema violations retry like any other attempt failure
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
