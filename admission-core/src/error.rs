use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio::sync::OnceCell;

/// Controls whether to include raw model output in serialized error output.
///
/// WARNING: Setting this to true will expose potentially sensitive model
/// responses in logs and serialized errors. Use with caution.
static DEBUG: OnceCell<bool> = OnceCell::const_new();

pub fn set_debug(debug: bool) -> Result<(), Error> {
    DEBUG.set(debug).map_err(|_| {
        Error::new(ErrorDetails::Config {
            message: "Failed to set debug mode".to_string(),
        })
    })
}

fn serialize_if_debug<T, S>(data: T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: Serialize,
    S: Serializer,
{
    if *DEBUG.get().unwrap_or(&false) {
        return data.serialize(serializer);
    }
    serializer.serialize_none()
}

#[derive(Clone, Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
#[error(transparent)]
// As long as the struct member is private, we force people to use the `new`
// method and log the error. We arc `ErrorDetails` per the
// `clippy::result_large_err` lint, as well as to make it cloneable.
pub struct Error(Arc<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Arc::new(details))
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    pub fn is_retryable(&self) -> bool {
        self.0.is_retryable()
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorDetails::Serialization {
            message: err.to_string(),
        })
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::new(ErrorDetails::PostgresQuery {
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
pub enum ErrorDetails {
    AttemptTimeout {
        target_name: String,
        timeout: Duration,
    },
    Config {
        message: String,
    },
    InferenceClient {
        message: String,
        target_name: String,
    },
    InternalError {
        message: String,
    },
    JsonSchema {
        message: String,
    },
    Observability {
        message: String,
    },
    OutputParsing {
        message: String,
        #[serde(serialize_with = "serialize_if_debug")]
        raw_output: String,
    },
    OutputValidation {
        messages: Vec<String>,
    },
    PostgresConnectionInitialization {
        message: String,
    },
    PostgresMigration {
        message: String,
    },
    PostgresQuery {
        message: String,
    },
    Serialization {
        message: String,
    },
    TargetsExhausted {
        // We use an `IndexMap` to preserve the order in which targets were attempted
        errors: IndexMap<String, Error>,
    },
}

impl ErrorDetails {
    /// Defines the log level for each error
    pub fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AttemptTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InferenceClient { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::JsonSchema { .. } => tracing::Level::ERROR,
            ErrorDetails::Observability { .. } => tracing::Level::WARN,
            ErrorDetails::OutputParsing { .. } => tracing::Level::WARN,
            ErrorDetails::OutputValidation { .. } => tracing::Level::WARN,
            ErrorDetails::PostgresConnectionInitialization { .. } => tracing::Level::ERROR,
            ErrorDetails::PostgresMigration { .. } => tracing::Level::ERROR,
            ErrorDetails::PostgresQuery { .. } => tracing::Level::ERROR,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::TargetsExhausted { .. } => tracing::Level::ERROR,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorDetails::AttemptTimeout { .. }
            | ErrorDetails::InferenceClient { .. }
            | ErrorDetails::OutputParsing { .. }
            | ErrorDetails::OutputValidation { .. } => true,
            // For TargetsExhausted we will retry if any underlying error is retryable
            ErrorDetails::TargetsExhausted { errors } => {
                errors.iter().any(|(_, error)| error.is_retryable())
            }
            ErrorDetails::Config { .. }
            | ErrorDetails::InternalError { .. }
            | ErrorDetails::JsonSchema { .. }
            | ErrorDetails::Observability { .. }
            | ErrorDetails::PostgresConnectionInitialization { .. }
            | ErrorDetails::PostgresMigration { .. }
            | ErrorDetails::PostgresQuery { .. }
            | ErrorDetails::Serialization { .. } => false,
        }
    }

    /// A summary safe to hand to the presentation layer: classification only,
    /// no raw model output, provider messages, or internal identifiers.
    pub fn public_summary(&self) -> String {
        match self {
            ErrorDetails::AttemptTimeout { timeout, .. } => {
                format!("call timed out after {}s", timeout.as_secs())
            }
            ErrorDetails::InferenceClient { target_name, .. } => {
                format!("transport error from target `{target_name}`")
            }
            ErrorDetails::OutputParsing { .. } => {
                "model output was not a single structured object".to_string()
            }
            ErrorDetails::OutputValidation { .. } => {
                "model output did not match the expected schema".to_string()
            }
            ErrorDetails::TargetsExhausted { errors } => errors
                .iter()
                .map(|(target_name, error)| {
                    format!("{target_name}: {}", error.get_details().public_summary())
                })
                .collect::<Vec<_>>()
                .join("; "),
            _ => "internal error".to_string(),
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AttemptTimeout {
                target_name,
                timeout,
            } => {
                write!(
                    f,
                    "Target `{target_name}` timed out due to configured `call.timeout_s` ({timeout:?})"
                )
            }
            ErrorDetails::Config { message } => {
                write!(f, "Configuration error: {message}")
            }
            ErrorDetails::InferenceClient {
                message,
                target_name,
            } => {
                write!(f, "Error from target `{target_name}`: {message}")
            }
            ErrorDetails::InternalError { message } => {
                write!(f, "Internal error: {message}")
            }
            ErrorDetails::JsonSchema { message } => {
                write!(f, "JSON Schema error: {message}")
            }
            ErrorDetails::Observability { message } => {
                write!(f, "Observability error: {message}")
            }
            ErrorDetails::OutputParsing { message, .. } => {
                write!(f, "Error parsing structured output: {message}")
            }
            ErrorDetails::OutputValidation { messages } => {
                write!(
                    f,
                    "Output failed schema validation: {}",
                    messages.join("; ")
                )
            }
            ErrorDetails::PostgresConnectionInitialization { message } => {
                write!(
                    f,
                    "Postgres connection initialization failed with message: {message}"
                )
            }
            ErrorDetails::PostgresMigration { message } => {
                write!(f, "Error running Postgres migration: {message}")
            }
            ErrorDetails::PostgresQuery { message } => {
                write!(f, "Failed to run Postgres query: {message}")
            }
            ErrorDetails::Serialization { message } => {
                write!(f, "Error serializing or deserializing: {message}")
            }
            ErrorDetails::TargetsExhausted { errors } => {
                write!(
                    f,
                    "All inference targets failed with errors: {}",
                    errors
                        .iter()
                        .map(|(target_name, error)| format!("{target_name}: {error}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                )
            }
        }
    }
}
