//! Output-shape validation for model responses.
//!
//! A response must parse as a single JSON object: not a list, not free text,
//! not a code-fenced string. Near-valid output is repaired before giving up:
//! markdown fences are stripped, the outermost `{...}` span is extracted, and
//! trailing commas are removed. Anything irreparable is an `OutputParsing`
//! failure, which the caller treats as a failed attempt (not a success).

use std::sync::{Arc, LazyLock};

use jsonschema::Validator;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, ErrorDetails};

#[expect(clippy::expect_used)]
static OBJECT_SPAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\{.*\}").expect("Failed to compile OBJECT_SPAN regex")
});

#[expect(clippy::expect_used)]
static TRAILING_COMMA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r",\s*([}\]])").expect("Failed to compile TRAILING_COMMA regex")
});

pub fn parse_structured_output(raw: &str) -> Result<Value, Error> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::new(ErrorDetails::OutputParsing {
            message: "empty response from model".to_string(),
            raw_output: raw.to_string(),
        }));
    }

    let value = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => value,
        Err(parse_error) => repair_structured_output(trimmed).ok_or_else(|| {
            Error::new(ErrorDetails::OutputParsing {
                message: format!("failed to parse output as JSON: {parse_error}"),
                raw_output: raw.to_string(),
            })
        })?,
    };

    if value.is_object() {
        Ok(value)
    } else {
        Err(Error::new(ErrorDetails::OutputParsing {
            message: format!("expected a JSON object, got {}", json_type_name(&value)),
            raw_output: raw.to_string(),
        }))
    }
}

/// Best-effort recovery of an object from near-valid output.
fn repair_structured_output(text: &str) -> Option<Value> {
    let defenced = strip_code_fences(text);
    let candidate = OBJECT_SPAN
        .find(defenced)
        .map_or(defenced, |span| span.as_str());
    if let Ok(value) = serde_json::from_str(candidate) {
        return Some(value);
    }
    let without_trailing_commas = TRAILING_COMMA.replace_all(candidate, "$1");
    serde_json::from_str(&without_trailing_commas).ok()
}

fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(body) = text.strip_prefix("```") else {
        return text;
    };
    let body = body.strip_prefix("json").unwrap_or(body);
    let body = body.strip_suffix("```").unwrap_or(body);
    body.trim()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A compiled JSON Schema applied to validated output objects.
#[derive(Clone, Debug, Serialize)]
pub struct OutputSchema {
    #[serde(skip)]
    compiled: Arc<Validator>,
    pub value: Value,
}

impl OutputSchema {
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let compiled = jsonschema::validator_for(&value).map_err(|e| {
            Error::new(ErrorDetails::JsonSchema {
                message: format!("Failed to compile JSON Schema: {e}"),
            })
        })?;
        Ok(Self {
            compiled: Arc::new(compiled),
            value,
        })
    }

    pub fn validate(&self, instance: &Value) -> Result<(), Error> {
        self.compiled.validate(instance).map_err(|e| {
            Error::new(ErrorDetails::OutputValidation {
                messages: vec![e.to_string()],
            })
        })
    }
}
