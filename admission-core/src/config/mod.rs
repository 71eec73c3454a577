use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::inference::CallPolicy;
use crate::quota::QuotaConfig;
use crate::rate_limiting::RateLimitConfig;
use crate::utils::quota_window::QuotaWindowConfig;

/// Top-level configuration. Every field has a serde default, so an empty TOML
/// document yields the stock limits. All values here are operational tuning,
/// not correctness contract.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub quota_window: QuotaWindowConfig,
    #[serde(default)]
    pub call: CallPolicy,
}

impl AdmissionConfig {
    pub fn load_from_toml_str(raw: &str) -> Result<Self, Error> {
        toml::from_str(raw).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse configuration: {e}"),
            })
        })
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        Self::load_from_toml_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AdmissionConfig::load_from_toml_str("").unwrap();
        assert_eq!(config.quota.daily_limit, 5);
        assert_eq!(config.quota.reservation_ttl_s, 600);
        assert_eq!(config.rate_limit.per_minute_limit, 20);
        assert_eq!(config.quota_window.utc_offset_minutes, 0);
        assert_eq!(config.call.retries.num_retries, 1);
    }

    #[test]
    fn test_full_config_roundtrip() {
        let raw = r#"
            [quota]
            daily_limit = 10
            reservation_ttl_s = 120
            max_outstanding = 1
            exempt_subjects = ["owner@example.com"]

            [rate_limit]
            per_minute_limit = 30
            retention_minutes = 15

            [quota_window]
            utc_offset_minutes = 120

            [call]
            timeout_s = 30.0

            [call.retries]
            num_retries = 2
            base_delay_s = 0.5
            max_delay_s = 8.0
        "#;
        let config = AdmissionConfig::load_from_toml_str(raw).unwrap();
        assert_eq!(config.quota.daily_limit, 10);
        assert_eq!(config.quota.reservation_ttl_s, 120);
        assert_eq!(config.quota.max_outstanding, Some(1));
        assert_eq!(config.quota.exempt_subjects, vec!["owner@example.com"]);
        assert_eq!(config.rate_limit.per_minute_limit, 30);
        assert_eq!(config.quota_window.utc_offset_minutes, 120);
        assert_eq!(config.call.retries.num_retries, 2);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let error = AdmissionConfig::load_from_toml_str("[quotas]\ndaily_limit = 10\n").unwrap_err();
        assert!(matches!(
            error.get_details(),
            ErrorDetails::Config { .. }
        ));
    }
}
