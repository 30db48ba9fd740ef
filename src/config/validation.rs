//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (intervals > 0, ports valid, backoff bounds)
//! - Refuse to expose the admin API with the placeholder key
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: EngineConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::EngineConfig;

const PLACEHOLDER_API_KEY: &str = "CHANGE_ME_IN_PRODUCTION";

/// A single semantic problem in a loaded configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check an engine configuration, collecting every problem.
pub fn validate_config(config: &EngineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let intervals = [
        ("intervals.health_check_secs", config.intervals.health_check_secs),
        ("intervals.stats_poll_secs", config.intervals.stats_poll_secs),
        ("intervals.ledger_flush_secs", config.intervals.ledger_flush_secs),
        ("intervals.ip_scan_secs", config.intervals.ip_scan_secs),
        ("intervals.policy_secs", config.intervals.policy_secs),
        ("intervals.reconcile_secs", config.intervals.reconcile_secs),
    ];
    for (field, value) in intervals {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    if config.core.api_port == 0 {
        errors.push(ValidationError::new("core.api_port", "must be a fixed port"));
    }
    if config.core.binary_path.as_os_str().is_empty() {
        errors.push(ValidationError::new("core.binary_path", "must not be empty"));
    }

    if config.ip_limit.window_secs == 0 {
        errors.push(ValidationError::new("ip_limit.window_secs", "must be greater than zero"));
    }

    if config.restart.max_consecutive_failures == 0 {
        errors.push(ValidationError::new(
            "restart.max_consecutive_failures",
            "must allow at least one attempt",
        ));
    }
    if config.restart.base_delay_ms > config.restart.max_delay_ms {
        errors.push(ValidationError::new(
            "restart.base_delay_ms",
            format!(
                "{} exceeds max_delay_ms {}",
                config.restart.base_delay_ms, config.restart.max_delay_ms
            ),
        ));
    }

    if config.timeouts.health_check_secs == 0 || config.timeouts.launch_secs == 0 {
        errors.push(ValidationError::new("timeouts", "launch and health check timeouts must be non-zero"));
    }

    if config.admin.enabled && config.admin.api_key == PLACEHOLDER_API_KEY {
        errors.push(ValidationError::new("admin.api_key", "placeholder key must be replaced"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&EngineConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = EngineConfig::default();
        config.intervals.stats_poll_secs = 0;
        config.restart.base_delay_ms = 10_000;
        config.restart.max_delay_ms = 100;
        config.admin.enabled = true;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec!["intervals.stats_poll_secs", "restart.base_delay_ms", "admin.api_key"]
        );
    }
}
