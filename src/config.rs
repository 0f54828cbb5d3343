//! Configuration for the context middleware.

use axum::http::StatusCode;

use crate::error::{ContextError, Result};

/// How the middleware reacts to failures inside a request scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Mark the connection non-reusable (`Connection: close`) when a failure
    /// happens before headers are sent.
    pub close_connection_on_failure: bool,
    /// Status returned when the handler itself fails before responding.
    pub failure_status: StatusCode,
    /// Log every failure at error level.
    pub log_failures: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            close_connection_on_failure: true,
            failure_status: StatusCode::INTERNAL_SERVER_ERROR,
            log_failures: true,
        }
    }
}

impl ContextConfig {
    /// Load from `REQUEST_CONTEXT_*` environment variables, reading a `.env`
    /// file first if one exists. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup("REQUEST_CONTEXT_CLOSE_ON_FAILURE") {
            config.close_connection_on_failure =
                parse_bool("REQUEST_CONTEXT_CLOSE_ON_FAILURE", &value)?;
        }
        if let Some(value) = lookup("REQUEST_CONTEXT_FAILURE_STATUS") {
            config.failure_status = parse_status(&value)?;
        }
        if let Some(value) = lookup("REQUEST_CONTEXT_LOG_FAILURES") {
            config.log_failures = parse_bool("REQUEST_CONTEXT_LOG_FAILURES", &value)?;
        }

        Ok(config)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ContextError::Config {
            reason: format!("{name} must be a boolean, got '{value}'"),
        }),
    }
}

fn parse_status(value: &str) -> Result<StatusCode> {
    let status = value
        .trim()
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| ContextError::Config {
            reason: format!("REQUEST_CONTEXT_FAILURE_STATUS must be an HTTP status, got '{value}'"),
        })?;
    if !status.is_server_error() && !status.is_client_error() {
        return Err(ContextError::Config {
            reason: format!("REQUEST_CONTEXT_FAILURE_STATUS must be an error status, got {status}"),
        });
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ContextConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ContextConfig::default());
        assert!(config.close_connection_on_failure);
        assert_eq!(config.failure_status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_overrides() {
        let config = ContextConfig::from_lookup(lookup(&[
            ("REQUEST_CONTEXT_CLOSE_ON_FAILURE", "off"),
            ("REQUEST_CONTEXT_FAILURE_STATUS", "503"),
            ("REQUEST_CONTEXT_LOG_FAILURES", "FALSE"),
        ]))
        .unwrap();
        assert!(!config.close_connection_on_failure);
        assert_eq!(config.failure_status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!config.log_failures);
    }

    #[test]
    fn test_invalid_values_rejected() {
        for (name, value) in [
            ("REQUEST_CONTEXT_CLOSE_ON_FAILURE", "maybe"),
            ("REQUEST_CONTEXT_FAILURE_STATUS", "abc"),
            ("REQUEST_CONTEXT_FAILURE_STATUS", "200"),
        ] {
            let result = ContextConfig::from_lookup(lookup(&[(name, value)]));
            assert!(
                matches!(result, Err(ContextError::Config { .. })),
                "{name}={value} should be rejected"
            );
        }
    }
}
