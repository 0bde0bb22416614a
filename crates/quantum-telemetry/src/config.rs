//! Telemetry configuration from environment variables.

use serde::{Deserialize, Serialize};
use std::env;

/// Configuration for log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line.
    pub service_name: String,

    /// Subsystem identifier (e.g. "18").
    pub subsystem_id: String,

    /// Level directive used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Write log lines to stdout. When false only the filter is installed.
    pub console_output: bool,

    /// JSON lines instead of human-readable output.
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "quantum-chain".to_string(),
            subsystem_id: "00".to_string(),
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
        }
    }
}

/// `true`/`1` and `false`/`0`, case-insensitive. Anything else is unset.
fn env_flag(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

impl TelemetryConfig {
    /// Defaults overridden by the environment.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `OTEL_SERVICE_NAME` | `service_name` |
    /// | `QC_SUBSYSTEM_ID` | `subsystem_id` |
    /// | `QC_LOG_LEVEL` | `log_level` |
    /// | `QC_CONSOLE_OUTPUT` | `console_output` |
    /// | `QC_JSON_LOGS` | `json_logs` (defaults to true inside a container) |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let in_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();

        Self {
            service_name: env::var("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            subsystem_id: env::var("QC_SUBSYSTEM_ID").unwrap_or(defaults.subsystem_id),
            log_level: env::var("QC_LOG_LEVEL").unwrap_or(defaults.log_level),
            console_output: env_flag("QC_CONSOLE_OUTPUT").unwrap_or(defaults.console_output),
            json_logs: env_flag("QC_JSON_LOGS").unwrap_or(in_container),
        }
    }

    /// Environment configuration named after a subsystem, e.g.
    /// `qc-18-block-ingestion`.
    pub fn for_subsystem(subsystem_id: &str, subsystem_name: &str) -> Self {
        Self {
            subsystem_id: subsystem_id.to_string(),
            service_name: format!("qc-{subsystem_id}-{subsystem_name}"),
            ..Self::from_env()
        }
    }

    /// Silent configuration for tests: filter only, no output.
    pub fn quiet() -> Self {
        Self {
            console_output: false,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "quantum-chain");
        assert_eq!(config.log_level, "info");
        assert!(config.console_output);
        assert!(!config.json_logs);
    }

    #[test]
    fn test_for_subsystem() {
        let config = TelemetryConfig::for_subsystem("18", "block-ingestion");
        assert_eq!(config.subsystem_id, "18");
        assert_eq!(config.service_name, "qc-18-block-ingestion");
    }

    #[test]
    fn test_unrecognised_flag_is_unset() {
        assert_eq!(env_flag("QC_TELEMETRY_TEST_FLAG_THAT_IS_NEVER_SET"), None);
    }

    #[test]
    fn test_quiet_has_no_output() {
        assert!(!TelemetryConfig::quiet().console_output);
    }
}
