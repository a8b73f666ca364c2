//! Telemetry configuration from environment variables.

use std::env;

/// Configuration for log output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to the startup line
    pub service_name: String,

    /// Filter directives (e.g. `info` or `knockd_core=debug,info`)
    pub log_level: String,

    /// Whether to emit JSON formatted logs
    pub json_logs: bool,

    /// Whether to print the target module of each event
    pub log_targets: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "knockd".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            log_targets: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `KNOCKD_LOG_LEVEL` or `RUST_LOG`: Log filter (default: info)
    /// - `KNOCKD_JSON_LOGS`: Enable JSON logs (default: false, true in containers)
    /// - `KNOCKD_LOG_TARGETS`: Print event targets (default: false)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let is_container =
            lookup("KUBERNETES_SERVICE_HOST").is_some() || lookup("DOCKER_CONTAINER").is_some();
        let defaults = Self::default();

        Self {
            service_name: defaults.service_name,

            log_level: lookup("KNOCKD_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.log_level),

            json_logs: lookup("KNOCKD_JSON_LOGS")
                .map(|v| is_truthy(&v))
                .unwrap_or(is_container),

            log_targets: lookup("KNOCKD_LOG_TARGETS")
                .map(|v| is_truthy(&v))
                .unwrap_or(defaults.log_targets),
        }
    }

    /// Override the filter, e.g. from a `--log-level` flag.
    #[must_use]
    pub fn with_log_level(mut self, log_level: impl Into<String>) -> Self {
        self.log_level = log_level.into();
        self
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
