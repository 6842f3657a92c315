//! Telemetry configuration from environment variables.

use std::env;

/// Configuration for logging output.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to logs
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error), or a full
    /// `EnvFilter` directive such as `ddd_bus=debug,info`
    pub log_level: String,

    /// Whether to enable JSON formatted logs
    pub json_logs: bool,

    /// Whether to colour pretty output
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "ddd-service".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            ansi: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// - `OTEL_SERVICE_NAME`: Service name (default: ddd-service)
    /// - `DDD_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `DDD_JSON_LOGS`: Enable JSON logs (default: false in dev, true in containers)
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();
        let json_logs = env::var("DDD_JSON_LOGS")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(is_container);

        Self {
            service_name: env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "ddd-service".to_string()),

            log_level: env::var("DDD_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            json_logs,

            ansi: !json_logs,
        }
    }

    /// Configuration for the service that owns `domain`.
    pub fn for_domain(domain: &str) -> Self {
        let mut config = Self::from_env();
        config.service_name = format!("ddd-{domain}");
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "ddd-service");
        assert_eq!(config.log_level, "info");
        assert!(!config.json_logs);
    }

    #[test]
    fn test_for_domain() {
        let config = TelemetryConfig::for_domain("billing");
        assert_eq!(config.service_name, "ddd-billing");
    }
}
