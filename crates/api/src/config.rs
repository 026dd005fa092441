//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::CoordinatorConfig;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL saga log; unset keeps the log in memory
/// - `SAGA_LOG_APPEND_ATTEMPTS`: tries per log append (default: `3`)
/// - `SAGA_LOG_RETRY_DELAY_MS`: pause between append tries (default: `50`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub log_append_attempts: u32,
    pub log_retry_delay_ms: u64,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    ///
    /// Unparseable numbers fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            log_append_attempts: lookup("SAGA_LOG_APPEND_ATTEMPTS")
                .and_then(|n| n.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.log_append_attempts),
            log_retry_delay_ms: lookup("SAGA_LOG_RETRY_DELAY_MS")
                .and_then(|n| n.parse().ok())
                .unwrap_or(defaults.log_retry_delay_ms),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            log_append_attempts: self.log_append_attempts,
            log_retry_delay: Duration::from_millis(self.log_retry_delay_ms),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            log_append_attempts: 3,
            log_retry_delay_ms: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert!(config.database_url.is_none());
        assert_eq!(config.log_append_attempts, 3);
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config.addr(), "0.0.0.0:3000");
        assert_eq!(config.log_retry_delay_ms, 50);
    }

    #[test]
    fn test_variables_override_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "8080"),
            ("DATABASE_URL", "postgres://localhost/sagas"),
            ("SAGA_LOG_APPEND_ATTEMPTS", "5"),
            ("SAGA_LOG_RETRY_DELAY_MS", "10"),
        ]));

        assert_eq!(config.addr(), "127.0.0.1:8080");
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/sagas")
        );

        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.log_append_attempts, 5);
        assert_eq!(coordinator.log_retry_delay, Duration::from_millis(10));
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "not-a-port"),
            ("SAGA_LOG_APPEND_ATTEMPTS", "0"),
            ("DATABASE_URL", "  "),
        ]));

        assert_eq!(config.port, 3000);
        assert_eq!(config.log_append_attempts, 3);
        assert!(config.database_url.is_none());
    }
}
