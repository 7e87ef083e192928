//! Runtime configuration for the orchestration core.
//!
//! Populated from environment variables with explicit defaults, a "no
//! TOML/YAML parsing dependency" stance; users may also construct a
//! [`Config`] by hand for tests.

use std::env;
use std::time::Duration;

/// Global configuration for the orchestration core (`spec.md` §6).
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection string for the persistence layer. Only consulted by the
    /// `postgres` feature's repository adapter.
    pub database_url: Option<String>,
    /// 32-byte key reserved for credential-at-rest encryption in the
    /// provider/credential registry. The orchestration core itself does not
    /// store credentials, but carries the setting through for adapters that do.
    pub encryption_key: Option<String>,
    /// Capacity of the admission semaphore (`N_max`).
    pub max_concurrent_executions: usize,
    /// Default `timeout_seconds` applied to a Team when none is set.
    pub default_execution_timeout: Duration,
    /// Age after which a completed execution becomes eligible for retention sweep.
    pub retention_days: i64,
    /// Silence interval after which the event bus emits a synthetic heartbeat.
    pub heartbeat_interval: Duration,
    /// `RUST_LOG`-compatible filter string.
    pub log_level: String,
}

impl Config {
    /// Build a [`Config`] from the environment, falling back to `spec.md`'s defaults.
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").ok(),
            encryption_key: env::var("ENCRYPTION_KEY").ok(),
            max_concurrent_executions: env::var("MAX_CONCURRENT_EXECUTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            default_execution_timeout: Duration::from_secs(
                env::var("DEFAULT_EXECUTION_TIMEOUT_SECONDS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
            retention_days: env::var("RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            heartbeat_interval: Duration::from_secs(
                env::var("HEARTBEAT_SECONDS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }

    /// Initialize `env_logger` at [`Config::log_level`] if `RUST_LOG` is unset.
    pub fn init_logging(&self) {
        if env::var("RUST_LOG").is_err() {
            env::set_var("RUST_LOG", &self.log_level);
        }
        let _ = env_logger::try_init();
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            encryption_key: None,
            max_concurrent_executions: 100,
            default_execution_timeout: Duration::from_secs(300),
            retention_days: 30,
            heartbeat_interval: Duration::from_secs(30),
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_executions, 100);
        assert_eq!(config.default_execution_timeout, Duration::from_secs(300));
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
    }
}
