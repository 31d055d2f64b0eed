// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::health_monitor::HealthMonitorConfig;
use crate::upgrade_sweeper::{UpgradeSweeperConfig, clamp_upgrade_timeout};

/// Clawfleet configuration
#[derive(Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Database pool size
    pub db_max_connections: u32,
    /// Staleness sweep cadence
    pub health_poll_interval: Duration,
    /// Time without a health report before a live runtime is marked offline
    pub stale_threshold: Duration,
    /// Upgrade timeout sweep cadence
    pub upgrade_sweep_interval: Duration,
    /// Pending-upgrade deadline (at least 60 seconds)
    pub upgrade_timeout: Duration,
    /// Maximum pending upgrades scanned per timeout sweep
    pub upgrade_sweep_limit: Option<i64>,
    /// Shared secret runtime processes present as their service credential
    pub service_key: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CLAWFLEET_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `CLAWFLEET_DB_MAX_CONNECTIONS`: Pool size (default: 10)
    /// - `CLAWFLEET_HEALTH_POLL_INTERVAL_SECS`: Staleness sweep cadence (default: 30)
    /// - `CLAWFLEET_STALE_THRESHOLD_SECS`: Staleness threshold (default: 90)
    /// - `CLAWFLEET_UPGRADE_SWEEP_INTERVAL_SECS`: Timeout sweep cadence (default: 60)
    /// - `CLAWFLEET_UPGRADE_TIMEOUT_SECS`: Pending-upgrade deadline (default: 1800, min: 60)
    /// - `CLAWFLEET_UPGRADE_SWEEP_LIMIT`: Max runtimes per timeout sweep (default: unbounded)
    /// - `CLAWFLEET_SERVICE_KEY`: Runtime service credential secret (default: unset)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CLAWFLEET_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CLAWFLEET_DATABASE_URL"))?;

        let db_max_connections: u32 = positive("CLAWFLEET_DB_MAX_CONNECTIONS", 10)?;
        let health_poll_interval = positive_secs("CLAWFLEET_HEALTH_POLL_INTERVAL_SECS", 30)?;
        let stale_threshold = positive_secs("CLAWFLEET_STALE_THRESHOLD_SECS", 90)?;
        let upgrade_sweep_interval = positive_secs("CLAWFLEET_UPGRADE_SWEEP_INTERVAL_SECS", 60)?;
        let upgrade_timeout =
            clamp_upgrade_timeout(Some(positive_secs("CLAWFLEET_UPGRADE_TIMEOUT_SECS", 1800)?));

        let upgrade_sweep_limit = match std::env::var("CLAWFLEET_UPGRADE_SWEEP_LIMIT") {
            Ok(raw) => Some(parse::<i64>(&raw).filter(|limit| *limit > 0).ok_or(
                ConfigError::Invalid("CLAWFLEET_UPGRADE_SWEEP_LIMIT", "must be a positive integer"),
            )?),
            Err(_) => None,
        };

        let service_key = std::env::var("CLAWFLEET_SERVICE_KEY")
            .ok()
            .filter(|key| !key.is_empty());

        Ok(Self {
            database_url,
            db_max_connections,
            health_poll_interval,
            stale_threshold,
            upgrade_sweep_interval,
            upgrade_timeout,
            upgrade_sweep_limit,
            service_key,
        })
    }

    /// Health monitor settings derived from this configuration.
    pub fn health_monitor_config(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            poll_interval: self.health_poll_interval,
            stale_threshold: self.stale_threshold,
        }
    }

    /// Upgrade sweeper settings derived from this configuration.
    pub fn upgrade_sweeper_config(&self) -> UpgradeSweeperConfig {
        UpgradeSweeperConfig {
            poll_interval: self.upgrade_sweep_interval,
            timeout: self.upgrade_timeout,
            limit: self.upgrade_sweep_limit,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url)
            .field("db_max_connections", &self.db_max_connections)
            .field("health_poll_interval", &self.health_poll_interval)
            .field("stale_threshold", &self.stale_threshold)
            .field("upgrade_sweep_interval", &self.upgrade_sweep_interval)
            .field("upgrade_timeout", &self.upgrade_timeout)
            .field("upgrade_sweep_limit", &self.upgrade_sweep_limit)
            .field(
                "service_key",
                &self.service_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

fn parse<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse().ok()
}

fn positive<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    match std::env::var(var) {
        Ok(raw) => parse::<T>(&raw)
            .filter(|value| *value > T::default())
            .ok_or(ConfigError::Invalid(var, "must be a positive integer")),
        Err(_) => Ok(default),
    }
}

fn positive_secs(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    positive(var, default).map(Duration::from_secs)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const OPTIONAL_VARS: [&str; 7] = [
        "CLAWFLEET_DB_MAX_CONNECTIONS",
        "CLAWFLEET_HEALTH_POLL_INTERVAL_SECS",
        "CLAWFLEET_STALE_THRESHOLD_SECS",
        "CLAWFLEET_UPGRADE_SWEEP_INTERVAL_SECS",
        "CLAWFLEET_UPGRADE_TIMEOUT_SECS",
        "CLAWFLEET_UPGRADE_SWEEP_LIMIT",
        "CLAWFLEET_SERVICE_KEY",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        /// Start from a clean slate: database URL set, every optional var unset.
        fn baseline(database_url: &str) -> Self {
            let mut guard = Self::new();
            guard.set("CLAWFLEET_DATABASE_URL", database_url);
            for var in OPTIONAL_VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::baseline("postgres://localhost/test");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.db_max_connections, 10);
        assert_eq!(config.health_poll_interval, Duration::from_secs(30));
        assert_eq!(config.stale_threshold, Duration::from_secs(90));
        assert_eq!(config.upgrade_sweep_interval, Duration::from_secs(60));
        assert_eq!(config.upgrade_timeout, Duration::from_secs(1800));
        assert_eq!(config.upgrade_sweep_limit, None);
        assert_eq!(config.service_key, None);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::baseline("sqlite:fleet.db");

        guard.set("CLAWFLEET_DB_MAX_CONNECTIONS", "4");
        guard.set("CLAWFLEET_HEALTH_POLL_INTERVAL_SECS", "10");
        guard.set("CLAWFLEET_STALE_THRESHOLD_SECS", "45");
        guard.set("CLAWFLEET_UPGRADE_SWEEP_INTERVAL_SECS", "120");
        guard.set("CLAWFLEET_UPGRADE_TIMEOUT_SECS", "900");
        guard.set("CLAWFLEET_UPGRADE_SWEEP_LIMIT", "500");
        guard.set("CLAWFLEET_SERVICE_KEY", "s3cret");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite:fleet.db");
        assert_eq!(config.db_max_connections, 4);
        assert_eq!(config.stale_threshold, Duration::from_secs(45));
        assert_eq!(config.upgrade_timeout, Duration::from_secs(900));
        assert_eq!(config.upgrade_sweep_limit, Some(500));
        assert_eq!(config.service_key.as_deref(), Some("s3cret"));

        let monitor = config.health_monitor_config();
        assert_eq!(monitor.poll_interval, Duration::from_secs(10));
        let sweeper = config.upgrade_sweeper_config();
        assert_eq!(sweeper.poll_interval, Duration::from_secs(120));
        assert_eq!(sweeper.limit, Some(500));
    }

    #[test]
    fn test_config_upgrade_timeout_is_clamped() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::baseline("postgres://localhost/test");
        guard.set("CLAWFLEET_UPGRADE_TIMEOUT_SECS", "5");

        let config = Config::from_env().unwrap();
        assert_eq!(config.upgrade_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("CLAWFLEET_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CLAWFLEET_DATABASE_URL")));
        assert!(err.to_string().contains("CLAWFLEET_DATABASE_URL"));
    }

    #[test]
    fn test_config_rejects_invalid_numbers() {
        let _lock = ENV_MUTEX.lock().unwrap();

        for (var, value) in [
            ("CLAWFLEET_DB_MAX_CONNECTIONS", "abc"),
            ("CLAWFLEET_DB_MAX_CONNECTIONS", "0"),
            ("CLAWFLEET_STALE_THRESHOLD_SECS", "-5"),
            ("CLAWFLEET_HEALTH_POLL_INTERVAL_SECS", "0"),
            ("CLAWFLEET_UPGRADE_SWEEP_LIMIT", "0"),
            ("CLAWFLEET_UPGRADE_SWEEP_LIMIT", "lots"),
        ] {
            let mut guard = EnvGuard::baseline("postgres://localhost/test");
            guard.set(var, value);

            let err = Config::from_env().unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid(name, _) if name == var),
                "{}={} should be rejected",
                var,
                value
            );
        }
    }

    #[test]
    fn test_config_empty_service_key_is_unset() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::baseline("postgres://localhost/test");
        guard.set("CLAWFLEET_SERVICE_KEY", "");

        let config = Config::from_env().unwrap();
        assert!(config.service_key.is_none());
    }

    #[test]
    fn test_config_debug_redacts_service_key() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::baseline("postgres://localhost/test");
        guard.set("CLAWFLEET_SERVICE_KEY", "s3cret");

        let config = Config::from_env().unwrap();
        let debug_str = format!("{:?}", config);

        assert!(debug_str.contains("database_url"));
        assert!(debug_str.contains("<redacted>"));
        assert!(!debug_str.contains("s3cret"));
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
