// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Which relational engine a database URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// PostgreSQL (`postgres://` or `postgresql://`).
    Postgres,
    /// SQLite (`sqlite:`).
    Sqlite,
}

impl BackendKind {
    /// Infer the backend from a connection URL scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else if url.starts_with("sqlite:") {
            Some(Self::Sqlite)
        } else {
            None
        }
    }
}

/// Shardstore configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Backend inferred from `database_url`
    pub backend: BackendKind,
    /// Maximum pooled connections
    pub max_connections: u32,
    /// How long a lock acquisition may wait before failing as contention
    pub lock_timeout: Duration,
    /// Upper bound on a single statement (PostgreSQL only)
    pub statement_timeout: Duration,
    /// Apply embedded migrations on connect
    pub run_migrations: bool,
}

impl StoreConfig {
    /// Build a config for `database_url` with every other setting at its default.
    pub fn new(database_url: impl Into<String>) -> Result<Self, ConfigError> {
        let database_url = database_url.into();
        let backend = BackendKind::from_url(&database_url).ok_or(ConfigError::Invalid(
            "SHARDSTORE_DATABASE_URL",
            "must start with postgres://, postgresql:// or sqlite:",
        ))?;

        Ok(Self {
            database_url,
            backend,
            max_connections: 10,
            lock_timeout: Duration::from_millis(5000),
            statement_timeout: Duration::from_millis(30_000),
            run_migrations: true,
        })
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `SHARDSTORE_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `SHARDSTORE_MAX_CONNECTIONS`: pool size (default: 10)
    /// - `SHARDSTORE_LOCK_TIMEOUT_MS`: lock wait bound (default: 5000)
    /// - `SHARDSTORE_STATEMENT_TIMEOUT_MS`: statement bound (default: 30000)
    /// - `SHARDSTORE_RUN_MIGRATIONS`: "true"/"1" or "false"/"0" (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("SHARDSTORE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("SHARDSTORE_DATABASE_URL"))?;

        let mut config = Self::new(database_url)?;

        config.max_connections = std::env::var("SHARDSTORE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "SHARDSTORE_MAX_CONNECTIONS",
                "must be a positive integer",
            ))?;

        let lock_timeout_ms: u64 = std::env::var("SHARDSTORE_LOCK_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("SHARDSTORE_LOCK_TIMEOUT_MS", "must be milliseconds")
            })?;
        config.lock_timeout = Duration::from_millis(lock_timeout_ms);

        let statement_timeout_ms: u64 = std::env::var("SHARDSTORE_STATEMENT_TIMEOUT_MS")
            .unwrap_or_else(|_| "30000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("SHARDSTORE_STATEMENT_TIMEOUT_MS", "must be milliseconds")
            })?;
        config.statement_timeout = Duration::from_millis(statement_timeout_ms);

        config.run_migrations = match std::env::var("SHARDSTORE_RUN_MIGRATIONS")
            .unwrap_or_else(|_| "true".to_string())
            .as_str()
        {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => {
                return Err(ConfigError::Invalid(
                    "SHARDSTORE_RUN_MIGRATIONS",
                    "must be true, false, 1 or 0",
                ));
            }
        };

        Ok(config)
    }
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

    const VARS: [&str; 5] = [
        "SHARDSTORE_DATABASE_URL",
        "SHARDSTORE_MAX_CONNECTIONS",
        "SHARDSTORE_LOCK_TIMEOUT_MS",
        "SHARDSTORE_STATEMENT_TIMEOUT_MS",
        "SHARDSTORE_RUN_MIGRATIONS",
    ];

    /// Sets env vars for a test and restores them on drop
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in VARS {
                guard.remove(key);
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
        let mut guard = EnvGuard::clean();

        guard.set("SHARDSTORE_DATABASE_URL", "postgres://localhost/test");

        let config = StoreConfig::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.backend, BackendKind::Postgres);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.lock_timeout, Duration::from_millis(5000));
        assert_eq!(config.statement_timeout, Duration::from_millis(30_000));
        assert!(config.run_migrations);
    }

    #[test]
    fn test_config_from_env_sqlite_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("SHARDSTORE_DATABASE_URL", "sqlite:shards.db");
        guard.set("SHARDSTORE_MAX_CONNECTIONS", "4");
        guard.set("SHARDSTORE_LOCK_TIMEOUT_MS", "250");
        guard.set("SHARDSTORE_RUN_MIGRATIONS", "0");

        let config = StoreConfig::from_env().unwrap();

        assert_eq!(config.backend, BackendKind::Sqlite);
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert!(!config.run_migrations);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let err = StoreConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SHARDSTORE_DATABASE_URL")));
        assert!(err.to_string().contains("SHARDSTORE_DATABASE_URL"));
    }

    #[test]
    fn test_config_unknown_scheme() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("SHARDSTORE_DATABASE_URL", "mysql://localhost/test");

        let err = StoreConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("SHARDSTORE_DATABASE_URL", _)
        ));
    }

    #[test]
    fn test_config_zero_connections_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("SHARDSTORE_DATABASE_URL", "postgres://localhost/test");
        guard.set("SHARDSTORE_MAX_CONNECTIONS", "0");

        let err = StoreConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("SHARDSTORE_MAX_CONNECTIONS", _)
        ));
    }

    #[test]
    fn test_config_invalid_timeouts() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("SHARDSTORE_DATABASE_URL", "postgres://localhost/test");
        guard.set("SHARDSTORE_LOCK_TIMEOUT_MS", "soon");

        let err = StoreConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("SHARDSTORE_LOCK_TIMEOUT_MS", _)
        ));

        guard.set("SHARDSTORE_LOCK_TIMEOUT_MS", "100");
        guard.set("SHARDSTORE_STATEMENT_TIMEOUT_MS", "-1");

        let err = StoreConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("SHARDSTORE_STATEMENT_TIMEOUT_MS", _)
        ));
    }

    #[test]
    fn test_config_invalid_run_migrations() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("SHARDSTORE_DATABASE_URL", "sqlite::memory:");
        guard.set("SHARDSTORE_RUN_MIGRATIONS", "maybe");

        assert!(StoreConfig::from_env().is_err());
    }

    #[test]
    fn test_backend_kind_from_url() {
        assert_eq!(
            BackendKind::from_url("postgresql://u:p@db/prod"),
            Some(BackendKind::Postgres)
        );
        assert_eq!(
            BackendKind::from_url("sqlite::memory:"),
            Some(BackendKind::Sqlite)
        );
        assert_eq!(BackendKind::from_url("redis://x"), None);
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
