//! Service settings
//!
//! Settings are read once at startup from an optional config file, then the
//! environment (prefix `APP`, nested keys separated by `__`) and an optional
//! `.env` file. Environment values override file values. Every field has a
//! default, so an empty environment yields a working configuration.
//!
//! The file is `config.{toml,yaml,json}` in the working directory, or the
//! path named by `APP_CONFIG_FILE`.
//!
//! # Environment Variables
//!
//! * `APP_RETRY__BACKOFF` - `fixed`, `linear` or `exponential` (default: linear)
//! * `APP_RETRY__BASE_MS` - Base wait in milliseconds (default: 1000)
//! * `APP_RETRY__STEP_MS` - Linear increment in milliseconds (default: 1000)
//! * `APP_RETRY__FACTOR` - Exponential growth factor (default: 2.0)
//! * `APP_RETRY__MAX_MS` - Wait cap in milliseconds, 0 disables (default: 10000)
//! * `APP_RETRY__JITTER` - Jitter fraction in `[0, 1)` (default: 0.1)
//! * `APP_RETRY__MAX_ATTEMPTS` - Attempt budget, 0 is unbounded (default: 3)
//! * `APP_DATABASE__URL` or `DATABASE_URL` - PostgreSQL connection string
//! * `APP_LOG_LEVEL` - trace, debug, info, warn, error (default: info)

use std::time::Duration;

use config::{Config, ConfigError, Environment, File, Source};
use core_kernel::{BackoffKind, BackoffPolicy, CoreError, Retrier, RetryPolicy};
use serde::Deserialize;

use crate::error::DatabaseError;
use crate::pool::DatabaseConfig;

/// Top-level service settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub retry: RetrySettings,
    /// Log filter directive
    pub log_level: String,
    /// Emit logs as JSON lines
    pub log_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            retry: RetrySettings::default(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Settings {
    /// Loads settings from the config file (if present), `.env` (if
    /// present) and the process environment
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but cannot be parsed
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let file = std::env::var("APP_CONFIG_FILE").unwrap_or_else(|_| "config".to_string());
        Self::load_with_file(&file)
    }

    /// Like [`Settings::load`] with an explicit config file path
    ///
    /// A missing file is not an error; the path may omit the extension.
    pub fn load_with_file(path: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
            .build()?
            .try_deserialize::<Self>()?
            .checked()
    }

    /// Loads settings from an arbitrary configuration source
    pub fn from_source<S>(source: S) -> Result<Self, ConfigError>
    where
        S: Source + Send + Sync + 'static,
    {
        Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize::<Self>()?
            .checked()
    }

    fn checked(self) -> Result<Self, ConfigError> {
        self.retry
            .check()
            .map_err(|e| ConfigError::Message(e.to_string()))?;
        Ok(self)
    }
}

/// Database connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let defaults = DatabaseConfig::default();
        Self {
            url: defaults.url,
            max_connections: defaults.max_connections,
            min_connections: defaults.min_connections,
            connect_timeout_secs: defaults.connect_timeout.as_secs(),
        }
    }
}

impl DatabaseSettings {
    pub fn pool_config(&self) -> DatabaseConfig {
        DatabaseConfig::new(self.url.clone())
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }
}

/// Numeric parameters for the retry and backoff policies
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub backoff: BackoffKind,
    pub base_ms: u64,
    pub step_ms: u64,
    pub factor: f64,
    pub max_ms: u64,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            backoff: BackoffKind::Linear,
            base_ms: 1_000,
            step_ms: 1_000,
            factor: 2.0,
            max_ms: 10_000,
            jitter: 0.1,
            max_attempts: 3,
        }
    }
}

impl RetrySettings {
    /// Rejects parameters no backoff can be built from
    pub fn check(&self) -> Result<(), CoreError> {
        let valid_factor = self.factor.is_finite() && self.factor > 0.0;
        if self.backoff == BackoffKind::Exponential && !valid_factor {
            return Err(CoreError::configuration(format!(
                "exponential backoff factor must be positive, got {}",
                self.factor
            )));
        }
        Ok(())
    }

    /// Builds the backoff policy selected by `backoff`
    pub fn backoff_policy(&self) -> BackoffPolicy {
        let base = Duration::from_millis(self.base_ms);
        let max = Duration::from_millis(self.max_ms);

        let policy = match self.backoff {
            BackoffKind::Fixed => BackoffPolicy::fixed(base),
            BackoffKind::Linear => {
                BackoffPolicy::linear(base, Duration::from_millis(self.step_ms), max)
            }
            BackoffKind::Exponential => BackoffPolicy::exponential(base, self.factor, max),
        };
        policy.with_jitter(self.jitter)
    }

    /// Builds the retry policy for database calls
    ///
    /// Only errors whose kind is retryable are retried.
    pub fn retry_policy(&self) -> RetryPolicy<DatabaseError> {
        RetryPolicy::new()
            .with_max_attempts(self.max_attempts)
            .with_backoff(self.backoff_policy())
            .with_predicate(DatabaseError::is_retryable)
    }

    pub fn retrier(&self) -> Retrier<DatabaseError> {
        Retrier::new(self.retry_policy())
    }
}
