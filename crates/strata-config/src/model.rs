use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strata_common::{Error, Result, is_sql_identifier};

/// Top-level configuration, read from `strata.yml` / `strata.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub database_url: Option<String>,
    pub migrations_dir: PathBuf,
    pub extension: String,
    pub history_table: String,
    pub retry: RetryConfig,
    pub log: LogConfig,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            migrations_dir: PathBuf::from("migrations"),
            extension: "sql".to_string(),
            history_table: "schema_history".to_string(),
            retry: RetryConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl StrataConfig {
    /// The configured connection string, or a config error if none was given.
    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                Error::Config(
                    "no database url configured (set database_url, STRATA_DATABASE_URL or DATABASE_URL)"
                        .into(),
                )
            })
    }

    pub fn validate(&self) -> Result<()> {
        if !is_sql_identifier(&self.history_table) {
            return Err(Error::Config(format!(
                "history_table must be a plain SQL identifier, got {:?}",
                self.history_table
            )));
        }
        if self.extension.is_empty() || self.extension.contains('.') {
            return Err(Error::Config(format!(
                "extension must be a bare file extension without dots, got {:?}",
                self.extension
            )));
        }
        self.retry.validate()
    }
}

/// Backoff settings for connection-level retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Upper bound of the random extra delay, as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(Error::Config("retry.multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::Config("retry.jitter must be between 0.0 and 1.0".into()));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(Error::Config(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StrataConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.history_table, "schema_history");
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn rejects_unsafe_history_table_names() {
        let config = StrataConfig {
            history_table: "history; DROP TABLE users".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_zero_attempts_and_bad_jitter() {
        let mut config = StrataConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = StrataConfig::default();
        config.retry.jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_database_url_is_a_config_error() {
        let config = StrataConfig::default();
        assert!(matches!(config.database_url(), Err(Error::Config(_))));

        let config = StrataConfig {
            database_url: Some("  ".into()),
            ..Default::default()
        };
        assert!(config.database_url().is_err());
    }
}
