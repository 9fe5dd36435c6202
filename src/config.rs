use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub publication: String,
    pub slot_name: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub ssl_mode: SslMode,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    #[default]
    Disable,
    Prefer,
    Require,
}

/// What to do with a commit whose transaction carried no outbox rows.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmptyCommitPolicy {
    /// Advance the slot position without calling the handler.
    #[default]
    Acknowledge,
    /// Call the handler with an empty event list, then advance.
    Dispatch,
}

/// What to do with a column whose type has no JSON mapping.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnknownTypePolicy {
    /// Drop the field from the event and count it.
    #[default]
    Omit,
    /// Fail the row, stopping the relay.
    Reject,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutboxConfig {
    /// Handler retries after the first failed attempt.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    #[serde(default)]
    pub empty_commit: EmptyCommitPolicy,
    #[serde(default)]
    pub unknown_types: UnknownTypePolicy,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            backoff_step_ms: default_backoff_step_ms(),
            status_interval_secs: default_status_interval_secs(),
            empty_commit: EmptyCommitPolicy::default(),
            unknown_types: UnknownTypePolicy::default(),
        }
    }
}

impl OutboxConfig {
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    pub fn backoff_step(&self) -> Duration {
        Duration::from_millis(self.backoff_step_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_OUTBOX")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values the server would otherwise reject mid-handshake.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_slot_name(&self.postgres.slot_name) {
            return Err(Error::Config(format!(
                "invalid replication slot name '{}': use [a-z0-9_], at most 63 characters",
                self.postgres.slot_name
            )));
        }
        if self.postgres.publication.trim().is_empty() {
            return Err(Error::Config(
                "publication name must not be empty".to_string(),
            ));
        }
        if self.postgres.ssl_mode == SslMode::Require {
            return Err(Error::Config(
                "ssl_mode 'require' is not supported by the replication client".to_string(),
            ));
        }
        if self.outbox.status_interval_secs == 0 {
            return Err(Error::Config(
                "status_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection parameters for the replication connection.
    ///
    /// Built field by field so credentials never need URL escaping.
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.postgres.host)
            .port(self.postgres.port)
            .dbname(&self.postgres.database)
            .user(&self.postgres.username)
            .application_name("pg-outbox")
            .connect_timeout(Duration::from_secs(self.postgres.connect_timeout_secs))
            .ssl_mode(match self.postgres.ssl_mode {
                SslMode::Disable => tokio_postgres::config::SslMode::Disable,
                SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
                SslMode::Require => tokio_postgres::config::SslMode::Require,
            });
        if !self.postgres.password.is_empty() {
            pg.password(&self.postgres.password);
        }
        pg
    }
}

fn is_valid_slot_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_retry_count() -> u32 {
    2
}

fn default_backoff_step_ms() -> u64 {
    100
}

fn default_status_interval_secs() -> u64 {
    10
}
