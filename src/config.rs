//! Configuration types for reliable-sql

use crate::backoff::BackoffStrategy;
use crate::detection::{
    AlwaysTransient, ExtendedSqlDetector, NeverTransient, SqlDatabaseDetector, SqliteDetector,
    TransientErrorDetector,
};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which built-in detector decides what is transient
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientDetection {
    /// SQL Database error-number catalogue only
    SqlDatabase,
    /// Catalogue plus message-text matching (default)
    #[default]
    Extended,
    /// SQLite busy/locked codes
    Sqlite,
    /// Retry every error
    Always,
    /// Never retry
    Never,
}

impl TransientDetection {
    /// Instantiate the detector this setting names
    pub fn detector(&self) -> Arc<dyn TransientErrorDetector> {
        match self {
            TransientDetection::SqlDatabase => Arc::new(SqlDatabaseDetector),
            TransientDetection::Extended => Arc::new(ExtendedSqlDetector::extended()),
            TransientDetection::Sqlite => Arc::new(SqliteDetector),
            TransientDetection::Always => Arc::new(AlwaysTransient),
            TransientDetection::Never => Arc::new(NeverTransient),
        }
    }
}

/// Retry behavior configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt (default: 10)
    ///
    /// 0 disables retrying.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay schedule between retries (default: fixed 100ms)
    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Which errors are retried (default: extended)
    #[serde(default)]
    pub detection: TransientDetection,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffStrategy::default(),
            detection: TransientDetection::default(),
        }
    }
}

impl RetryConfig {
    /// Check the configuration for inconsistent values
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        self.backoff.validate().map_err(|e| match e {
            Error::InvalidArgument { name, reason } => {
                Error::config(reason, format!("backoff.{name}"))
            }
            other => other,
        })
    }

    /// Build a retry policy from this configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration does not validate.
    pub fn build_policy(&self) -> Result<RetryPolicy> {
        self.validate()?;
        Ok(RetryPolicy::with_detector(
            self.detection.detector(),
            self.backoff,
            self.max_retries,
        ))
    }
}

/// Configuration of a [`ConnectionManager`](crate::manager::ConnectionManager)
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Connection string handed to the native driver
    pub connection_string: String,

    /// Retry behavior shared by every connection the manager creates
    #[serde(default)]
    pub retry: RetryConfig,
}

impl ManagerConfig {
    /// Parse a configuration from JSON
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the JSON is malformed or the configuration
    /// does not validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ManagerConfig = serde_json::from_str(json).map_err(|e| Error::Config {
            message: e.to_string(),
            key: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for inconsistent values
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        self.retry.validate().map_err(|e| match e {
            Error::Config {
                message,
                key: Some(key),
            } => Error::config(message, format!("retry.{key}")),
            other => other,
        })
    }
}

fn default_max_retries() -> u32 {
    10
}

// Duration serialization helper (integer milliseconds)
pub(crate) mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
