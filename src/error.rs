//! Error types for reliable-sql
//!
//! This module provides the error taxonomy of the library:
//! - Driver errors raised by the native database driver (the only category the
//!   transient detectors inspect)
//! - Exhaustion errors aggregating every failed attempt of a retried operation
//! - Contract errors (type mismatches, invalid arguments, use after dispose)
//! - Configuration errors with the offending key

use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Result type alias for reliable-sql operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for reliable-sql
///
/// `Error` is `Clone` so that the error which triggered a retry can travel
/// inside a [`RetryingEvent`](crate::retry::RetryingEvent) to every subscriber.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Failure reported by the native database driver
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Transient failures persisted past the configured retry budget
    #[error(transparent)]
    RetriesExhausted(Box<RetryExhausted>),

    /// A connection object of a foreign type was assigned to a command
    #[error("unsupported connection type ({0})")]
    UnsupportedConnectionType(&'static str),

    /// A transaction object of a foreign type was assigned to a command
    #[error("unsupported transaction type ({0})")]
    UnsupportedTransactionType(&'static str),

    /// An argument violated the contract of the callee
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument {
        /// Name of the offending argument
        name: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// Operation is not valid in the current state of the object
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The connection has been disposed and can no longer be used
    #[error("cannot access a disposed connection")]
    ObjectDisposed,

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "backoff.max_backoff")
        key: Option<String>,
    },

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error bound to a key
    pub(crate) fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Retry bookkeeping attached to an exhaustion error
    ///
    /// Returns `None` for every error that did not come out of an exhausted
    /// retry loop.
    pub fn retry_details(&self) -> Option<RetryDetails> {
        match self {
            Error::RetriesExhausted(exhausted) => Some(exhausted.details()),
            _ => None,
        }
    }

    /// The driver error number, if this is a driver error
    pub fn driver_number(&self) -> Option<i32> {
        match self {
            Error::Driver(e) => Some(e.number),
            _ => None,
        }
    }
}

/// Error raised by a native database driver
///
/// Carries the vendor error number alongside the message, mirroring the
/// shape of the errors database servers report. Transient detectors classify
/// on these two fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("driver error {number}: {message}")]
pub struct DriverError {
    /// Vendor error number (e.g. 40501 for "service busy", 5 for SQLITE_BUSY)
    pub number: i32,
    /// Message reported by the driver or server
    pub message: String,
}

impl DriverError {
    /// Create a driver error from a number and a message
    pub fn new(number: i32, message: impl Into<String>) -> Self {
        Self {
            number,
            message: message.into(),
        }
    }
}

/// Aggregate failure produced when a transient error outlives the retry budget
///
/// Holds every error observed, ordered by attempt (the first entry is the
/// error of the initial call), together with the retry bookkeeping.
#[derive(Debug, Clone)]
pub struct RetryExhausted {
    /// Every error observed, ordered by attempt
    pub errors: Vec<Error>,
    /// Number of retries performed (total attempts minus one)
    pub attempts: u32,
    /// When the first failure of the sequence happened
    pub first_occurrence: DateTime<Utc>,
}

impl RetryExhausted {
    /// Retry bookkeeping of this failure
    pub fn details(&self) -> RetryDetails {
        RetryDetails {
            attempts: self.attempts,
            first_occurrence: self.first_occurrence,
        }
    }

    /// The error of the final attempt
    pub fn last_error(&self) -> Option<&Error> {
        self.errors.last()
    }
}

impl fmt::Display for RetryExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operation failed after {} retries ({} errors)",
            self.attempts,
            self.errors.len()
        )?;
        if let Some(last) = self.last_error() {
            write!(f, ", last error: {last}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RetryExhausted {}

impl From<RetryExhausted> for Error {
    fn from(exhausted: RetryExhausted) -> Self {
        Error::RetriesExhausted(Box::new(exhausted))
    }
}

/// Retry bookkeeping attached to an exhaustion error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDetails {
    /// Number of retries performed
    pub attempts: u32,
    /// When the first failure of the sequence happened
    pub first_occurrence: DateTime<Utc>,
}
