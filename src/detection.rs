//! Transient error detection
//!
//! A [`TransientErrorDetector`] decides whether an error is worth retrying.
//! Only [`Error::Driver`] errors are ever considered transient by the built-in
//! detectors; every other category (contract violations, configuration
//! errors, exhausted retry aggregates) is permanent.
//!
//! Detectors compose with [`Layered`]: the secondary detector is consulted
//! only when the primary one says "not transient". [`ExtendedSqlDetector`]
//! uses this to add message-text matching on top of the error-number
//! catalogue, because some transport failures are reported without a
//! meaningful error number.

use crate::error::Error;
use std::fmt;

/// Trait for deciding whether an error is transient
///
/// Transient failures (service busy, failover, dropped transport) should
/// return `true`. Permanent failures (syntax errors, authentication failures,
/// constraint violations) should return `false`.
///
/// Implementations must not panic: an error of an unexpected shape is
/// simply not transient.
pub trait TransientErrorDetector: Send + Sync {
    /// Returns true if the operation that produced `error` should be retried
    fn is_transient(&self, error: &Error) -> bool;
}

impl<F> TransientErrorDetector for F
where
    F: Fn(&Error) -> bool + Send + Sync,
{
    fn is_transient(&self, error: &Error) -> bool {
        self(error)
    }
}

/// Error numbers of the SQL Database transient catalogue
pub const SQL_DATABASE_TRANSIENT_ERRORS: &[i32] = &[
    // The service is currently busy
    40501,
    // A severe error occurred on the current command
    40540,
    // Database is not currently available
    40613,
    // Resource limit reached
    10928,
    // Transport-level error when receiving results
    10929,
    // Replica is not primary (failover in progress)
    40143,
    // The service has encountered an error processing your request
    40197,
    // Connection initialization failed before login
    233,
    // Connection aborted by the software in the host machine
    10053,
    // Connection forcibly closed by the remote host
    10054,
    // Network-related error while establishing the connection
    10060,
    // The instance does not support encryption
    20,
    // Connection established but an error occurred during login
    64,
];

/// Error numbers of the SQLite busy/locked family
pub const SQLITE_TRANSIENT_ERRORS: &[i32] = &[
    // SQLITE_BUSY
    5,
    // SQLITE_LOCKED
    6,
    // SQLITE_BUSY_RECOVERY
    261,
    // SQLITE_LOCKED_SHAREDCACHE
    262,
    // SQLITE_BUSY_SNAPSHOT
    517,
    // SQLITE_BUSY_TIMEOUT
    773,
];

/// Message fragments that mark an error as transient even without a known number
pub const DEFAULT_TRANSIENT_MESSAGES: &[&str] =
    &["physical connection is not usable", "timeout expired"];

/// Catalogue-based detector for SQL Database error numbers
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlDatabaseDetector;

impl TransientErrorDetector for SqlDatabaseDetector {
    fn is_transient(&self, error: &Error) -> bool {
        match error {
            Error::Driver(e) => SQL_DATABASE_TRANSIENT_ERRORS.contains(&e.number),
            _ => false,
        }
    }
}

/// Catalogue-based detector for SQLite busy/locked errors
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDetector;

impl TransientErrorDetector for SqliteDetector {
    fn is_transient(&self, error: &Error) -> bool {
        match error {
            Error::Driver(e) => SQLITE_TRANSIENT_ERRORS.contains(&e.number),
            _ => false,
        }
    }
}

/// Detector matching substrings of a driver error's text
///
/// Matching is case-insensitive and runs against the full string
/// representation of the error, not only its message.
#[derive(Debug, Clone)]
pub struct MessagePatternDetector {
    patterns: Vec<String>,
}

impl MessagePatternDetector {
    /// Create a detector from custom patterns
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .collect(),
        }
    }

    /// Patterns this detector matches (lower-cased)
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl Default for MessagePatternDetector {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSIENT_MESSAGES)
    }
}

impl TransientErrorDetector for MessagePatternDetector {
    fn is_transient(&self, error: &Error) -> bool {
        let Error::Driver(driver_error) = error else {
            return false;
        };

        let text = driver_error.to_string().to_lowercase();
        match self.patterns.iter().find(|p| text.contains(p.as_str())) {
            Some(pattern) => {
                tracing::debug!(
                    number = driver_error.number,
                    pattern = %pattern,
                    "Driver error classified as transient by message"
                );
                true
            }
            None => false,
        }
    }
}

/// Two detectors checked in order; the secondary only when the primary says no
#[derive(Debug, Clone, Default)]
pub struct Layered<P, S> {
    primary: P,
    secondary: S,
}

impl<P, S> Layered<P, S> {
    /// Stack `secondary` underneath `primary`
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }
}

impl<P, S> TransientErrorDetector for Layered<P, S>
where
    P: TransientErrorDetector,
    S: TransientErrorDetector,
{
    fn is_transient(&self, error: &Error) -> bool {
        self.primary.is_transient(error) || self.secondary.is_transient(error)
    }
}

/// SQL Database catalogue extended with message-text matching
pub type ExtendedSqlDetector = Layered<SqlDatabaseDetector, MessagePatternDetector>;

impl ExtendedSqlDetector {
    /// Catalogue detector plus the default message patterns
    pub fn extended() -> Self {
        Layered::new(SqlDatabaseDetector, MessagePatternDetector::default())
    }
}

/// Treats every error as transient
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysTransient;

impl TransientErrorDetector for AlwaysTransient {
    fn is_transient(&self, _error: &Error) -> bool {
        true
    }
}

/// Treats every error as permanent
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverTransient;

impl TransientErrorDetector for NeverTransient {
    fn is_transient(&self, _error: &Error) -> bool {
        false
    }
}

impl fmt::Debug for dyn TransientErrorDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransientErrorDetector")
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DriverError, RetryExhausted};
    use crate::testing::SyntheticErrorBuilder;

    /// Number the driver reports for errors that carry no SQL error number
    const GENERIC_DRIVER_ERROR: i32 = -2146232060;

    fn official_errors() -> Vec<Error> {
        [
            (40501, "The service is currently busy. Retry the request after 10 seconds."),
            (40540, "A severe error occurred on the current command."),
            (40613, "Database 'db' on server 'srv' is not currently available."),
            (10928, "Resource ID: 1. The request limit for the database is 90 and has been reached."),
            (10929, "A transport-level error has occurred when receiving results from the server."),
            (40143, "The replica that the data node hosts for the requested partition is not primary."),
            (40197, "The service has encountered an error processing your request."),
            (233, "The column 'c' in table 't' cannot be null."),
            (10053, "Could not convert the data value due to reasons other than sign mismatch or overflow."),
            (10054, "The data value for one or more columns overflowed the type used by the provider."),
            (10060, "A network-related or instance-specific error occurred while establishing a connection."),
            (20, "fatal errors"),
            (64, "The instance of SQL Server you attempted to connect to does not support encryption."),
        ]
        .into_iter()
        .map(|(number, message)| {
            SyntheticErrorBuilder::new()
                .number(number)
                .message(message)
                .build()
        })
        .collect()
    }

    fn unofficial_errors() -> Vec<Error> {
        [
            "A transport-level error has occurred when receiving results from the server. \
             (provider: Session Provider, error: 19 - Physical connection is not usable)",
            "Timeout expired.  The timeout period elapsed prior to completion of the operation \
             or the server is not responding.",
        ]
        .into_iter()
        .map(|message| {
            SyntheticErrorBuilder::new()
                .number(GENERIC_DRIVER_ERROR)
                .message(message)
                .build()
        })
        .collect()
    }

    #[test]
    fn catalogue_errors_are_transient_for_base_detector() {
        for error in official_errors() {
            assert!(
                SqlDatabaseDetector.is_transient(&error),
                "{error} should be transient"
            );
        }
    }

    #[test]
    fn text_only_errors_are_not_transient_for_base_detector() {
        for error in unofficial_errors() {
            assert!(
                !SqlDatabaseDetector.is_transient(&error),
                "{error} is not in the catalogue"
            );
        }
    }

    #[test]
    fn extended_detector_handles_catalogue_and_text_errors() {
        let detector = ExtendedSqlDetector::extended();
        for error in official_errors().into_iter().chain(unofficial_errors()) {
            assert!(detector.is_transient(&error), "{error} should be transient");
        }
    }

    #[test]
    fn extended_detector_rejects_ordinary_driver_errors() {
        let detector = ExtendedSqlDetector::extended();
        let syntax = Error::from(DriverError::new(102, "Incorrect syntax near 'SELEC'."));
        let login = Error::from(DriverError::new(18456, "Login failed for user 'sa'."));
        let not_null = Error::from(DriverError::new(
            515,
            "Cannot insert the value NULL into column 'name'; column does not allow nulls.",
        ));
        let conversion = Error::from(DriverError::new(
            245,
            "Conversion failed when converting the varchar value 'abc' to data type int.",
        ));
        for error in [syntax, login, not_null, conversion] {
            assert!(!detector.is_transient(&error), "{error}");
        }
    }

    #[test]
    fn message_matching_is_case_insensitive() {
        let detector = MessagePatternDetector::default();
        let err = Error::from(DriverError::new(0, "TIMEOUT EXPIRED while reading"));
        assert!(detector.is_transient(&err));
    }

    #[test]
    fn non_driver_errors_are_never_transient() {
        let detector = ExtendedSqlDetector::extended();
        let errors = [
            Error::Other("timeout expired".to_string()),
            Error::InvalidOperation("physical connection is not usable".to_string()),
            Error::ObjectDisposed,
            Error::UnsupportedConnectionType("x"),
        ];
        for error in errors {
            assert!(!detector.is_transient(&error), "{error:?}");
        }
    }

    #[test]
    fn aggregates_are_not_unwrapped() {
        let inner: Error = DriverError::new(40501, "busy").into();
        assert!(SqlDatabaseDetector.is_transient(&inner));

        let aggregate: Error = RetryExhausted {
            errors: vec![inner],
            attempts: 0,
            first_occurrence: chrono::Utc::now(),
        }
        .into();
        assert!(!ExtendedSqlDetector::extended().is_transient(&aggregate));
    }

    #[test]
    fn sqlite_detector_recognizes_busy_and_locked() {
        for number in [5, 6, 517] {
            let err = Error::from(DriverError::new(number, "database is locked"));
            assert!(SqliteDetector.is_transient(&err), "code {number}");
        }
        let constraint = Error::from(DriverError::new(1299, "NOT NULL constraint failed"));
        assert!(!SqliteDetector.is_transient(&constraint));
    }

    #[test]
    fn layered_consults_secondary_only_as_fallback() {
        let only_40501 = |e: &Error| e.driver_number() == Some(40501);
        let only_5 = |e: &Error| e.driver_number() == Some(5);
        let detector = Layered::new(only_40501, only_5);

        assert!(detector.is_transient(&DriverError::new(40501, "").into()));
        assert!(detector.is_transient(&DriverError::new(5, "").into()));
        assert!(!detector.is_transient(&DriverError::new(6, "").into()));
    }

    #[test]
    fn custom_patterns_replace_defaults() {
        let detector = MessagePatternDetector::new(["Deadlock Victim"]);
        assert_eq!(detector.patterns(), ["deadlock victim"]);
        assert!(detector.is_transient(&DriverError::new(1205, "chosen as the deadlock victim").into()));
        assert!(!detector.is_transient(&DriverError::new(0, "timeout expired").into()));
    }

    #[test]
    fn always_and_never() {
        let err = Error::Other("anything".to_string());
        assert!(AlwaysTransient.is_transient(&err));
        assert!(!NeverTransient.is_transient(&err));
    }
}
