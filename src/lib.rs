//! # reliable-sql
//!
//! Transient-fault handling for database connections.
//!
//! ## Design Philosophy
//!
//! reliable-sql is designed to be:
//! - **Drop-in** - Retrying connections implement the same connection trait
//!   as native ones
//! - **Explicit** - No global default policy; every policy is built and
//!   threaded through constructors
//! - **Observable** - Every retry is announced to listeners and on a
//!   broadcast channel before the backoff wait
//! - **Honest about failure** - Permanent errors surface on first occurrence,
//!   exhausted retries surface every error observed
//!
//! ## Architecture
//!
//! - [`detection`]: decides which errors are transient
//! - [`backoff`]: delay schedules between retries
//! - [`retry`]: the retry loop ([`RetryPolicy`])
//! - [`driver`]: native driver surface and the bundled SQLite driver
//! - [`connection`] / [`command`]: retrying decorators around native objects
//! - [`manager`]: connection factory and scoped execution
//!
//! ## Quick Start
//!
//! ```no_run
//! use reliable_sql::driver::SqliteDriver;
//! use reliable_sql::{ConnectionManager, ManagerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ManagerConfig::from_json(
//!         r#"{
//!             "connection_string": "sqlite://app.db?mode=rwc",
//!             "retry": {
//!                 "max_retries": 5,
//!                 "backoff": {"kind": "exponential", "min_backoff": 100, "max_backoff": 5000, "delta_backoff": 200},
//!                 "detection": "sqlite"
//!             }
//!         }"#,
//!     )?;
//!     let manager = ConnectionManager::from_config(SqliteDriver::default(), &config)?;
//!
//!     // Subscribe to retry events
//!     let mut events = manager.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Retry #{}: {}", event.current_retry_count, event.error);
//!         }
//!     });
//!
//!     let mut connection = manager.create_connection();
//!     let mut command = connection.create_command()?;
//!     command.set_command_text("SELECT COUNT(*) FROM sqlite_master");
//!     let tables = command.execute_scalar().await?;
//!     println!("{tables:?}");
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Backoff strategies
pub mod backoff;
/// Retrying command decorator
pub mod command;
/// Configuration types
pub mod config;
/// Retrying connection decorator
pub mod connection;
/// Transient error detection
pub mod detection;
/// Native driver abstraction and the SQLite driver
pub mod driver;
/// Error types
pub mod error;
/// Connection factory and scoped execution
pub mod manager;
/// Retry policy execution engine
pub mod retry;
/// Synthetic errors and a scripted mock driver for tests
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export commonly used types
pub use backoff::BackoffStrategy;
pub use command::ReliableCommand;
pub use config::{ManagerConfig, RetryConfig, TransientDetection};
pub use connection::ReliableConnection;
pub use detection::{
    AlwaysTransient, ExtendedSqlDetector, Layered, MessagePatternDetector, NeverTransient,
    SqlDatabaseDetector, SqliteDetector, TransientErrorDetector,
};
pub use error::{DriverError, Error, Result, RetryDetails, RetryExhausted};
pub use manager::ConnectionManager;
pub use retry::{RetryAttemptContext, RetryListener, RetryPolicy, RetryingEvent};
