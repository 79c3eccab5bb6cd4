//! Native database driver abstraction
//!
//! This module defines the capability surface the reliability layer wraps.
//! Any driver that implements these traits can be decorated with retry
//! behavior by [`ReliableConnection`](crate::connection::ReliableConnection)
//! and [`ReliableCommand`](crate::command::ReliableCommand).
//!
//! ## Architecture
//!
//! - [`DbConnection`]: object-safe connection surface, shared by native
//!   connections and the retrying decorator so either can be used where a
//!   connection is expected
//! - [`DbTransaction`]: object-safe transaction handle
//! - [`NativeConnection`] / [`NativeCommand`]: the full typed surface of one
//!   concrete driver
//! - [`Driver`]: factory for native connections
//!
//! One concrete driver ships with the crate:
//!
//! - [`SqliteDriver`]: SQLite through `sqlx`
//!
//! ## Usage
//!
//! ```no_run
//! use reliable_sql::driver::{DbConnection, Driver, NativeCommand, NativeConnection, SqliteDriver};
//!
//! # async fn example() -> reliable_sql::Result<()> {
//! let driver = SqliteDriver::default();
//! let mut connection = driver.create_connection("sqlite::memory:");
//! connection.open().await?;
//!
//! let mut command = connection.create_command();
//! command.set_command_text("SELECT 1");
//! let value = command.execute_scalar(&mut connection).await?;
//! assert_eq!(value.as_i64(), Some(1));
//! # Ok(())
//! # }
//! ```

mod sqlite;
mod traits;
mod types;

pub use sqlite::{
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_CONNECTION_TIMEOUT, SqliteCommand, SqliteConnection,
    SqliteDriver, SqliteTransaction, TIMEOUT_ERROR_NUMBER,
};
pub use traits::{DbConnection, DbTransaction, Driver, NativeCommand, NativeConnection};
pub use types::{
    CommandBehavior, CommandType, ConnectionState, IsolationLevel, Parameter, Parameters, Rows,
    UpdateRowSource, Value,
};
