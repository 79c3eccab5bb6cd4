//! Traits describing a native database driver

use super::types::{
    CommandBehavior, CommandType, ConnectionState, IsolationLevel, Parameter, Parameters, Rows,
    UpdateRowSource, Value,
};
use crate::error::Result;
use async_trait::async_trait;
use std::any::Any;
use std::time::Duration;

/// Object-safe connection surface
///
/// Implemented by every native connection and by
/// [`ReliableConnection`](crate::connection::ReliableConnection), so a
/// retrying connection can stand in wherever a `&mut dyn DbConnection` is
/// expected.
#[async_trait]
pub trait DbConnection: Send {
    /// Connection string used by [`open`](Self::open)
    fn connection_string(&self) -> &str;

    /// Time allowed for [`open`](Self::open) before it fails
    fn connection_timeout(&self) -> Duration;

    /// Name of the current database
    fn database(&self) -> &str;

    /// Current lifecycle state
    fn state(&self) -> ConnectionState;

    /// Establish the connection
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is already open or the server
    /// cannot be reached.
    async fn open(&mut self) -> Result<()>;

    /// Release the connection; closing a closed connection is a no-op
    async fn close(&mut self) -> Result<()>;

    /// Switch the current database of an open connection
    async fn change_database(&mut self, database: &str) -> Result<()>;

    /// Downcasting hook used to recognize the concrete connection type
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Name of the concrete type, for error messages
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Object-safe transaction handle
pub trait DbTransaction: Send + Sync {
    /// Isolation level the transaction was started with
    fn isolation_level(&self) -> IsolationLevel;

    /// Downcasting hook used to recognize the concrete transaction type
    fn as_any(&self) -> &dyn Any;

    /// Name of the concrete type, for error messages
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Full typed surface of a native connection
#[async_trait]
pub trait NativeConnection: DbConnection + Sized + 'static {
    /// Command type created by this connection
    type Command: NativeCommand<Connection = Self>;

    /// Transaction handle type of this connection
    type Transaction: DbTransaction + Clone + 'static;

    /// Replace the connection string of a closed connection
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`](crate::Error::InvalidOperation)
    /// while the connection is open.
    fn set_connection_string(&mut self, connection_string: &str) -> Result<()>;

    /// Start a transaction on the open connection
    async fn begin_transaction(
        &mut self,
        isolation_level: Option<IsolationLevel>,
    ) -> Result<Self::Transaction>;

    /// Commit a transaction started on this connection
    async fn commit(&mut self, transaction: &Self::Transaction) -> Result<()>;

    /// Roll back a transaction started on this connection
    async fn rollback(&mut self, transaction: &Self::Transaction) -> Result<()>;

    /// Create a command bound to this connection type
    fn create_command(&self) -> Self::Command;
}

/// Full typed surface of a native command
///
/// The connection is passed explicitly to every execution so the command
/// never owns or borrows its connection between calls.
#[async_trait]
pub trait NativeCommand: Send + 'static {
    /// Connection type this command executes on
    type Connection: NativeConnection;

    /// Statement text (or procedure / table name, depending on the type)
    fn command_text(&self) -> &str;

    /// Replace the statement text
    fn set_command_text(&mut self, text: &str);

    /// Time allowed for one execution; zero means no limit
    fn command_timeout(&self) -> Duration;

    /// Replace the execution time limit
    fn set_command_timeout(&mut self, timeout: Duration);

    /// How the command text is interpreted
    fn command_type(&self) -> CommandType;

    /// Change how the command text is interpreted
    fn set_command_type(&mut self, command_type: CommandType);

    /// Bound parameters
    fn parameters(&self) -> &Parameters;

    /// Bound parameters, mutably
    fn parameters_mut(&mut self) -> &mut Parameters;

    /// How results are applied to the source row
    fn updated_row_source(&self) -> UpdateRowSource;

    /// Change how results are applied to the source row
    fn set_updated_row_source(&mut self, source: UpdateRowSource);

    /// Transaction the command runs in, if any
    fn transaction(&self) -> Option<&<Self::Connection as NativeConnection>::Transaction>;

    /// Enlist the command in a transaction, or clear it with `None`
    fn set_transaction(
        &mut self,
        transaction: Option<<Self::Connection as NativeConnection>::Transaction>,
    );

    /// Create an unbound parameter
    fn create_parameter(&self) -> Parameter {
        Parameter::default()
    }

    /// Compile the statement on the server without running it
    async fn prepare(&mut self, connection: &mut Self::Connection) -> Result<()>;

    /// Abort the execution in progress
    fn cancel(&self);

    /// Execute a statement and return the number of affected rows
    async fn execute_non_query(&mut self, connection: &mut Self::Connection) -> Result<u64>;

    /// Execute a query and materialize its rows
    async fn execute_reader(
        &mut self,
        connection: &mut Self::Connection,
        behavior: CommandBehavior,
    ) -> Result<Rows>;

    /// Execute a query and return the first column of the first row
    ///
    /// Returns [`Value::Null`] when the query produced no rows.
    async fn execute_scalar(&mut self, connection: &mut Self::Connection) -> Result<Value>;
}

/// Factory for native connections
pub trait Driver: Send + Sync {
    /// Connection type produced by this driver
    type Connection: NativeConnection;

    /// Create a closed connection for `connection_string` (no I/O)
    fn create_connection(&self, connection_string: &str) -> Self::Connection;
}
