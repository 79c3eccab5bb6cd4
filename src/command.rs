//! Retrying command decorator
//!
//! A [`ReliableCommand`] borrows its [`ReliableConnection`] and owns a native
//! command plus its own clone of the connection's retry policy. Every
//! execution verb runs through that policy; inside each attempt the native
//! connection is opened first if it is not open, so a dropped connection is
//! re-established as part of the retry.

use crate::connection::ReliableConnection;
use crate::driver::{
    CommandBehavior, CommandType, ConnectionState, DbConnection, DbTransaction, NativeCommand,
    NativeConnection, Parameter, Parameters, Rows, UpdateRowSource, Value,
};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use futures::FutureExt;
use std::time::Duration;

/// Native command wrapped with retry behavior
///
/// The command cannot outlive the connection it borrows. It can be moved to
/// another [`ReliableConnection`] of the same native type with
/// [`set_connection`](Self::set_connection).
pub struct ReliableCommand<'c, C: NativeConnection> {
    connection: &'c mut ReliableConnection<C>,
    native: C::Command,
    policy: RetryPolicy,
}

impl<'c, C: NativeConnection> ReliableCommand<'c, C> {
    pub(crate) fn new(connection: &'c mut ReliableConnection<C>) -> Self {
        let native = connection.native().create_command();
        let policy = connection.policy().clone();
        Self {
            connection,
            native,
            policy,
        }
    }

    /// Connection the command executes on
    pub fn connection(&self) -> &ReliableConnection<C> {
        &*self.connection
    }

    /// Mutable access to the connection the command executes on
    pub fn connection_mut(&mut self) -> &mut ReliableConnection<C> {
        &mut *self.connection
    }

    /// Move the command to another connection
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedConnectionType`] unless `connection` is a
    /// [`ReliableConnection`] over the same native connection type.
    pub fn set_connection(&mut self, connection: &'c mut dyn DbConnection) -> Result<()> {
        let type_name = connection.type_name();
        match connection
            .as_any_mut()
            .downcast_mut::<ReliableConnection<C>>()
        {
            Some(reliable) => {
                self.connection = reliable;
                Ok(())
            }
            None => Err(Error::UnsupportedConnectionType(type_name)),
        }
    }

    /// Retry policy of this command
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Mutable access to the policy, e.g. to attach listeners
    pub fn policy_mut(&mut self) -> &mut RetryPolicy {
        &mut self.policy
    }

    /// The wrapped native command
    pub fn native(&self) -> &C::Command {
        &self.native
    }

    /// Statement text
    pub fn command_text(&self) -> &str {
        self.native.command_text()
    }

    /// Replace the statement text
    pub fn set_command_text(&mut self, text: &str) {
        self.native.set_command_text(text);
    }

    /// Time allowed for one attempt; zero means no limit
    pub fn command_timeout(&self) -> Duration {
        self.native.command_timeout()
    }

    /// Replace the per-attempt time limit
    pub fn set_command_timeout(&mut self, timeout: Duration) {
        self.native.set_command_timeout(timeout);
    }

    /// How the command text is interpreted
    pub fn command_type(&self) -> CommandType {
        self.native.command_type()
    }

    /// Change how the command text is interpreted
    pub fn set_command_type(&mut self, command_type: CommandType) {
        self.native.set_command_type(command_type);
    }

    /// Bound parameters
    pub fn parameters(&self) -> &Parameters {
        self.native.parameters()
    }

    /// Bound parameters, mutably
    pub fn parameters_mut(&mut self) -> &mut Parameters {
        self.native.parameters_mut()
    }

    /// How results are applied to the source row
    pub fn updated_row_source(&self) -> UpdateRowSource {
        self.native.updated_row_source()
    }

    /// Change how results are applied to the source row
    pub fn set_updated_row_source(&mut self, source: UpdateRowSource) {
        self.native.set_updated_row_source(source);
    }

    /// Create an unbound parameter
    pub fn create_parameter(&self) -> Parameter {
        self.native.create_parameter()
    }

    /// Native transaction the command runs in, if any
    pub fn transaction(&self) -> Option<&C::Transaction> {
        self.native.transaction()
    }

    /// Enlist the command in a transaction, or clear it with `None`
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedTransactionType`] if `transaction` was not
    /// produced by the same native driver.
    pub fn set_transaction(&mut self, transaction: Option<&dyn DbTransaction>) -> Result<()> {
        let Some(transaction) = transaction else {
            self.native.set_transaction(None);
            return Ok(());
        };
        match transaction.as_any().downcast_ref::<C::Transaction>() {
            Some(native) => {
                self.native.set_transaction(Some(native.clone()));
                Ok(())
            }
            None => Err(Error::UnsupportedTransactionType(transaction.type_name())),
        }
    }

    /// Compile the statement on the open native connection (not retried)
    pub async fn prepare(&mut self) -> Result<()> {
        self.connection.ensure_not_disposed()?;
        tracing::debug!(command = %self.native.command_text(), "Preparing command");
        self.native.prepare(self.connection.native_mut()).await
    }

    /// Abort the native execution in progress
    pub fn cancel(&self) {
        self.native.cancel();
    }

    /// Execute a statement and return the number of affected rows
    ///
    /// # Errors
    ///
    /// - The native error if it is not transient
    /// - [`Error::RetriesExhausted`] if transient errors outlive the budget
    /// - [`Error::ObjectDisposed`] if the connection has been disposed
    pub async fn execute_non_query(&mut self) -> Result<u64> {
        tracing::debug!(
            verb = "execute_non_query",
            command = %self.native.command_text(),
            "Executing command"
        );
        let (mut state, policy) = self.parts()?;
        policy
            .execute_with(&mut state, |(connection, command)| {
                async move {
                    open_if_needed(&mut **connection).await?;
                    command.execute_non_query(&mut **connection).await
                }
                .boxed()
            })
            .await
    }

    /// Execute a query and materialize all of its rows
    pub async fn execute_reader(&mut self) -> Result<Rows> {
        self.execute_reader_with(CommandBehavior::Default).await
    }

    /// Execute a query with a reader behavior hint
    pub async fn execute_reader_with(&mut self, behavior: CommandBehavior) -> Result<Rows> {
        tracing::debug!(
            verb = "execute_reader",
            ?behavior,
            command = %self.native.command_text(),
            "Executing command"
        );
        let (mut state, policy) = self.parts()?;
        policy
            .execute_with(&mut state, move |(connection, command)| {
                async move {
                    open_if_needed(&mut **connection).await?;
                    command.execute_reader(&mut **connection, behavior).await
                }
                .boxed()
            })
            .await
    }

    /// Execute a query and return the first column of the first row
    pub async fn execute_scalar(&mut self) -> Result<Value> {
        tracing::debug!(
            verb = "execute_scalar",
            command = %self.native.command_text(),
            "Executing command"
        );
        let (mut state, policy) = self.parts()?;
        policy
            .execute_with(&mut state, |(connection, command)| {
                async move {
                    open_if_needed(&mut **connection).await?;
                    command.execute_scalar(&mut **connection).await
                }
                .boxed()
            })
            .await
    }

    /// Split into the per-attempt state and the policy driving the attempts
    #[allow(clippy::type_complexity)]
    fn parts(&mut self) -> Result<((&mut C, &mut C::Command), &mut RetryPolicy)> {
        self.connection.ensure_not_disposed()?;
        Ok((
            (self.connection.native_mut(), &mut self.native),
            &mut self.policy,
        ))
    }
}

/// Open the native connection unless it already is
///
/// A broken connection is closed first.
async fn open_if_needed<C: NativeConnection>(connection: &mut C) -> Result<()> {
    match connection.state() {
        ConnectionState::Open => return Ok(()),
        ConnectionState::Broken => connection.close().await?,
        _ => {}
    }
    tracing::debug!(state = %connection.state(), "Opening connection before command execution");
    connection.open().await
}
