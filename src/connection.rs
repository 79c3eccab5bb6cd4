//! Retrying connection decorator
//!
//! [`ReliableConnection`] owns a native connection and a [`RetryPolicy`].
//! Opening goes through the policy; everything else is passed straight to the
//! native connection. It implements [`DbConnection`] itself, so it can be
//! handed to any code written against the object-safe connection surface.

use crate::command::ReliableCommand;
use crate::driver::{ConnectionState, DbConnection, IsolationLevel, NativeConnection};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::any::Any;
use std::time::Duration;

/// Native connection wrapped with retry behavior
///
/// Lifecycle: `Closed -> Opening -> Open -> Closed`, plus the terminal
/// `Disposed` state reached through [`dispose`](Self::dispose). Every use of a
/// disposed connection fails with [`Error::ObjectDisposed`].
///
/// Dropping the connection without disposing it releases the native handle
/// through the native type's own `Drop`.
#[derive(Debug)]
pub struct ReliableConnection<C: NativeConnection> {
    native: C,
    policy: RetryPolicy,
    disposed: bool,
}

impl<C: NativeConnection> ReliableConnection<C> {
    /// Wrap a native connection
    ///
    /// The policy instance becomes this connection's own; commands created
    /// from the connection receive clones of it.
    pub fn new(native: C, policy: RetryPolicy) -> Self {
        Self {
            native,
            policy,
            disposed: false,
        }
    }

    /// Retry policy used to open this connection
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Mutable access to the policy, e.g. to attach listeners
    pub fn policy_mut(&mut self) -> &mut RetryPolicy {
        &mut self.policy
    }

    /// The wrapped native connection
    pub fn native(&self) -> &C {
        &self.native
    }

    pub(crate) fn native_mut(&mut self) -> &mut C {
        &mut self.native
    }

    /// Whether [`dispose`](Self::dispose) has been called
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub(crate) fn ensure_not_disposed(&self) -> Result<()> {
        if self.disposed {
            Err(Error::ObjectDisposed)
        } else {
            Ok(())
        }
    }

    /// Create a command bound to this connection
    ///
    /// The command gets its own clone of the connection's policy, with the
    /// same listeners and a fresh attempt context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectDisposed`] if the connection has been disposed.
    pub fn create_command(&mut self) -> Result<ReliableCommand<'_, C>> {
        self.ensure_not_disposed()?;
        Ok(ReliableCommand::new(self))
    }

    /// Replace the connection string of the closed native connection
    pub fn set_connection_string(&mut self, connection_string: &str) -> Result<()> {
        self.ensure_not_disposed()?;
        self.native.set_connection_string(connection_string)
    }

    /// Start a transaction on the native connection (not retried)
    pub async fn begin_transaction(
        &mut self,
        isolation_level: Option<IsolationLevel>,
    ) -> Result<C::Transaction> {
        self.ensure_not_disposed()?;
        self.native.begin_transaction(isolation_level).await
    }

    /// Commit a transaction of the native connection (not retried)
    pub async fn commit(&mut self, transaction: &C::Transaction) -> Result<()> {
        self.ensure_not_disposed()?;
        self.native.commit(transaction).await
    }

    /// Roll back a transaction of the native connection (not retried)
    pub async fn rollback(&mut self, transaction: &C::Transaction) -> Result<()> {
        self.ensure_not_disposed()?;
        self.native.rollback(transaction).await
    }

    /// Close the native connection if needed and mark this one disposed
    ///
    /// Idempotent: disposing twice is a no-op. The connection is disposed even
    /// when closing the native connection fails.
    pub async fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        if self.native.state() != ConnectionState::Closed {
            tracing::debug!(state = %self.native.state(), "Closing connection on dispose");
            self.native.close().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<C: NativeConnection> DbConnection for ReliableConnection<C> {
    fn connection_string(&self) -> &str {
        self.native.connection_string()
    }

    fn connection_timeout(&self) -> Duration {
        self.native.connection_timeout()
    }

    fn database(&self) -> &str {
        self.native.database()
    }

    fn state(&self) -> ConnectionState {
        if self.disposed {
            ConnectionState::Disposed
        } else {
            self.native.state()
        }
    }

    /// Open the native connection through the retry policy
    ///
    /// Opening an open connection is a no-op.
    async fn open(&mut self) -> Result<()> {
        self.ensure_not_disposed()?;
        if self.native.state() == ConnectionState::Open {
            return Ok(());
        }
        let Self { native, policy, .. } = self;
        policy.execute_with(native, |native| native.open()).await
    }

    async fn close(&mut self) -> Result<()> {
        self.ensure_not_disposed()?;
        tracing::debug!(state = %self.native.state(), "Closing connection");
        self.native.close().await
    }

    async fn change_database(&mut self, database: &str) -> Result<()> {
        self.ensure_not_disposed()?;
        self.native.change_database(database).await
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
