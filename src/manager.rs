//! Connection factory and scoped execution
//!
//! A [`ConnectionManager`] holds a driver, a connection string and a base
//! retry policy. Every connection it creates gets a clone of that policy, and
//! every retry performed by those connections or their commands is re-raised
//! on the manager's event channel.

use crate::config::ManagerConfig;
use crate::connection::ReliableConnection;
use crate::driver::Driver;
use crate::error::Result;
use crate::retry::{RetryPolicy, RetryingEvent};
use futures::future::BoxFuture;
use tokio::sync::broadcast;

/// Capacity of the retry event channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Factory of retrying connections sharing one policy and one event stream
pub struct ConnectionManager<D: Driver> {
    driver: D,
    connection_string: String,
    policy: RetryPolicy,
    event_tx: broadcast::Sender<RetryingEvent>,
}

impl<D: Driver> ConnectionManager<D> {
    /// Create a manager
    ///
    /// # Arguments
    ///
    /// * `driver` - Produces the native connections
    /// * `connection_string` - Handed to every native connection
    /// * `policy` - Base policy; connections receive clones of it
    pub fn new(driver: D, connection_string: impl Into<String>, mut policy: RetryPolicy) -> Self {
        // Lagging or absent receivers never block the retry loop
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let forward_tx = event_tx.clone();
        policy.subscribe(move |event: &RetryingEvent| {
            forward_tx.send(event.clone()).ok();
        });

        Self {
            driver,
            connection_string: connection_string.into(),
            policy,
            event_tx,
        }
    }

    /// Create a manager from configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if the configuration
    /// does not validate.
    pub fn from_config(driver: D, config: &ManagerConfig) -> Result<Self> {
        config.validate()?;
        let policy = config.retry.build_policy()?;
        Ok(Self::new(driver, config.connection_string.clone(), policy))
    }

    /// Connection string handed to every native connection
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Base retry policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Subscribe to retry events of every connection created by this manager
    ///
    /// Multiple subscribers are supported; each receives every event. Dropping
    /// the receiver unsubscribes.
    ///
    /// ```no_run
    /// use reliable_sql::{ConnectionManager, RetryConfig};
    /// use reliable_sql::driver::SqliteDriver;
    ///
    /// # async fn example() -> reliable_sql::Result<()> {
    /// let policy = RetryConfig::default().build_policy()?;
    /// let manager = ConnectionManager::new(SqliteDriver::default(), "sqlite::memory:", policy);
    ///
    /// let mut events = manager.subscribe();
    /// tokio::spawn(async move {
    ///     while let Ok(event) = events.recv().await {
    ///         tracing::warn!(retry = event.current_retry_count, error = %event.error, "retrying");
    ///     }
    /// });
    /// # Ok(())
    /// # }
    /// ```
    pub fn subscribe(&self) -> broadcast::Receiver<RetryingEvent> {
        self.event_tx.subscribe()
    }

    /// Attach a synchronous listener to the base policy
    ///
    /// Only connections created after this call see the listener.
    pub fn on_retrying<F>(&mut self, listener: F)
    where
        F: Fn(&RetryingEvent) + Send + Sync + 'static,
    {
        self.policy.subscribe(listener);
    }

    /// Create a closed connection (no I/O)
    pub fn create_connection(&self) -> ReliableConnection<D::Connection> {
        let native = self.driver.create_connection(&self.connection_string);
        ReliableConnection::new(native, self.policy.clone())
    }

    /// Run `action` on a fresh connection and dispose it afterwards
    ///
    /// The connection is disposed whether the action succeeds or fails. The
    /// action's error is returned unchanged; a failure to dispose is reported
    /// only when the action itself succeeded. If the returned future is
    /// dropped early, the native connection is released by its `Drop`.
    ///
    /// ```no_run
    /// use futures::FutureExt;
    /// use reliable_sql::{ConnectionManager, RetryConfig};
    /// use reliable_sql::driver::SqliteDriver;
    ///
    /// # async fn example() -> reliable_sql::Result<()> {
    /// let manager = ConnectionManager::new(
    ///     SqliteDriver::default(),
    ///     "sqlite::memory:",
    ///     RetryConfig::default().build_policy()?,
    /// );
    /// let answer = manager
    ///     .execute(|connection| {
    ///         async move {
    ///             let mut command = connection.create_command()?;
    ///             command.set_command_text("SELECT 42");
    ///             command.execute_scalar().await
    ///         }
    ///         .boxed()
    ///     })
    ///     .await?;
    /// assert_eq!(answer.as_i64(), Some(42));
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute<T, F>(&self, action: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut ReliableConnection<D::Connection>) -> BoxFuture<'a, Result<T>>,
    {
        let mut connection = self.create_connection();
        let result = action(&mut connection).await;
        let disposed = connection.dispose().await;

        match (result, disposed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(dispose_error)) => Err(dispose_error),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(dispose_error)) => {
                tracing::warn!(
                    error = %dispose_error,
                    "Failed to dispose connection after failed action"
                );
                Err(e)
            }
        }
    }
}
