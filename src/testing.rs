//! Test utilities: synthetic driver errors and a scripted mock driver
//!
//! Available in unit tests and, for downstream crates, behind the
//! `test-utils` feature.
//!
//! [`MockDriver`] produces connections and commands whose failures are
//! scripted up front. Every connection and command created from one driver
//! shares the same script and counters, so a test can inspect what happened
//! after the code under test has consumed the objects.

use crate::driver::{
    CommandBehavior, CommandType, ConnectionState, DbConnection, DbTransaction, Driver,
    IsolationLevel, NativeCommand, NativeConnection, Parameters, Rows, UpdateRowSource, Value,
};
use crate::error::{DriverError, Error, Result};
use async_trait::async_trait;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Builds driver errors carrying an arbitrary number and message
///
/// Real driver errors cannot be constructed without a server that produces
/// them; this builder stands in so classification can be tested directly.
///
/// ```
/// use reliable_sql::testing::SyntheticErrorBuilder;
///
/// let err = SyntheticErrorBuilder::new()
///     .number(40501)
///     .message("The service is currently busy.")
///     .build();
/// assert_eq!(err.driver_number(), Some(40501));
/// ```
#[derive(Debug, Clone, Default)]
pub struct SyntheticErrorBuilder {
    number: i32,
    message: String,
}

impl SyntheticErrorBuilder {
    /// Start from number 0 and an empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the error number
    #[must_use]
    pub fn number(mut self, number: i32) -> Self {
        self.number = number;
        self
    }

    /// Set the error message
    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Build the bare driver error
    pub fn build_driver_error(self) -> DriverError {
        DriverError::new(self.number, self.message)
    }

    /// Build the error as the crate surfaces it
    pub fn build(self) -> Error {
        self.build_driver_error().into()
    }
}

#[derive(Debug, Default)]
struct MockState {
    open_failures: VecDeque<Error>,
    execute_failures: VecDeque<Error>,
    break_on_failure: bool,
    result: Value,
    opens: u32,
    closes: u32,
    executions: u32,
    cancels: u32,
    executed: Vec<String>,
}

/// Scripted in-memory driver
///
/// Cloning the driver shares the script and the counters.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    /// Driver whose operations all succeed
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    /// Make the next `open` calls fail with `errors`, in order
    pub fn fail_open_with(&self, errors: impl IntoIterator<Item = Error>) -> &Self {
        self.state().open_failures.extend(errors);
        self
    }

    /// Make the next command executions fail with `errors`, in order
    pub fn fail_execute_with(&self, errors: impl IntoIterator<Item = Error>) -> &Self {
        self.state().execute_failures.extend(errors);
        self
    }

    /// Mark the connection broken whenever a scripted execution failure fires
    pub fn break_connection_on_failure(&self, enabled: bool) -> &Self {
        self.state().break_on_failure = enabled;
        self
    }

    /// Value returned by successful executions
    pub fn set_result(&self, value: impl Into<Value>) -> &Self {
        self.state().result = value.into();
        self
    }

    /// Number of `open` calls, failed ones included
    pub fn open_calls(&self) -> u32 {
        self.state().opens
    }

    /// Number of `close` calls on open connections
    pub fn close_calls(&self) -> u32 {
        self.state().closes
    }

    /// Number of command executions, failed ones included
    pub fn execute_calls(&self) -> u32 {
        self.state().executions
    }

    /// Number of `cancel` calls
    pub fn cancel_calls(&self) -> u32 {
        self.state().cancels
    }

    /// Command texts of every execution, in order
    pub fn executed(&self) -> Vec<String> {
        self.state().executed.clone()
    }
}

impl Driver for MockDriver {
    type Connection = MockConnection;

    fn create_connection(&self, connection_string: &str) -> MockConnection {
        MockConnection {
            connection_string: connection_string.to_string(),
            database: "master".to_string(),
            state: ConnectionState::Closed,
            active_transaction: None,
            shared: Arc::clone(&self.state),
        }
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection produced by [`MockDriver`]
#[derive(Debug)]
pub struct MockConnection {
    connection_string: String,
    database: String,
    state: ConnectionState,
    active_transaction: Option<u64>,
    shared: Arc<Mutex<MockState>>,
}

impl MockConnection {
    /// Force a lifecycle state, e.g. to simulate a dropped transport
    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    fn require_open(&self) -> Result<()> {
        if self.state == ConnectionState::Open {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!(
                "connection must be open (current state: {})",
                self.state
            )))
        }
    }
}

#[async_trait]
impl DbConnection for MockConnection {
    fn connection_string(&self) -> &str {
        &self.connection_string
    }

    fn connection_timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    fn database(&self) -> &str {
        &self.database
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn open(&mut self) -> Result<()> {
        if self.state == ConnectionState::Open {
            return Err(Error::InvalidOperation("connection is already open".to_string()));
        }
        let failure = {
            let mut shared = lock(&self.shared);
            shared.opens += 1;
            shared.open_failures.pop_front()
        };
        match failure {
            Some(error) => {
                self.state = ConnectionState::Closed;
                Err(error)
            }
            None => {
                self.state = ConnectionState::Open;
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if matches!(self.state, ConnectionState::Open | ConnectionState::Broken) {
            lock(&self.shared).closes += 1;
        }
        self.state = ConnectionState::Closed;
        self.active_transaction = None;
        Ok(())
    }

    async fn change_database(&mut self, database: &str) -> Result<()> {
        self.require_open()?;
        self.database = database.to_string();
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[async_trait]
impl NativeConnection for MockConnection {
    type Command = MockCommand;
    type Transaction = MockTransaction;

    fn set_connection_string(&mut self, connection_string: &str) -> Result<()> {
        if self.state == ConnectionState::Open {
            return Err(Error::InvalidOperation(
                "cannot change the connection string of an open connection".to_string(),
            ));
        }
        self.connection_string = connection_string.to_string();
        Ok(())
    }

    async fn begin_transaction(
        &mut self,
        isolation_level: Option<IsolationLevel>,
    ) -> Result<MockTransaction> {
        self.require_open()?;
        let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        self.active_transaction = Some(id);
        Ok(MockTransaction {
            id,
            isolation_level: isolation_level.unwrap_or(IsolationLevel::ReadCommitted),
        })
    }

    async fn commit(&mut self, transaction: &MockTransaction) -> Result<()> {
        if self.active_transaction != Some(transaction.id) {
            return Err(Error::InvalidOperation("transaction has completed".to_string()));
        }
        self.active_transaction = None;
        Ok(())
    }

    async fn rollback(&mut self, transaction: &MockTransaction) -> Result<()> {
        self.commit(transaction).await
    }

    fn create_command(&self) -> MockCommand {
        MockCommand {
            text: String::new(),
            timeout: Duration::from_secs(30),
            command_type: CommandType::Text,
            parameters: Parameters::default(),
            updated_row_source: UpdateRowSource::default(),
            transaction: None,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Transaction handle of a [`MockConnection`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockTransaction {
    id: u64,
    isolation_level: IsolationLevel,
}

impl DbTransaction for MockTransaction {
    fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Command produced by [`MockConnection`]
#[derive(Debug)]
pub struct MockCommand {
    text: String,
    timeout: Duration,
    command_type: CommandType,
    parameters: Parameters,
    updated_row_source: UpdateRowSource,
    transaction: Option<MockTransaction>,
    shared: Arc<Mutex<MockState>>,
}

impl MockCommand {
    fn execute(&mut self, connection: &mut MockConnection) -> Result<Value> {
        connection.require_open()?;
        let mut shared = lock(&self.shared);
        shared.executions += 1;
        shared.executed.push(self.text.clone());
        match shared.execute_failures.pop_front() {
            Some(error) => {
                if shared.break_on_failure {
                    connection.state = ConnectionState::Broken;
                }
                Err(error)
            }
            None => Ok(shared.result.clone()),
        }
    }
}

#[async_trait]
impl NativeCommand for MockCommand {
    type Connection = MockConnection;

    fn command_text(&self) -> &str {
        &self.text
    }

    fn set_command_text(&mut self, text: &str) {
        self.text = text.to_string();
    }

    fn command_timeout(&self) -> Duration {
        self.timeout
    }

    fn set_command_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn command_type(&self) -> CommandType {
        self.command_type
    }

    fn set_command_type(&mut self, command_type: CommandType) {
        self.command_type = command_type;
    }

    fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.parameters
    }

    fn updated_row_source(&self) -> UpdateRowSource {
        self.updated_row_source
    }

    fn set_updated_row_source(&mut self, source: UpdateRowSource) {
        self.updated_row_source = source;
    }

    fn transaction(&self) -> Option<&MockTransaction> {
        self.transaction.as_ref()
    }

    fn set_transaction(&mut self, transaction: Option<MockTransaction>) {
        self.transaction = transaction;
    }

    async fn prepare(&mut self, connection: &mut MockConnection) -> Result<()> {
        connection.require_open()
    }

    fn cancel(&self) {
        lock(&self.shared).cancels += 1;
    }

    async fn execute_non_query(&mut self, connection: &mut MockConnection) -> Result<u64> {
        self.execute(connection)?;
        Ok(1)
    }

    async fn execute_reader(
        &mut self,
        connection: &mut MockConnection,
        behavior: CommandBehavior,
    ) -> Result<Rows> {
        let value = self.execute(connection)?;
        let rows = if behavior == CommandBehavior::SchemaOnly {
            Vec::new()
        } else {
            vec![vec![value]]
        };
        if behavior == CommandBehavior::CloseConnection {
            connection.close().await?;
        }
        Ok(Rows {
            columns: vec!["value".to_string()],
            rows,
        })
    }

    async fn execute_scalar(&mut self, connection: &mut MockConnection) -> Result<Value> {
        self.execute(connection)
    }
}
