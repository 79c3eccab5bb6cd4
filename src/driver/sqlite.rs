//! SQLite native driver built on `sqlx`

use super::traits::{DbConnection, DbTransaction, Driver, NativeCommand, NativeConnection};
use super::types::{
    CommandBehavior, CommandType, ConnectionState, IsolationLevel, Parameters, Rows,
    UpdateRowSource, Value,
};
use crate::error::{DriverError, Error, Result};
use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteRow};
use sqlx::{
    Column, ConnectOptions, Connection as _, Executor, Row, Sqlite, Statement, TypeInfo, ValueRef,
};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::ptr::NonNull;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type RawConnection = sqlx::SqliteConnection;

/// Default time allowed for opening a connection
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Default time allowed for one command execution
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Error number reported when an execution or open exceeds its time limit
pub const TIMEOUT_ERROR_NUMBER: i32 = -2;

const TIMEOUT_MESSAGE: &str = "Timeout expired. The timeout period elapsed prior to completion of the operation or the server is not responding.";

/// SQLITE_ERROR, used when sqlx reports no result code
const GENERIC_ERROR_NUMBER: i32 = 1;

const CANCELLED_ERROR_NUMBER: i32 = 0;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Factory for [`SqliteConnection`]s
#[derive(Debug, Clone)]
pub struct SqliteDriver {
    connection_timeout: Duration,
}

impl SqliteDriver {
    /// Driver whose connections use a custom open timeout
    pub fn with_connection_timeout(connection_timeout: Duration) -> Self {
        Self { connection_timeout }
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::with_connection_timeout(DEFAULT_CONNECTION_TIMEOUT)
    }
}

impl Driver for SqliteDriver {
    type Connection = SqliteConnection;

    fn create_connection(&self, connection_string: &str) -> SqliteConnection {
        let mut connection = SqliteConnection::new(connection_string);
        connection.connection_timeout = self.connection_timeout;
        connection
    }
}

/// Native SQLite connection
///
/// Connection strings are `sqlx` SQLite URLs such as `sqlite::memory:` or
/// `sqlite://data.db?mode=rwc`.
pub struct SqliteConnection {
    connection_string: String,
    connection_timeout: Duration,
    state: ConnectionState,
    inner: Option<RawConnection>,
    interrupt: Option<InterruptHandle>,
    active_transaction: Option<u64>,
}

impl SqliteConnection {
    /// Create a closed connection (no I/O)
    pub fn new(connection_string: &str) -> Self {
        Self {
            connection_string: connection_string.to_string(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            state: ConnectionState::Closed,
            inner: None,
            interrupt: None,
            active_transaction: None,
        }
    }

    /// Whether a transaction is currently open on this connection
    pub fn in_transaction(&self) -> bool {
        self.active_transaction.is_some()
    }

    fn raw(&mut self) -> Result<&mut RawConnection> {
        match (self.state, self.inner.as_mut()) {
            (ConnectionState::Open, Some(raw)) => Ok(raw),
            (state, _) => Err(Error::InvalidOperation(format!(
                "connection must be open (current state: {state})"
            ))),
        }
    }

    /// Interrupt the statement running on the handle and give the handle up
    ///
    /// The connection is left `Broken`; the next open starts on a fresh
    /// handle instead of queueing behind the abandoned statement.
    fn abandon(&mut self, abort: Abort) -> Error {
        if let Some(handle) = self.interrupt.take() {
            handle.interrupt();
        }
        // Dropped only after the interrupt, so the handle is still alive
        self.inner = None;
        self.active_transaction = None;
        self.state = ConnectionState::Broken;
        tracing::warn!(reason = ?abort, "SQLite statement interrupted, connection marked broken");
        abort.into_error()
    }

    async fn finish_transaction(
        &mut self,
        transaction: &SqliteTransaction,
        statement: &'static str,
    ) -> Result<()> {
        if self.active_transaction != Some(transaction.id) {
            return Err(Error::InvalidOperation(
                "the transaction has completed or belongs to another connection".to_string(),
            ));
        }
        let raw = self.raw()?;
        sqlx::query(statement)
            .execute(&mut *raw)
            .await
            .map_err(driver_error)?;
        self.active_transaction = None;
        Ok(())
    }
}

impl fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("connection_string", &self.connection_string)
            .field("connection_timeout", &self.connection_timeout)
            .field("state", &self.state)
            .field("active_transaction", &self.active_transaction)
            .finish()
    }
}

#[async_trait]
impl DbConnection for SqliteConnection {
    fn connection_string(&self) -> &str {
        &self.connection_string
    }

    fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    fn database(&self) -> &str {
        "main"
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn open(&mut self) -> Result<()> {
        if self.state == ConnectionState::Open {
            return Err(Error::InvalidOperation(
                "connection is already open".to_string(),
            ));
        }
        if self.connection_string.trim().is_empty() {
            return Err(Error::InvalidOperation(
                "connection string has not been initialized".to_string(),
            ));
        }

        let options =
            SqliteConnectOptions::from_str(&self.connection_string).map_err(driver_error)?;

        // A broken handle is dropped, not closed
        self.inner = None;
        self.interrupt = None;
        self.active_transaction = None;
        let attempt = OpenAttempt::begin(&mut self.state);
        tracing::debug!(connection_string = %self.connection_string, "Opening SQLite connection");

        let (raw, interrupt) = within(self.connection_timeout, async {
            let mut raw = options.connect().await.map_err(driver_error)?;
            let interrupt = InterruptHandle::acquire(&mut raw).await?;
            Ok((raw, interrupt))
        })
        .await?;

        self.inner = Some(raw);
        self.interrupt = Some(interrupt);
        attempt.complete();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.active_transaction = None;
        self.interrupt = None;
        self.state = ConnectionState::Closed;
        if let Some(raw) = self.inner.take() {
            raw.close().await.map_err(driver_error)?;
        }
        Ok(())
    }

    async fn change_database(&mut self, database: &str) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(Error::InvalidOperation(format!(
                "connection must be open (current state: {})",
                self.state
            )));
        }
        if database.eq_ignore_ascii_case("main") {
            Ok(())
        } else {
            Err(Error::InvalidArgument {
                name: "database",
                reason: format!(
                    "SQLite connections expose a single database `main`, not `{database}`"
                ),
            })
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[async_trait]
impl NativeConnection for SqliteConnection {
    type Command = SqliteCommand;
    type Transaction = SqliteTransaction;

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
    ) -> Result<SqliteTransaction> {
        if self.active_transaction.is_some() {
            return Err(Error::InvalidOperation(
                "SQLite does not support parallel transactions".to_string(),
            ));
        }

        let requested = isolation_level.unwrap_or_default();
        let statement = match requested {
            IsolationLevel::RepeatableRead
            | IsolationLevel::Serializable
            | IsolationLevel::Snapshot => "BEGIN IMMEDIATE",
            _ => "BEGIN DEFERRED",
        };
        let raw = self.raw()?;
        sqlx::query(statement)
            .execute(&mut *raw)
            .await
            .map_err(driver_error)?;

        let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        self.active_transaction = Some(id);
        Ok(SqliteTransaction {
            id,
            isolation_level: match requested {
                IsolationLevel::Unspecified => IsolationLevel::Serializable,
                other => other,
            },
        })
    }

    async fn commit(&mut self, transaction: &SqliteTransaction) -> Result<()> {
        self.finish_transaction(transaction, "COMMIT").await
    }

    async fn rollback(&mut self, transaction: &SqliteTransaction) -> Result<()> {
        self.finish_transaction(transaction, "ROLLBACK").await
    }

    fn create_command(&self) -> SqliteCommand {
        SqliteCommand::default()
    }
}

/// Connection state for the duration of one `open`
///
/// Falls back to `Closed` when dropped before [`complete`](Self::complete),
/// which covers failed opens and open futures dropped mid-connect.
struct OpenAttempt<'a> {
    state: &'a mut ConnectionState,
}

impl<'a> OpenAttempt<'a> {
    fn begin(state: &'a mut ConnectionState) -> Self {
        *state = ConnectionState::Opening;
        Self { state }
    }

    fn complete(self) {
        *self.state = ConnectionState::Open;
    }
}

impl Drop for OpenAttempt<'_> {
    fn drop(&mut self) {
        if *self.state == ConnectionState::Opening {
            *self.state = ConnectionState::Closed;
        }
    }
}

/// Raw database handle, kept to interrupt statements from outside the sqlx
/// worker thread
#[derive(Clone, Copy)]
struct InterruptHandle(NonNull<libsqlite3_sys::sqlite3>);

// SAFETY: sqlite3_interrupt is the one call made through the pointer and
// SQLite allows it from any thread. The owning SqliteConnection drops the
// handle together with (or before) the sqlx connection keeping it open.
unsafe impl Send for InterruptHandle {}
unsafe impl Sync for InterruptHandle {}

impl InterruptHandle {
    async fn acquire(raw: &mut RawConnection) -> Result<Self> {
        let mut locked = raw.lock_handle().await.map_err(driver_error)?;
        Ok(Self(locked.as_raw_handle()))
    }

    fn interrupt(self) {
        // SAFETY: This is safe because:
        // 1. The pointer came from a live sqlx connection
        // 2. Callers interrupt before dropping that connection
        // 3. sqlite3_interrupt only sets a flag checked by the running statement
        unsafe { libsqlite3_sys::sqlite3_interrupt(self.0.as_ptr()) }
    }
}

/// Handle of a transaction started on a [`SqliteConnection`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteTransaction {
    id: u64,
    isolation_level: IsolationLevel,
}

impl DbTransaction for SqliteTransaction {
    fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Native SQLite command
///
/// Parameters are bound positionally, in insertion order, to `?` placeholders.
#[derive(Debug)]
pub struct SqliteCommand {
    text: String,
    timeout: Duration,
    command_type: CommandType,
    parameters: Parameters,
    updated_row_source: UpdateRowSource,
    transaction: Option<SqliteTransaction>,
    cancel: CancellationToken,
}

impl Default for SqliteCommand {
    fn default() -> Self {
        Self {
            text: String::new(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            command_type: CommandType::Text,
            parameters: Parameters::default(),
            updated_row_source: UpdateRowSource::default(),
            transaction: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl SqliteCommand {
    /// Token that aborts the current (or next) execution when cancelled
    ///
    /// The token is replaced once an execution has observed it, so fetch a
    /// fresh handle for every execution.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn statement_text(&self) -> Result<String> {
        if self.text.trim().is_empty() {
            return Err(Error::InvalidOperation(
                "command text has not been initialized".to_string(),
            ));
        }
        match self.command_type {
            CommandType::Text => Ok(self.text.clone()),
            CommandType::TableDirect => {
                Ok(format!("SELECT * FROM \"{}\"", self.text.replace('"', "\"\"")))
            }
            CommandType::StoredProcedure => Err(Error::InvalidOperation(
                "SQLite does not support stored procedures".to_string(),
            )),
        }
    }

    fn check_transaction(&self, connection: &SqliteConnection) -> Result<()> {
        match &self.transaction {
            Some(tx) if connection.active_transaction != Some(tx.id) => {
                Err(Error::InvalidOperation(
                    "the command's transaction has completed or belongs to another connection"
                        .to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    fn finish_execution(&mut self) {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
    }
}

#[async_trait]
impl NativeCommand for SqliteCommand {
    type Connection = SqliteConnection;

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

    fn transaction(&self) -> Option<&SqliteTransaction> {
        self.transaction.as_ref()
    }

    fn set_transaction(&mut self, transaction: Option<SqliteTransaction>) {
        self.transaction = transaction;
    }

    async fn prepare(&mut self, connection: &mut SqliteConnection) -> Result<()> {
        let sql = self.statement_text()?;
        let raw = connection.raw()?;
        let outcome = guarded(self.cancel.clone(), self.timeout, async move {
            raw.prepare(sql.as_str()).await.map_err(driver_error)?;
            Ok(())
        })
        .await;
        self.finish_execution();
        settle(connection, outcome)
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn execute_non_query(&mut self, connection: &mut SqliteConnection) -> Result<u64> {
        let sql = self.statement_text()?;
        self.check_transaction(connection)?;
        let raw = connection.raw()?;
        let parameters = &self.parameters;
        let outcome = guarded(self.cancel.clone(), self.timeout, async move {
            bind_parameters(sqlx::query(sql.as_str()), parameters)
                .execute(&mut *raw)
                .await
                .map_err(driver_error)
        })
        .await;
        self.finish_execution();
        Ok(settle(connection, outcome)?.rows_affected())
    }

    async fn execute_reader(
        &mut self,
        connection: &mut SqliteConnection,
        behavior: CommandBehavior,
    ) -> Result<Rows> {
        let sql = self.statement_text()?;
        self.check_transaction(connection)?;
        let raw = connection.raw()?;
        let parameters = &self.parameters;
        let outcome = guarded(self.cancel.clone(), self.timeout, async move {
            let statement = (&mut *raw)
                .prepare(sql.as_str())
                .await
                .map_err(driver_error)?;
            let columns: Vec<String> = statement
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect();
            if behavior == CommandBehavior::SchemaOnly {
                return Ok(Rows {
                    columns,
                    rows: Vec::new(),
                });
            }

            let query = bind_parameters(sqlx::query(sql.as_str()), parameters);
            let fetched: Vec<SqliteRow> = if behavior == CommandBehavior::SingleRow {
                query
                    .fetch_optional(&mut *raw)
                    .await
                    .map_err(driver_error)?
                    .into_iter()
                    .collect()
            } else {
                query.fetch_all(&mut *raw).await.map_err(driver_error)?
            };
            let rows = fetched.iter().map(decode_row).collect::<Result<Vec<_>>>()?;
            Ok(Rows { columns, rows })
        })
        .await;
        self.finish_execution();

        let rows = settle(connection, outcome)?;
        if behavior == CommandBehavior::CloseConnection {
            connection.close().await?;
        }
        Ok(rows)
    }

    async fn execute_scalar(&mut self, connection: &mut SqliteConnection) -> Result<Value> {
        let sql = self.statement_text()?;
        self.check_transaction(connection)?;
        let raw = connection.raw()?;
        let parameters = &self.parameters;
        let outcome = guarded(self.cancel.clone(), self.timeout, async move {
            let row = bind_parameters(sqlx::query(sql.as_str()), parameters)
                .fetch_optional(&mut *raw)
                .await
                .map_err(driver_error)?;
            match row {
                Some(row) if !row.is_empty() => decode_value(&row, 0),
                _ => Ok(Value::Null),
            }
        })
        .await;
        self.finish_execution();
        settle(connection, outcome)
    }
}

fn bind_parameters<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    parameters: &Parameters,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for parameter in parameters {
        query = match &parameter.value {
            Value::Null => query.bind(None::<i64>),
            Value::Integer(v) => query.bind(*v),
            Value::Real(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.clone()),
            Value::Blob(v) => query.bind(v.clone()),
        };
    }
    query
}

fn decode_row(row: &SqliteRow) -> Result<Vec<Value>> {
    (0..row.len()).map(|index| decode_value(row, index)).collect()
}

fn decode_value(row: &SqliteRow, index: usize) -> Result<Value> {
    let raw = row.try_get_raw(index).map_err(driver_error)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage_class = raw.type_info().name().to_string();

    // Storage class of the value itself, not the declared column type
    let value = match storage_class.as_str() {
        "INTEGER" | "BOOLEAN" => row.try_get_unchecked::<i64, _>(index).map(Value::Integer),
        "REAL" => row.try_get_unchecked::<f64, _>(index).map(Value::Real),
        "BLOB" => row.try_get_unchecked::<Vec<u8>, _>(index).map(Value::Blob),
        _ => row.try_get_unchecked::<String, _>(index).map(Value::Text),
    };
    value.map_err(driver_error)
}

/// Map a sqlx error to a driver error numbered with the SQLite result code
fn driver_error(error: sqlx::Error) -> Error {
    match error {
        sqlx::Error::Database(db) => {
            let number = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .unwrap_or(GENERIC_ERROR_NUMBER);
            DriverError::new(number, db.message()).into()
        }
        other => DriverError::new(GENERIC_ERROR_NUMBER, other.to_string()).into(),
    }
}

fn timeout_error() -> Error {
    DriverError::new(TIMEOUT_ERROR_NUMBER, TIMEOUT_MESSAGE).into()
}

/// Run `future` under `limit`; a zero limit waits indefinitely
async fn within<T, F>(limit: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if limit.is_zero() {
        return future.await;
    }
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| timeout_error())?
}

fn cancelled_error() -> Error {
    DriverError::new(CANCELLED_ERROR_NUMBER, "Operation cancelled by user.").into()
}

/// Why a statement was stopped before it finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    Cancelled,
    TimedOut,
}

impl Abort {
    fn into_error(self) -> Error {
        match self {
            Abort::Cancelled => cancelled_error(),
            Abort::TimedOut => timeout_error(),
        }
    }
}

/// Result of a statement, or the reason it was stopped mid-flight
type Guarded<T> = std::result::Result<Result<T>, Abort>;

/// Run `future` under `limit`, stopping early when `token` is cancelled
///
/// A token cancelled before the statement starts fails the call without
/// touching the connection. A zero limit waits indefinitely.
async fn guarded<T, F>(token: CancellationToken, limit: Duration, future: F) -> Guarded<T>
where
    F: Future<Output = Result<T>>,
{
    if token.is_cancelled() {
        return Ok(Err(cancelled_error()));
    }
    let deadline = async {
        if limit.is_zero() {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(limit).await;
        }
    };
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Abort::Cancelled),
        result = future => Ok(result),
        _ = deadline => Err(Abort::TimedOut),
    }
}

/// Unwrap a guarded outcome, abandoning the connection if the statement was
/// stopped mid-flight
fn settle<T>(connection: &mut SqliteConnection, outcome: Guarded<T>) -> Result<T> {
    match outcome {
        Ok(result) => result,
        Err(abort) => Err(connection.abandon(abort)),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{ExtendedSqlDetector, SqliteDetector, TransientErrorDetector};

    async fn open_memory() -> SqliteConnection {
        let mut connection = SqliteDriver::default().create_connection("sqlite::memory:");
        connection.open().await.unwrap();
        connection
    }

    async fn run(connection: &mut SqliteConnection, sql: &str) -> u64 {
        let mut command = connection.create_command();
        command.set_command_text(sql);
        command.execute_non_query(connection).await.unwrap()
    }

    async fn seeded() -> SqliteConnection {
        let mut connection = open_memory().await;
        run(
            &mut connection,
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE, score REAL, avatar BLOB)",
        )
        .await;
        run(
            &mut connection,
            "INSERT INTO users (id, name, score, avatar) VALUES (1, 'alice', 9.5, x'0102'), (2, 'bob', NULL, NULL)",
        )
        .await;
        connection
    }

    #[test]
    fn create_connection_performs_no_io() {
        let driver = SqliteDriver::with_connection_timeout(Duration::from_secs(3));
        let connection = driver.create_connection("sqlite::memory:");
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(connection.connection_timeout(), Duration::from_secs(3));
        assert_eq!(connection.connection_string(), "sqlite::memory:");
        assert_eq!(connection.database(), "main");
    }

    #[tokio::test]
    async fn open_close_lifecycle() {
        let mut connection = open_memory().await;
        assert_eq!(connection.state(), ConnectionState::Open);

        let err = connection.open().await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));

        connection.close().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        // Closing twice is a no-op
        connection.close().await.unwrap();

        connection.open().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn empty_connection_string_fails_at_open() {
        let mut connection = SqliteDriver::default().create_connection("");
        let err = connection.open().await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert!(!ExtendedSqlDetector::extended().is_transient(&err));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn unreachable_database_fails_with_driver_error() {
        let mut connection =
            SqliteDriver::default().create_connection("sqlite:/nonexistent_dir_xyz/db.sqlite");
        let err = connection.open().await.unwrap_err();
        assert!(err.driver_number().is_some(), "got {err:?}");
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn connection_string_is_fixed_while_open() {
        let mut connection = open_memory().await;
        assert!(connection.set_connection_string("sqlite::memory:").is_err());
        connection.close().await.unwrap();
        connection
            .set_connection_string("sqlite://other.db?mode=memory")
            .unwrap();
        assert_eq!(connection.connection_string(), "sqlite://other.db?mode=memory");
    }

    #[tokio::test]
    async fn change_database_accepts_only_main() {
        let mut connection = open_memory().await;
        connection.change_database("main").await.unwrap();
        let err = connection.change_database("archive").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "database", .. }));
    }

    #[tokio::test]
    async fn execute_on_closed_connection_is_rejected() {
        let mut connection = SqliteDriver::default().create_connection("sqlite::memory:");
        let mut command = connection.create_command();
        command.set_command_text("SELECT 1");
        let err = command.execute_scalar(&mut connection).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn reader_materializes_every_storage_class() {
        let mut connection = seeded().await;
        let mut command = connection.create_command();
        command.set_command_text("SELECT id, name, score, avatar FROM users ORDER BY id");

        let rows = command
            .execute_reader(&mut connection, CommandBehavior::Default)
            .await
            .unwrap();

        assert_eq!(rows.columns, vec!["id", "name", "score", "avatar"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows.rows[0],
            vec![
                Value::Integer(1),
                Value::from("alice"),
                Value::Real(9.5),
                Value::Blob(vec![1, 2])
            ]
        );
        assert_eq!(rows.get(1, "score"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn reader_behaviors() {
        let mut connection = seeded().await;
        let mut command = connection.create_command();
        command.set_command_text("SELECT name FROM users ORDER BY id");

        let single = command
            .execute_reader(&mut connection, CommandBehavior::SingleRow)
            .await
            .unwrap();
        assert_eq!(single.len(), 1);

        let schema = command
            .execute_reader(&mut connection, CommandBehavior::SchemaOnly)
            .await
            .unwrap();
        assert_eq!(schema.columns, vec!["name"]);
        assert!(schema.is_empty());

        let all = command
            .execute_reader(&mut connection, CommandBehavior::CloseConnection)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn parameters_bind_positionally() {
        let mut connection = seeded().await;
        let mut command = connection.create_command();
        command.set_command_text("INSERT INTO users (id, name, score) VALUES (?, ?, ?)");
        command
            .parameters_mut()
            .add("@id", 3)
            .add("@name", "carol")
            .add("@score", None::<f64>);
        assert_eq!(command.execute_non_query(&mut connection).await.unwrap(), 1);

        let mut lookup = connection.create_command();
        lookup.set_command_text("SELECT name FROM users WHERE id = ?");
        lookup.parameters_mut().add("@id", 3);
        let name = lookup.execute_scalar(&mut connection).await.unwrap();
        assert_eq!(name.as_str(), Some("carol"));
    }

    #[tokio::test]
    async fn scalar_without_rows_is_null() {
        let mut connection = seeded().await;
        let mut command = connection.create_command();
        command.set_command_text("SELECT name FROM users WHERE id = 99");
        assert!(command.execute_scalar(&mut connection).await.unwrap().is_null());
    }

    #[tokio::test]
    async fn table_direct_reads_whole_table() {
        let mut connection = seeded().await;
        let mut command = connection.create_command();
        command.set_command_type(CommandType::TableDirect);
        command.set_command_text("users");
        let rows = command
            .execute_reader(&mut connection, CommandBehavior::Default)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn stored_procedures_are_unsupported() {
        let mut connection = open_memory().await;
        let mut command = connection.create_command();
        command.set_command_type(CommandType::StoredProcedure);
        command.set_command_text("sp_who");
        let err = command.execute_non_query(&mut connection).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn errors_carry_sqlite_result_codes() {
        let mut connection = seeded().await;

        let mut syntax = connection.create_command();
        syntax.set_command_text("SELEC name FROM users");
        let err = syntax.execute_scalar(&mut connection).await.unwrap_err();
        assert_eq!(err.driver_number(), Some(GENERIC_ERROR_NUMBER));
        assert!(!SqliteDetector.is_transient(&err));

        let mut duplicate = connection.create_command();
        duplicate.set_command_text("INSERT INTO users (id, name) VALUES (10, 'alice')");
        let err = duplicate
            .execute_non_query(&mut connection)
            .await
            .unwrap_err();
        assert!(err.driver_number().is_some());
        assert!(!SqliteDetector.is_transient(&err));
    }

    #[tokio::test]
    async fn prepare_validates_statement() {
        let mut connection = seeded().await;
        let mut command = connection.create_command();
        command.set_command_text("SELECT name FROM users");
        command.prepare(&mut connection).await.unwrap();

        command.set_command_text("SELECT nope FROM missing_table");
        assert!(command.prepare(&mut connection).await.is_err());
    }

    #[tokio::test]
    async fn commit_and_rollback() {
        let mut connection = seeded().await;

        let tx = connection.begin_transaction(None).await.unwrap();
        assert_eq!(tx.isolation_level(), IsolationLevel::Serializable);
        assert!(connection.in_transaction());
        let mut insert = connection.create_command();
        insert.set_transaction(Some(tx.clone()));
        insert.set_command_text("INSERT INTO users (id, name) VALUES (3, 'carol')");
        insert.execute_non_query(&mut connection).await.unwrap();
        connection.rollback(&tx).await.unwrap();

        // The finished transaction can no longer be used
        let err = insert.execute_non_query(&mut connection).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert!(connection.commit(&tx).await.is_err());

        let tx = connection
            .begin_transaction(Some(IsolationLevel::ReadCommitted))
            .await
            .unwrap();
        assert_eq!(tx.isolation_level(), IsolationLevel::ReadCommitted);
        insert.set_transaction(Some(tx.clone()));
        insert.execute_non_query(&mut connection).await.unwrap();
        connection.commit(&tx).await.unwrap();

        let mut count = connection.create_command();
        count.set_command_text("SELECT COUNT(*) FROM users");
        assert_eq!(
            count.execute_scalar(&mut connection).await.unwrap(),
            Value::Integer(3)
        );
    }

    #[tokio::test]
    async fn parallel_transactions_are_rejected() {
        let mut connection = open_memory().await;
        let _tx = connection.begin_transaction(None).await.unwrap();
        let err = connection.begin_transaction(None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn transaction_of_another_connection_is_rejected() {
        let mut first = seeded().await;
        let mut second = seeded().await;
        let foreign = first.begin_transaction(None).await.unwrap();

        let mut command = second.create_command();
        command.set_transaction(Some(foreign));
        command.set_command_text("SELECT 1");
        assert!(command.execute_scalar(&mut second).await.is_err());
    }

    /// Spins until the wall clock passes the bound Julian day, then records one row
    const SPIN_THEN_RECORD: &str = "WITH RECURSIVE spin(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM spin WHERE julianday('now') < ?) INSERT INTO hits (n) SELECT count(*) FROM spin";

    const SPIN_FOREVER: &str =
        "WITH RECURSIVE spin(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM spin) SELECT count(*) FROM spin";

    fn julian_day_after(delay: Duration) -> f64 {
        let at = chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap();
        2_440_587.5 + at.timestamp_millis() as f64 / 86_400_000.0
    }

    async fn open_file(dir: &tempfile::TempDir) -> SqliteConnection {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("spin.db").display());
        let mut connection = SqliteDriver::default().create_connection(&url);
        connection.open().await.unwrap();
        connection
    }

    #[tokio::test]
    async fn dropped_open_returns_to_closed() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("app.db").display());
        let mut connection = SqliteDriver::default().create_connection(&url);

        {
            let mut opening = connection.open();
            assert!(futures::poll!(&mut opening).is_pending());
        }
        assert_eq!(connection.state(), ConnectionState::Closed);

        connection.open().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Open);
        assert_eq!(run(&mut connection, "CREATE TABLE t (id INTEGER)").await, 0);
    }

    #[tokio::test]
    async fn timed_out_statement_is_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let mut connection = open_file(&dir).await;
        run(&mut connection, "CREATE TABLE hits (n INTEGER)").await;

        let mut command = connection.create_command();
        command.set_command_text(SPIN_THEN_RECORD);
        command
            .parameters_mut()
            .add("@until", julian_day_after(Duration::from_millis(300)));
        command.set_command_timeout(Duration::from_millis(50));

        let err = command.execute_non_query(&mut connection).await.unwrap_err();
        assert_eq!(err.driver_number(), Some(TIMEOUT_ERROR_NUMBER));
        assert_eq!(connection.state(), ConnectionState::Broken);
        assert!(matches!(
            command.execute_non_query(&mut connection).await,
            Err(Error::InvalidOperation(_))
        ));

        // Well past the point the statement would have finished on its own
        tokio::time::sleep(Duration::from_millis(500)).await;
        connection.close().await.unwrap();
        connection.open().await.unwrap();

        let mut count = connection.create_command();
        count.set_command_text("SELECT COUNT(*) FROM hits");
        let value = count.execute_scalar(&mut connection).await.unwrap();
        assert_eq!(value, Value::Integer(0));
    }

    #[tokio::test]
    async fn cancel_interrupts_running_statement() {
        let mut connection = open_memory().await;
        let mut command = connection.create_command();
        command.set_command_text(SPIN_FOREVER);
        command.set_command_timeout(Duration::ZERO);

        let handle = command.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle.cancel();
        });
        let err = command.execute_scalar(&mut connection).await.unwrap_err();
        assert_eq!(err.driver_number(), Some(CANCELLED_ERROR_NUMBER));
        assert_eq!(connection.state(), ConnectionState::Broken);

        connection.open().await.unwrap();
        command.set_command_text("SELECT 1");
        let value = tokio::time::timeout(
            Duration::from_secs(5),
            command.execute_scalar(&mut connection),
        )
        .await
        .expect("follow-up must not queue behind the cancelled statement")
        .unwrap();
        assert_eq!(value, Value::Integer(1));
    }

    #[tokio::test]
    async fn cancel_aborts_execution_once() {
        let mut connection = open_memory().await;
        let mut command = connection.create_command();
        command.set_command_text("SELECT 1");

        command.cancel();
        let err = command.execute_scalar(&mut connection).await.unwrap_err();
        assert_eq!(err.driver_number(), Some(CANCELLED_ERROR_NUMBER));
        assert!(!ExtendedSqlDetector::extended().is_transient(&err));
        // Nothing was running, so the connection stays usable
        assert_eq!(connection.state(), ConnectionState::Open);

        // Token is renewed after it has been observed
        assert!(!command.cancel_handle().is_cancelled());
        let value = command.execute_scalar(&mut connection).await.unwrap();
        assert_eq!(value, Value::Integer(1));
    }

    #[tokio::test]
    async fn elapsed_limit_yields_timeout_error() {
        let err = within(
            Duration::from_millis(10),
            std::future::pending::<Result<()>>(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.driver_number(), Some(TIMEOUT_ERROR_NUMBER));
        assert!(ExtendedSqlDetector::extended().is_transient(&err));
    }

    #[tokio::test]
    async fn zero_limit_waits_for_completion() {
        let value = within(Duration::ZERO, async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
    }
}
