//! Database fixtures and policy helpers

use reliable_sql::driver::SqliteDriver;
use reliable_sql::{BackoffStrategy, ConnectionManager, RetryPolicy, TransientErrorDetector};
use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// SQLite URL that can never be opened
pub const UNREACHABLE_DATABASE: &str = "sqlite:/nonexistent_dir_xyz/db.sqlite";

/// Schema shared by the integration tests
pub const SCHEMA: &str =
    "CREATE TABLE IF NOT EXISTS items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, qty INTEGER)";

/// Insert that spins until the wall clock passes the bound Julian day
///
/// Needs a `hits (n INTEGER)` table. Bind the deadline with
/// [`julian_day_after`].
pub const SPIN_THEN_RECORD: &str = "WITH RECURSIVE spin(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM spin WHERE julianday('now') < ?) INSERT INTO hits (n) SELECT count(*) FROM spin";

/// Julian day number `delay` from now, as SQLite's `julianday()` reports it
pub fn julian_day_after(delay: Duration) -> f64 {
    let at = Utc::now() + chrono::Duration::from_std(delay).expect("delay out of range");
    2_440_587.5 + at.timestamp_millis() as f64 / 86_400_000.0
}

/// SQLite URL for a file database, created on first open
pub fn file_url(path: &Path) -> String {
    format!("sqlite://{}?mode=rwc", path.display())
}

/// Temp directory plus the URL of a database file inside it
///
/// Keep the directory alive for as long as the database is used.
pub fn temp_database() -> (TempDir, String) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = file_url(&dir.path().join("test.db"));
    (dir, url)
}

/// Policy that never waits between retries
pub fn immediate_policy(
    detector: impl TransientErrorDetector + 'static,
    max_retries: u32,
) -> RetryPolicy {
    RetryPolicy::new(detector, BackoffStrategy::none(), max_retries)
}

/// Manager over the bundled SQLite driver
pub fn sqlite_manager(
    connection_string: &str,
    detector: impl TransientErrorDetector + 'static,
    max_retries: u32,
) -> ConnectionManager<SqliteDriver> {
    ConnectionManager::new(
        SqliteDriver::default(),
        connection_string,
        immediate_policy(detector, max_retries),
    )
}
