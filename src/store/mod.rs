//! Store Gateway - the capability the lock protocol consumes from the relational store
//!
//! A gateway is exactly one session on the store. It provides:
//! - parameterized statement execution against the registry table
//! - the store's native named session lock (acquire with timeout, release,
//!   holder lookup), released automatically when the session disconnects
//! - termination of other sessions by id
//! - table repair
//!
//! Two gateways ship with the crate: [`SqliteGateway`] (embedded, sessions and
//! native locks are kept in the database file next to the registry) and,
//! behind the `mysql` feature, `MySqlGateway` (MySQL/MariaDB `GET_LOCK` family).

pub mod session;
pub mod sqlite;
#[cfg(feature = "mysql")]
pub mod mysql;

pub use session::{SessionLease, SessionTable};
pub use sqlite::SqliteGateway;
#[cfg(feature = "mysql")]
pub use mysql::MySqlGateway;

use std::time::Duration;

/// Identifier of a store session (the store's connection id)
pub type SessionId = u64;

/// Result type for gateway operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A bound statement parameter or a fetched column value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

/// Expected type of a fetched column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Int,
    Text,
}

/// One row of a table repair report (`Msg_type`, `Msg_text`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRow {
    pub msg_type: String,
    pub msg_text: String,
}

impl RepairRow {
    pub fn new(msg_type: &str, msg_text: &str) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            msg_text: msg_text.to_string(),
        }
    }
}

/// SQL fragments a gateway renders differently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlDialect {
    /// Current unix time in seconds
    pub now: &'static str,
    /// Id of the executing session
    pub session_id: &'static str,
    /// Session id holding the native lock named by the single `?` placeholder, 0 if free
    pub native_holder: &'static str,
    /// Column type of the lock name
    pub name_type: &'static str,
    /// Appended to `CREATE TABLE`
    pub table_options: &'static str,
}

impl SqlDialect {
    pub const MYSQL: SqlDialect = SqlDialect {
        now: "UNIX_TIMESTAMP()",
        session_id: "CONNECTION_ID()",
        native_holder: "IFNULL(IS_USED_LOCK(?), 0)",
        name_type: "VARCHAR(255)",
        table_options: " ENGINE=MyISAM",
    };

    pub const SQLITE: SqlDialect = SqlDialect {
        now: "UNIX_TIMESTAMP()",
        session_id: "CONNECTION_ID()",
        native_holder: "IFNULL((SELECT holder FROM sharedlock_native_locks WHERE name = ? AND SESSION_ALIVE(holder)), 0)",
        name_type: "VARCHAR(255)",
        table_options: "",
    };
}

/// Errors reported by a gateway, classified the way the lock protocol needs them
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Table is damaged: {0}")]
    Corrupted(String),

    #[error("Session {0} has been terminated")]
    SessionTerminated(SessionId),

    #[error("Unknown session id: {0}")]
    UnknownSession(SessionId),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Uniqueness-constraint violation, the expected signal of registry contention
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, StoreError::DuplicateKey(_))
    }

    /// The store reported a damaged table that a repair may fix
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corrupted(_))
    }
}

/// One session on the relational store
pub trait StoreGateway {
    /// Id of this session as seen by the store
    fn session_id(&self) -> SessionId;

    fn dialect(&self) -> SqlDialect;

    /// Execute a statement, returning the number of affected rows
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> StoreResult<u64>;

    /// Run a query, decoding each row into `columns.len()` values
    fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        columns: &[SqlType],
    ) -> StoreResult<Vec<Vec<SqlValue>>>;

    /// First column of the first row as an integer
    fn query_value(&mut self, sql: &str, params: &[SqlValue]) -> StoreResult<Option<i64>> {
        let rows = self.query(sql, params, &[SqlType::Int])?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .and_then(|value| value.as_i64()))
    }

    /// Repair the given (already quoted) table and return the store's report rows
    fn repair_table(&mut self, quoted_table: &str) -> StoreResult<Vec<RepairRow>>;

    /// Obtain the native lock, waiting at most `timeout` (zero probes without waiting)
    fn acquire_native(&mut self, name: &str, timeout: Duration) -> StoreResult<bool>;

    /// Release one hold of the native lock; false if this session did not hold it
    fn release_native(&mut self, name: &str) -> StoreResult<bool>;

    /// Session currently holding the native lock, if any can be identified
    fn native_holder(&mut self, name: &str) -> StoreResult<Option<SessionId>>;

    /// Forcibly end another session, dropping its native locks
    fn terminate_session(&mut self, id: SessionId) -> StoreResult<()>;
}

impl<G: StoreGateway + ?Sized> StoreGateway for Box<G> {
    fn session_id(&self) -> SessionId {
        (**self).session_id()
    }

    fn dialect(&self) -> SqlDialect {
        (**self).dialect()
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> StoreResult<u64> {
        (**self).execute(sql, params)
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        columns: &[SqlType],
    ) -> StoreResult<Vec<Vec<SqlValue>>> {
        (**self).query(sql, params, columns)
    }

    fn repair_table(&mut self, quoted_table: &str) -> StoreResult<Vec<RepairRow>> {
        (**self).repair_table(quoted_table)
    }

    fn acquire_native(&mut self, name: &str, timeout: Duration) -> StoreResult<bool> {
        (**self).acquire_native(name, timeout)
    }

    fn release_native(&mut self, name: &str) -> StoreResult<bool> {
        (**self).release_native(name)
    }

    fn native_holder(&mut self, name: &str) -> StoreResult<Option<SessionId>> {
        (**self).native_holder(name)
    }

    fn terminate_session(&mut self, id: SessionId) -> StoreResult<()> {
        (**self).terminate_session(id)
    }
}
