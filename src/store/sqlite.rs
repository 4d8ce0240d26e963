//! Embedded SQLite gateway
//!
//! The registry table lives in a SQLite database file; every `SqliteGateway`
//! opened on that file, from any process, is an independent store session.
//! Sessions and native locks are kept in the same file (see [`SessionTable`]),
//! and the gateway exposes them to SQL through `UNIX_TIMESTAMP()`,
//! `CONNECTION_ID()` and `SESSION_ALIVE(id)` so registry statements read the
//! same on every store.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rusqlite::functions::FunctionFlags;
use rusqlite::types::{ToSqlOutput, Value};
use rusqlite::{ffi, params_from_iter, Connection, ErrorCode, ToSql};

use super::session::{SessionLease, SessionTable};
use super::{
    RepairRow, SessionId, SqlDialect, SqlType, SqlValue, StoreError, StoreGateway, StoreResult,
};

/// How long a statement waits on a database locked by another connection
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between attempts while waiting for another session's native lock
const NATIVE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A store session on a SQLite database
pub struct SqliteGateway {
    conn: Connection,
    sessions: SessionTable,
    lease: Option<SessionLease>,
    session: SessionId,
}

impl SqliteGateway {
    /// Open a session on a database file (creates the file if it doesn't exist)
    pub fn open(path: &Path) -> StoreResult<Self> {
        let mut conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let sessions = SessionTable::for_database(path);
        let lease = sessions.open(&mut conn)?;
        let session = lease.id();
        let gateway = Self {
            conn,
            sessions,
            lease: Some(lease),
            session,
        };
        gateway.register_functions()?;
        tracing::debug!("opened sqlite session {} on {}", session, path.display());
        Ok(gateway)
    }

    /// Install the SQL functions registry statements rely on
    fn register_functions(&self) -> StoreResult<()> {
        self.conn.create_scalar_function(
            "UNIX_TIMESTAMP",
            0,
            FunctionFlags::SQLITE_UTF8,
            |_| Ok(unix_now()),
        )?;

        let session = self.session as i64;
        self.conn.create_scalar_function(
            "CONNECTION_ID",
            0,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            move |_| Ok(session),
        )?;

        let sessions = self.sessions.clone();
        self.conn.create_scalar_function(
            "SESSION_ALIVE",
            1,
            FunctionFlags::SQLITE_UTF8,
            move |ctx| {
                let id: i64 = ctx.get(0)?;
                Ok(sessions.is_alive(id as SessionId))
            },
        )?;

        Ok(())
    }

    /// Statements through a killed session fail like they would on a dropped connection
    fn ensure_alive(&self) -> StoreResult<()> {
        if self.lease.is_some() && self.sessions.exists(&self.conn, self.session)? {
            Ok(())
        } else {
            Err(StoreError::SessionTerminated(self.session))
        }
    }

    /// Drop the session lease without any cleanup, the way a killed process does
    #[cfg(test)]
    pub(crate) fn crash(mut self) {
        drop(self.lease.take());
    }
}

impl Drop for SqliteGateway {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.sessions.close(&self.conn, lease);
        }
    }
}

impl StoreGateway for SqliteGateway {
    fn session_id(&self) -> SessionId {
        self.session
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::SQLITE
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> StoreResult<u64> {
        self.ensure_alive()?;
        let changed = self.conn.execute(sql, params_from_iter(params.iter()))?;
        Ok(changed as u64)
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        columns: &[SqlType],
    ) -> StoreResult<Vec<Vec<SqlValue>>> {
        self.ensure_alive()?;
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;

        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for (idx, column) in columns.iter().enumerate() {
                let value = match column {
                    SqlType::Int => row.get::<_, Option<i64>>(idx)?.map_or(SqlValue::Null, SqlValue::Int),
                    SqlType::Text => row
                        .get::<_, Option<String>>(idx)?
                        .map_or(SqlValue::Null, SqlValue::Text),
                };
                values.push(value);
            }
            result.push(values);
        }
        Ok(result)
    }

    fn repair_table(&mut self, quoted_table: &str) -> StoreResult<Vec<RepairRow>> {
        self.ensure_alive()?;
        self.conn.execute(&format!("REINDEX {}", quoted_table), [])?;

        let mut stmt = self.conn.prepare("PRAGMA integrity_check")?;
        let findings: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<_>>()?;

        let healthy = findings.iter().all(|line| line.eq_ignore_ascii_case("ok"));
        let mut report: Vec<RepairRow> = findings
            .iter()
            .filter(|line| !line.eq_ignore_ascii_case("ok"))
            .map(|line| RepairRow::new("error", line))
            .collect();
        report.push(RepairRow::new("status", if healthy { "OK" } else { "Corrupt" }));
        Ok(report)
    }

    fn acquire_native(&mut self, name: &str, timeout: Duration) -> StoreResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.sessions.try_acquire(&mut self.conn, self.session, name)? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            thread::sleep(NATIVE_POLL_INTERVAL.min(deadline - now));
        }
    }

    fn release_native(&mut self, name: &str) -> StoreResult<bool> {
        self.sessions.release(&mut self.conn, self.session, name)
    }

    fn native_holder(&mut self, name: &str) -> StoreResult<Option<SessionId>> {
        self.ensure_alive()?;
        self.sessions.holder(&self.conn, name)
    }

    fn terminate_session(&mut self, id: SessionId) -> StoreResult<()> {
        self.ensure_alive()?;
        self.sessions.terminate(&mut self.conn, id)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Int(v) => ToSqlOutput::from(*v),
            SqlValue::Text(v) => ToSqlOutput::from(v.as_str()),
        })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error() {
            Some(e)
                if e.code == ErrorCode::ConstraintViolation
                    && matches!(
                        e.extended_code,
                        ffi::SQLITE_CONSTRAINT_PRIMARYKEY | ffi::SQLITE_CONSTRAINT_UNIQUE
                    ) =>
            {
                StoreError::DuplicateKey(err.to_string())
            }
            Some(e) if e.code == ErrorCode::DatabaseCorrupt => StoreError::Corrupted(err.to_string()),
            _ => StoreError::Sqlite(err),
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
