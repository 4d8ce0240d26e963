//! Cross-process sessions and native locks of a SQLite database
//!
//! SQLite has no server that owns sessions, so they live in the database file
//! where every process opening it sees them:
//! - `sharedlock_sessions` hands out session ids (`AUTOINCREMENT`, never reused)
//! - `sharedlock_native_locks` maps a lock name to its holding session and the
//!   re-entrancy depth (each acquire must be matched by a release)
//!
//! A session is alive while some process holds the exclusive OS lock on its
//! lease file `<database>.sessions/<id>.lock`. The OS drops that lock with the
//! process, so the native locks of a crashed session count as free at once,
//! before anyone cleans up its rows.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::sqlite::unix_now;
use super::{SessionId, StoreError, StoreResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sharedlock_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pid INTEGER NOT NULL,
    opened BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS sharedlock_native_locks (
    name VARCHAR(255) NOT NULL PRIMARY KEY,
    holder INTEGER NOT NULL,
    depth INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS sharedlock_native_locks_holder ON sharedlock_native_locks (holder);
";

/// Exclusive OS lock on a session's lease file; the session is dead once it is dropped
#[derive(Debug)]
pub struct SessionLease {
    id: SessionId,
    path: PathBuf,
    _file: File,
}

impl SessionLease {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

/// Session and native lock bookkeeping of one database file
#[derive(Debug, Clone)]
pub struct SessionTable {
    lease_dir: PathBuf,
}

impl SessionTable {
    /// Sessions of the database at `path`, with lease files in `<path>.sessions/`
    pub fn for_database(path: &Path) -> Self {
        let mut dir = path.as_os_str().to_owned();
        dir.push(".sessions");
        Self {
            lease_dir: PathBuf::from(dir),
        }
    }

    pub fn lease_dir(&self) -> &Path {
        &self.lease_dir
    }

    fn lease_path(&self, id: SessionId) -> PathBuf {
        self.lease_dir.join(format!("{}.lock", id))
    }

    /// Start a new session on `conn`
    ///
    /// The id is only committed once its lease is locked, so other processes
    /// never see a fresh session as dead. Sessions whose lease is no longer
    /// held are removed on the way.
    pub fn open(&self, conn: &mut Connection) -> StoreResult<SessionLease> {
        conn.execute_batch(SCHEMA)?;
        fs::create_dir_all(&self.lease_dir)?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO sharedlock_sessions (pid, opened) VALUES (?1, ?2)",
            params![process::id(), unix_now()],
        )?;
        let id = tx.last_insert_rowid() as SessionId;
        let lease = self.claim(id)?;
        let pruned = self.prune(&tx, id)?;
        tx.commit()?;

        if pruned > 0 {
            tracing::debug!("removed {} dead sqlite session(s)", pruned);
        }
        Ok(lease)
    }

    fn claim(&self, id: SessionId) -> StoreResult<SessionLease> {
        let path = self.lease_path(id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        match file.try_lock() {
            Ok(()) => Ok(SessionLease { id, path, _file: file }),
            Err(TryLockError::WouldBlock) => Err(StoreError::Database(format!(
                "session lease {} is held by another process",
                path.display()
            ))),
            Err(TryLockError::Error(err)) => Err(err.into()),
        }
    }

    /// Whether the process owning session `id` still holds its lease
    pub fn is_alive(&self, id: SessionId) -> bool {
        let path = self.lease_path(id);
        let file = match OpenOptions::new().write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return false,
            Err(err) => {
                tracing::warn!("Cannot open session lease {}: {}", path.display(), err);
                return true;
            }
        };
        match file.try_lock() {
            // our lock goes away with `file`
            Ok(()) => false,
            Err(TryLockError::WouldBlock) => true,
            Err(TryLockError::Error(err)) => {
                tracing::warn!("Cannot check session lease {}: {}", path.display(), err);
                true
            }
        }
    }

    /// Whether session `id` has not been closed or terminated
    pub fn exists(&self, conn: &Connection, id: SessionId) -> StoreResult<bool> {
        let exists = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sharedlock_sessions WHERE id = ?1)",
            [id as i64],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Take `name` for session `id` unless a live session holds it
    pub fn try_acquire(&self, conn: &mut Connection, id: SessionId, name: &str) -> StoreResult<bool> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !self.exists(&tx, id)? {
            return Err(StoreError::SessionTerminated(id));
        }

        let holder: Option<i64> = tx
            .query_row(
                "SELECT holder FROM sharedlock_native_locks WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;

        let acquired = match holder.map(|holder| holder as SessionId) {
            Some(holder) if holder == id => {
                tx.execute(
                    "UPDATE sharedlock_native_locks SET depth = depth + 1 WHERE name = ?1",
                    [name],
                )?;
                true
            }
            Some(holder) if self.is_alive(holder) => false,
            _ => {
                tx.execute(
                    "INSERT OR REPLACE INTO sharedlock_native_locks (name, holder, depth) VALUES (?1, ?2, 1)",
                    params![name, id as i64],
                )?;
                true
            }
        };
        tx.commit()?;
        Ok(acquired)
    }

    /// Release one hold of `name`; false if session `id` does not hold it
    pub fn release(&self, conn: &mut Connection, id: SessionId, name: &str) -> StoreResult<bool> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !self.exists(&tx, id)? {
            return Err(StoreError::SessionTerminated(id));
        }

        let depth: Option<i64> = tx
            .query_row(
                "SELECT depth FROM sharedlock_native_locks WHERE name = ?1 AND holder = ?2",
                params![name, id as i64],
                |row| row.get(0),
            )
            .optional()?;

        match depth {
            Some(depth) if depth > 1 => {
                tx.execute(
                    "UPDATE sharedlock_native_locks SET depth = depth - 1 WHERE name = ?1",
                    [name],
                )?;
            }
            Some(_) => {
                tx.execute("DELETE FROM sharedlock_native_locks WHERE name = ?1", [name])?;
            }
            None => {}
        }
        tx.commit()?;
        Ok(depth.is_some())
    }

    /// Live session holding `name`, if any
    pub fn holder(&self, conn: &Connection, name: &str) -> StoreResult<Option<SessionId>> {
        let holder: Option<i64> = conn
            .query_row(
                "SELECT holder FROM sharedlock_native_locks WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(holder
            .map(|holder| holder as SessionId)
            .filter(|holder| self.is_alive(*holder)))
    }

    /// Kill session `id`: its native locks are dropped and its later calls fail
    pub fn terminate(&self, conn: &mut Connection, id: SessionId) -> StoreResult<()> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let known = self.forget(&tx, id)?;
        tx.commit()?;

        if !known {
            return Err(StoreError::UnknownSession(id));
        }
        tracing::debug!("sqlite session {} terminated", id);
        Ok(())
    }

    /// End a session normally; failures are logged, never raised
    pub fn close(&self, conn: &Connection, lease: SessionLease) {
        if let Err(err) = self.forget(conn, lease.id) {
            tracing::debug!("closing sqlite session {} failed: {}", lease.id, err);
        }
        let path = lease.path.clone();
        drop(lease);
        if let Err(err) = fs::remove_file(&path) {
            tracing::debug!("removing session lease {} failed: {}", path.display(), err);
        }
    }

    fn forget(&self, conn: &Connection, id: SessionId) -> StoreResult<bool> {
        conn.execute("DELETE FROM sharedlock_native_locks WHERE holder = ?1", [id as i64])?;
        let removed = conn.execute("DELETE FROM sharedlock_sessions WHERE id = ?1", [id as i64])?;
        Ok(removed > 0)
    }

    fn prune(&self, conn: &Connection, own: SessionId) -> StoreResult<usize> {
        let ids: Vec<i64> = {
            let mut stmt = conn.prepare("SELECT id FROM sharedlock_sessions WHERE id != ?1")?;
            stmt.query_map([own as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?
        };

        let mut pruned = 0;
        for id in ids.into_iter().map(|id| id as SessionId) {
            if self.is_alive(id) {
                continue;
            }
            self.forget(conn, id)?;
            if let Err(err) = fs::remove_file(self.lease_path(id)) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!("removing lease of dead session {} failed: {}", id, err);
                }
            }
            pruned += 1;
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Db {
        _dir: TempDir,
        path: PathBuf,
        table: SessionTable,
    }

    impl Db {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("locks.db");
            let table = SessionTable::for_database(&path);
            Self {
                _dir: dir,
                path,
                table,
            }
        }

        fn connect(&self) -> (Connection, SessionLease) {
            let mut conn = Connection::open(&self.path).unwrap();
            conn.busy_timeout(std::time::Duration::from_secs(5)).unwrap();
            let lease = self.table.open(&mut conn).unwrap();
            (conn, lease)
        }
    }

    #[test]
    fn test_session_ids_are_unique_across_connections() {
        let db = Db::new();
        let (_a_conn, a) = db.connect();
        let (_b_conn, b) = db.connect();

        assert_ne!(a.id(), b.id());
        assert!(db.table.is_alive(a.id()));
        assert!(db.table.is_alive(b.id()));
        assert!(db.table.lease_dir().ends_with("locks.db.sessions"));
    }

    #[test]
    fn test_acquire_is_exclusive_and_reentrant() {
        let db = Db::new();
        let (mut a_conn, a) = db.connect();
        let (mut b_conn, b) = db.connect();

        assert!(db.table.try_acquire(&mut a_conn, a.id(), "x").unwrap());
        assert!(db.table.try_acquire(&mut a_conn, a.id(), "x").unwrap());
        assert!(!db.table.try_acquire(&mut b_conn, b.id(), "x").unwrap());
        assert_eq!(db.table.holder(&b_conn, "x").unwrap(), Some(a.id()));

        assert!(!db.table.release(&mut b_conn, b.id(), "x").unwrap());
        assert!(db.table.release(&mut a_conn, a.id(), "x").unwrap());
        assert_eq!(db.table.holder(&b_conn, "x").unwrap(), Some(a.id()));
        assert!(db.table.release(&mut a_conn, a.id(), "x").unwrap());
        assert!(!db.table.release(&mut a_conn, a.id(), "x").unwrap());
        assert_eq!(db.table.holder(&b_conn, "x").unwrap(), None);

        assert!(db.table.try_acquire(&mut b_conn, b.id(), "x").unwrap());
    }

    #[test]
    fn test_dropped_lease_frees_native_locks() {
        let db = Db::new();
        let (mut a_conn, a) = db.connect();
        let (mut b_conn, b) = db.connect();
        let a_id = a.id();
        db.table.try_acquire(&mut a_conn, a_id, "x").unwrap();

        // the process died: no cleanup ran, only the OS lock is gone
        drop(a);
        assert!(!db.table.is_alive(a_id));
        assert_eq!(db.table.holder(&b_conn, "x").unwrap(), None);
        assert!(db.table.try_acquire(&mut b_conn, b.id(), "x").unwrap());
        assert_eq!(db.table.holder(&a_conn, "x").unwrap(), Some(b.id()));
    }

    #[test]
    fn test_open_prunes_dead_sessions() {
        let db = Db::new();
        let (a_conn, a) = db.connect();
        let a_id = a.id();
        drop(a);
        drop(a_conn);

        let (b_conn, _b) = db.connect();
        assert!(!db.table.exists(&b_conn, a_id).unwrap());
        assert!(!db.table.lease_path(a_id).exists());
    }

    #[test]
    fn test_terminate() {
        let db = Db::new();
        let (mut a_conn, a) = db.connect();
        let (mut b_conn, _b) = db.connect();
        db.table.try_acquire(&mut a_conn, a.id(), "x").unwrap();

        db.table.terminate(&mut b_conn, a.id()).unwrap();
        assert_eq!(db.table.holder(&b_conn, "x").unwrap(), None);
        assert!(matches!(
            db.table.try_acquire(&mut a_conn, a.id(), "x"),
            Err(StoreError::SessionTerminated(_))
        ));
        assert!(matches!(
            db.table.terminate(&mut b_conn, a.id()),
            Err(StoreError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_close_removes_session() {
        let db = Db::new();
        let (mut a_conn, a) = db.connect();
        let (b_conn, _b) = db.connect();
        let a_id = a.id();
        db.table.try_acquire(&mut a_conn, a_id, "x").unwrap();

        db.table.close(&a_conn, a);
        assert!(!db.table.exists(&b_conn, a_id).unwrap());
        assert_eq!(db.table.holder(&b_conn, "x").unwrap(), None);
        assert!(!db.table.lease_path(a_id).exists());
    }
}
