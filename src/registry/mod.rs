//! Lock Registry - the persisted table of lock ownership records
//!
//! One row per claimed lock name:
//! - name (primary key), created (unix seconds), ttl (seconds)
//! - connection_id: store session that registered the claim
//! - lock_acquired: set once that session also holds the native lock
//!
//! The primary key on `name` is the only source of mutual exclusion between
//! competing callers. A row may be changed by its owning session (confirm,
//! delete) or removed by anyone once it is stale.

pub mod executor;
pub mod schema;

pub use schema::{quote_identifier, QuoteStyle, Statements, DEFAULT_TABLE};

use serde::Serialize;

use crate::store::{SessionId, SqlType, SqlValue, StoreGateway};
use crate::{Error, Result};
use executor::run_resilient;

/// A registry row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRecord {
    pub name: String,
    pub created: i64,
    pub ttl: i64,
    pub connection_id: SessionId,
    pub lock_acquired: bool,
}

impl LockRecord {
    /// Unix time at which the claim stops being live
    pub fn expires_at(&self) -> i64 {
        self.created + self.ttl
    }

    /// A claim is live while `now < created + ttl`
    pub fn is_live(&self, now: i64) -> bool {
        now < self.expires_at()
    }

    pub fn remaining(&self, now: i64) -> i64 {
        self.expires_at() - now
    }

    fn from_row(row: Vec<SqlValue>) -> Option<Self> {
        let mut values = row.into_iter();
        let name = match values.next()? {
            SqlValue::Text(name) => name,
            _ => return None,
        };
        let mut int = || values.next().and_then(|v| v.as_i64());
        Some(Self {
            name,
            created: int()?,
            ttl: int()?,
            connection_id: int()? as SessionId,
            lock_acquired: int()? != 0,
        })
    }
}

/// Registry operations, rendered for one table and store
#[derive(Debug, Clone)]
pub struct LockRegistry {
    table: String,
    statements: Statements,
}

impl LockRegistry {
    pub fn new(table: &str, style: QuoteStyle, gateway: &dyn StoreGateway) -> Result<Self> {
        schema::validate_table_name(table)?;
        Ok(Self {
            table: table.to_string(),
            statements: Statements::new(table, style, gateway.dialect()),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn statements(&self) -> &Statements {
        &self.statements
    }

    fn run<G, T, F>(&self, gateway: &mut G, op: F) -> Result<T>
    where
        G: StoreGateway + ?Sized,
        F: FnMut(&mut G) -> crate::store::StoreResult<T>,
    {
        run_resilient(gateway, &self.table, &self.statements.quoted_table, op)
    }

    /// Create the registry table if it does not exist
    pub fn ensure_table<G: StoreGateway + ?Sized>(&self, gateway: &mut G) -> Result<()> {
        gateway.execute(&self.statements.create, &[])?;
        Ok(())
    }

    /// Insert an unconfirmed claim for this session; false if `name` is already claimed
    pub fn register<G: StoreGateway + ?Sized>(&self, gateway: &mut G, name: &str, ttl: u64) -> Result<bool> {
        let ttl = i64::try_from(ttl)
            .map_err(|_| Error::Config(format!("ttl of {} seconds is out of range", ttl)))?;
        let params = [SqlValue::from(name), SqlValue::Int(ttl)];
        match self.run(gateway, |g| g.execute(&self.statements.insert, &params)) {
            Ok(_) => Ok(true),
            Err(Error::Store(err)) if err.is_duplicate_key() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Confirm this session's claim; false if the row is gone or no longer ours
    pub fn mark_acquired<G: StoreGateway + ?Sized>(&self, gateway: &mut G, name: &str) -> Result<bool> {
        let params = [SqlValue::from(name)];
        let changed = self.run(gateway, |g| g.execute(&self.statements.confirm, &params))?;
        Ok(changed == 1)
    }

    /// Delete this session's claim; false if there was nothing of ours to delete
    pub fn deregister<G: StoreGateway + ?Sized>(&self, gateway: &mut G, name: &str) -> Result<bool> {
        let params = [SqlValue::from(name)];
        let deleted = self.run(gateway, |g| g.execute(&self.statements.release, &params))?;
        Ok(deleted == 1)
    }

    /// Delete the claim on `name` if it is expired or its confirmed owner lost the native lock
    pub fn clean_obsolete<G: StoreGateway + ?Sized>(&self, gateway: &mut G, name: &str) -> Result<bool> {
        let params = [SqlValue::from(name), SqlValue::from(name)];
        let deleted = self.run(gateway, |g| g.execute(&self.statements.sweep, &params))?;
        Ok(deleted == 1)
    }

    /// Seconds until the current claim on `name` expires, 0 if there is none
    pub fn remaining_ttl<G: StoreGateway + ?Sized>(&self, gateway: &mut G, name: &str) -> Result<i64> {
        let params = [SqlValue::from(name)];
        let remaining = self.run(gateway, |g| g.query_value(&self.statements.remaining_ttl, &params))?;
        Ok(remaining.unwrap_or(0))
    }

    /// Whether this session's claim on `name` lives at least `min_remaining` more seconds
    pub fn has_remaining_ttl<G: StoreGateway + ?Sized>(
        &self,
        gateway: &mut G,
        name: &str,
        min_remaining: u64,
    ) -> Result<bool> {
        // no claim can outlive the largest storable ttl
        let Ok(min_remaining) = i64::try_from(min_remaining) else {
            return Ok(false);
        };
        let params = [SqlValue::from(name), SqlValue::Int(min_remaining)];
        let found = self.run(gateway, |g| g.query_value(&self.statements.assert_ttl, &params))?;
        Ok(found == Some(1))
    }

    /// All registry rows, ordered by name
    pub fn list<G: StoreGateway + ?Sized>(&self, gateway: &mut G) -> Result<Vec<LockRecord>> {
        let columns = [SqlType::Text, SqlType::Int, SqlType::Int, SqlType::Int, SqlType::Int];
        let rows = self.run(gateway, |g| g.query(&self.statements.list, &[], &columns))?;
        Ok(rows.into_iter().filter_map(LockRecord::from_row).collect())
    }

    /// Repair the registry table
    pub fn repair<G: StoreGateway + ?Sized>(&self, gateway: &mut G) -> Result<()> {
        executor::repair_table(gateway, &self.table, &self.statements.quoted_table)
    }
}
