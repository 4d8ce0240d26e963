//! Lock Coordinator - acquisition, release and TTL assertion
//!
//! Acquiring a name means winning two locks:
//! 1. the registry row (insert fails if another caller already claimed it)
//! 2. the store's native session lock of the same name
//!
//! The registry row arbitrates contention; the native lock tells competitors
//! whether the claimant is still alive. Once a caller owns the row, any other
//! session still holding the native lock is an orphan and gets terminated.

use std::cell::RefCell;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::SharedLockConfig;
use crate::handle::LockHandle;
use crate::registry::{LockRecord, LockRegistry, QuoteStyle, DEFAULT_TABLE};
use crate::store::{SessionId, StoreGateway};
use crate::{Error, Result};

/// Minimum remaining TTL checked by `assert_held`
pub const DEFAULT_MIN_REMAINING_TTL: u64 = 1;

/// Tuning knobs of the acquisition protocol
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Registry table name
    pub table: String,
    pub quote_style: QuoteStyle,
    /// Pause between native lock probes while the holder cannot be identified,
    /// and the shortest wait between acquisition attempts
    pub poll_interval: Duration,
    /// Attempts to take over the native lock from another session before giving up
    pub kill_retry_limit: u32,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            quote_style: QuoteStyle::default(),
            poll_interval: Duration::from_millis(200),
            kill_retry_limit: 20,
        }
    }
}

impl From<&SharedLockConfig> for CoordinatorOptions {
    fn from(config: &SharedLockConfig) -> Self {
        Self {
            table: config.table.clone(),
            quote_style: config.quote_style,
            poll_interval: Duration::from_millis(config.tuning.poll_interval_ms),
            kill_retry_limit: config.tuning.kill_retry_limit,
        }
    }
}

/// Acquires and releases named locks through one store session
///
/// The coordinator owns its gateway for its whole lifetime; dropping it (or
/// calling [`close`](Self::close)) ends the session, which also drops every
/// native lock it held.
pub struct LockCoordinator<G: StoreGateway> {
    gateway: RefCell<G>,
    registry: LockRegistry,
    options: CoordinatorOptions,
}

impl<G: StoreGateway> LockCoordinator<G> {
    pub fn new(gateway: G, options: CoordinatorOptions) -> Result<Self> {
        let registry = LockRegistry::new(&options.table, options.quote_style, &gateway)?;
        Ok(Self {
            gateway: RefCell::new(gateway),
            registry,
            options,
        })
    }

    /// Store session id of this coordinator
    pub fn session_id(&self) -> SessionId {
        self.gateway.borrow().session_id()
    }

    pub fn registry(&self) -> &LockRegistry {
        &self.registry
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Create the registry table if it does not exist
    pub fn ensure_table(&self) -> Result<()> {
        let mut gateway = self.gateway.borrow_mut();
        self.registry.ensure_table(&mut *gateway)
    }

    /// End the store session
    pub fn close(self) {
        tracing::debug!("closing lock session {}", self.session_id());
    }

    // ========== Acquisition ==========

    /// Acquire `name` within `timeout`, claiming it for `ttl` seconds
    ///
    /// Fails with [`Error::Timeout`] if the lock stayed taken for the whole
    /// timeout and with [`Error::Acquire`] on any other failure.
    pub fn lock(&self, name: &str, timeout: Duration, ttl: u64) -> Result<LockHandle<'_, G>> {
        {
            let mut gateway = self.gateway.borrow_mut();
            self.acquire(&mut *gateway, name, timeout, ttl)
                .map_err(|err| err.into_acquire(name))?;
        }
        tracing::info!("Acquired lock \"{}\" (ttl {}s)", name, ttl);
        Ok(LockHandle::new(self, name))
    }

    fn acquire(&self, gateway: &mut G, name: &str, timeout: Duration, ttl: u64) -> Result<()> {
        let start = Instant::now();

        loop {
            if self.try_acquire(gateway, name, ttl)? {
                return Ok(());
            }

            // a dead holder's claim can go right away
            if self.registry.clean_obsolete(gateway, name)? {
                tracing::debug!("removed stale claim on \"{}\"", name);
                continue;
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Error::Timeout {
                    name: name.to_string(),
                    timeout,
                });
            }

            let remaining_timeout = timeout - elapsed;
            let remaining_ttl = self.registry.remaining_ttl(gateway, name)?;
            let wait = remaining_timeout
                .min(Duration::from_secs(remaining_ttl.max(0) as u64))
                .max(self.options.poll_interval)
                .min(remaining_timeout);

            tracing::debug!("lock \"{}\" is taken, waiting up to {:?}", name, wait);
            self.sleep_until_release(gateway, name, wait)?;
        }
    }

    /// Claim `name` in the registry and confirm the claim with the native lock
    fn try_acquire(&self, gateway: &mut G, name: &str, ttl: u64) -> Result<bool> {
        if !self.registry.register(gateway, name, ttl)? {
            tracing::debug!("lock \"{}\" is already registered", name);
            return Ok(false);
        }

        let mut native_held = false;
        if let Err(err) = self.confirm_claim(gateway, name, &mut native_held) {
            self.rollback(gateway, name, native_held);
            return Err(err);
        }
        Ok(true)
    }

    fn confirm_claim(&self, gateway: &mut G, name: &str, native_held: &mut bool) -> Result<()> {
        // no other session is entitled to the native lock now, so never wait for it
        let mut tries = 0;
        while !gateway.acquire_native(name, Duration::ZERO)? {
            match gateway.native_holder(name)? {
                Some(holder) => {
                    tracing::debug!("terminating session {} holding native lock \"{}\"", holder, name);
                    if let Err(err) = gateway.terminate_session(holder) {
                        // it may have ended on its own meanwhile
                        tracing::debug!("terminating session {} failed: {}", holder, err);
                    }
                }
                None => thread::sleep(self.options.poll_interval),
            }

            tries += 1;
            if tries > self.options.kill_retry_limit {
                return Err(Error::acquire(
                    name,
                    "Other session holds the native lock and does not terminate",
                ));
            }
        }
        *native_held = true;

        if !self.registry.mark_acquired(gateway, name)? {
            return Err(Error::acquire(name, "Could not mark the registry claim as acquired"));
        }
        Ok(())
    }

    /// Undo a half-completed claim; failures are logged, never raised
    fn rollback(&self, gateway: &mut G, name: &str, native_held: bool) {
        if let Err(err) = self.registry.deregister(gateway, name) {
            tracing::warn!("Rolling back claim on \"{}\" failed: {}", name, err);
        }
        if native_held {
            if let Err(err) = gateway.release_native(name) {
                tracing::warn!("Releasing native lock \"{}\" after failed claim failed: {}", name, err);
            }
        }
    }

    /// Block until the native lock of `name` is released or `wait` elapses
    fn sleep_until_release(&self, gateway: &mut G, name: &str, wait: Duration) -> Result<()> {
        if gateway.acquire_native(name, Duration::ZERO)? {
            // the claimant has not confirmed yet (or died before it could)
            gateway.release_native(name)?;
            thread::sleep(self.options.poll_interval.min(wait));
            return Ok(());
        }

        if gateway.acquire_native(name, wait)? {
            gateway.release_native(name)?;
        }
        Ok(())
    }

    // ========== Release ==========

    /// Release `name`
    ///
    /// Fails with [`Error::Release`] if this session no longer owned the claim;
    /// the lock must then be assumed lost (e.g. evicted after its TTL).
    pub fn unlock(&self, name: &str) -> Result<()> {
        let mut gateway = self.gateway.borrow_mut();
        self.release(&mut *gateway, name)
            .map_err(|err| err.into_release(name))
    }

    fn release(&self, gateway: &mut G, name: &str) -> Result<()> {
        let deregistered = self.registry.deregister(gateway, name)?;

        // retries may have left the native lock held more than once
        while gateway.release_native(name)? {}

        if !deregistered {
            return Err(Error::Release {
                name: name.to_string(),
                reason: "the lock was not held by this session anymore".to_string(),
                source: None,
            });
        }
        tracing::info!("Released lock \"{}\"", name);
        Ok(())
    }

    // ========== TTL ==========

    /// Check that this session still holds `name` for at least `min_remaining` seconds
    pub fn assert_ttl(&self, name: &str, min_remaining: u64) -> Result<()> {
        let mut gateway = self.gateway.borrow_mut();
        match self.registry.has_remaining_ttl(&mut *gateway, name, min_remaining) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::RemainingTtl {
                name: name.to_string(),
                min_remaining,
                source: None,
            }),
            Err(err) => Err(err.into_remaining_ttl(name, min_remaining)),
        }
    }

    /// `assert_ttl` with the default minimum of one second
    pub fn assert_held(&self, name: &str) -> Result<()> {
        self.assert_ttl(name, DEFAULT_MIN_REMAINING_TTL)
    }

    /// Seconds until the current claim on `name` expires, 0 if unclaimed
    pub fn remaining_ttl(&self, name: &str) -> Result<i64> {
        let mut gateway = self.gateway.borrow_mut();
        self.registry.remaining_ttl(&mut *gateway, name)
    }

    // ========== Maintenance ==========

    /// Repair the registry table
    pub fn repair_table(&self) -> Result<()> {
        let mut gateway = self.gateway.borrow_mut();
        self.registry.repair(&mut *gateway)
    }

    /// All current registry rows
    pub fn records(&self) -> Result<Vec<LockRecord>> {
        let mut gateway = self.gateway.borrow_mut();
        self.registry.list(&mut *gateway)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FlakyGateway;
    use crate::store::{
        RepairRow, SqlDialect, SqlType, SqlValue, SqliteGateway, StoreError, StoreResult,
    };
    use std::error::Error as _;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use tempfile::TempDir;

    fn fast_options() -> CoordinatorOptions {
        CoordinatorOptions {
            poll_interval: Duration::from_millis(20),
            ..CoordinatorOptions::default()
        }
    }

    /// One database file; each gateway opens its own connection and session
    #[derive(Clone)]
    struct Store {
        _dir: Arc<TempDir>,
        path: PathBuf,
    }

    impl Store {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("locks.db");
            let store = Self {
                _dir: Arc::new(dir),
                path,
            };
            store.coordinator().ensure_table().unwrap();
            store
        }

        fn gateway(&self) -> SqliteGateway {
            SqliteGateway::open(&self.path).unwrap()
        }

        fn holder(&self, name: &str) -> Option<SessionId> {
            self.gateway().native_holder(name).unwrap()
        }

        fn kill(&self, id: SessionId) {
            self.gateway().terminate_session(id).unwrap();
        }

        fn coordinator(&self) -> LockCoordinator<SqliteGateway> {
            LockCoordinator::new(self.gateway(), fast_options()).unwrap()
        }

        fn delete_claim(&self, name: &str) {
            let mut gw = self.gateway();
            let deleted = gw
                .execute("DELETE FROM shared_locks WHERE name = ?", &[name.into()])
                .unwrap();
            assert_eq!(deleted, 1);
        }
    }

    /// How `StubbornGateway` answers a kill request
    #[derive(Clone, Copy)]
    enum Kill {
        /// report success without killing
        Ignore,
        /// fail without killing
        Refuse,
        /// kill, then report the session as unknown
        KillThenFail,
    }

    /// Gateway that hides the native lock holder for a few lookups and misbehaves on kills
    struct StubbornGateway {
        inner: SqliteGateway,
        hidden_holder_lookups: u32,
        holder_lookups: u32,
        kill: Kill,
    }

    impl StubbornGateway {
        fn new(inner: SqliteGateway, hidden_holder_lookups: u32, kill: Kill) -> Self {
            Self {
                inner,
                hidden_holder_lookups,
                holder_lookups: 0,
                kill,
            }
        }
    }

    impl StoreGateway for StubbornGateway {
        fn session_id(&self) -> SessionId {
            self.inner.session_id()
        }

        fn dialect(&self) -> SqlDialect {
            self.inner.dialect()
        }

        fn execute(&mut self, sql: &str, params: &[SqlValue]) -> StoreResult<u64> {
            self.inner.execute(sql, params)
        }

        fn query(
            &mut self,
            sql: &str,
            params: &[SqlValue],
            columns: &[SqlType],
        ) -> StoreResult<Vec<Vec<SqlValue>>> {
            self.inner.query(sql, params, columns)
        }

        fn repair_table(&mut self, quoted_table: &str) -> StoreResult<Vec<RepairRow>> {
            self.inner.repair_table(quoted_table)
        }

        fn acquire_native(&mut self, name: &str, timeout: Duration) -> StoreResult<bool> {
            self.inner.acquire_native(name, timeout)
        }

        fn release_native(&mut self, name: &str) -> StoreResult<bool> {
            self.inner.release_native(name)
        }

        fn native_holder(&mut self, name: &str) -> StoreResult<Option<SessionId>> {
            self.holder_lookups += 1;
            if self.hidden_holder_lookups > 0 {
                self.hidden_holder_lookups -= 1;
                return Ok(None);
            }
            self.inner.native_holder(name)
        }

        fn terminate_session(&mut self, id: SessionId) -> StoreResult<()> {
            match self.kill {
                Kill::Ignore => Ok(()),
                Kill::Refuse => Err(StoreError::UnknownSession(id)),
                Kill::KillThenFail => {
                    self.inner.terminate_session(id)?;
                    Err(StoreError::UnknownSession(id))
                }
            }
        }
    }

    #[test]
    fn test_lock_and_release() {
        let store = Store::new();
        let locks = store.coordinator();

        let handle = locks.lock("x", Duration::ZERO, 10).unwrap();
        assert_eq!(handle.name(), "x");

        let records = locks.records().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].lock_acquired);
        assert_eq!(records[0].connection_id, locks.session_id());
        assert_eq!(store.holder("x"), Some(locks.session_id()));

        handle.release().unwrap();
        assert!(locks.records().unwrap().is_empty());
        assert_eq!(store.holder("x"), None);
    }

    #[test]
    fn test_held_lock_times_out() {
        let store = Store::new();
        let a = store.coordinator();
        let b = store.coordinator();

        let _held = a.lock("x", Duration::ZERO, 10).unwrap();

        let err = b.lock("x", Duration::ZERO, 10).unwrap_err();
        assert!(err.is_timeout());

        let start = Instant::now();
        let err = b.lock("x", Duration::from_secs(1), 10).unwrap_err();
        let waited = start.elapsed();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(err.lock_name(), Some("x"));
        assert!(waited >= Duration::from_secs(1));
        assert!(waited < Duration::from_secs(3));
    }

    #[test]
    fn test_release_wakes_waiter() {
        let store = Store::new();
        let (acquired_tx, acquired_rx) = mpsc::channel();

        let holder = {
            let store = store.clone();
            thread::spawn(move || {
                let locks = store.coordinator();
                let handle = locks.lock("x", Duration::ZERO, 10).unwrap();
                acquired_tx.send(()).unwrap();
                thread::sleep(Duration::from_secs(2));
                handle.release().unwrap();
            })
        };

        acquired_rx.recv().unwrap();
        let waiter = store.coordinator();
        let start = Instant::now();
        let handle = waiter.lock("x", Duration::from_secs(5), 10).unwrap();
        let waited = start.elapsed();

        assert!(waited >= Duration::from_millis(1500));
        assert!(waited < Duration::from_secs(4));
        handle.release().unwrap();
        holder.join().unwrap();
    }

    #[test]
    fn test_dead_confirmed_holder_is_evicted_immediately() {
        let store = Store::new();

        let a = store.coordinator();
        a.lock("x", Duration::ZERO, 60).unwrap().detach();
        // process death: the session ends, the registry row stays
        a.close();
        assert_eq!(store.coordinator().records().unwrap().len(), 1);

        let b = store.coordinator();
        let start = Instant::now();
        let handle = b.lock("x", Duration::ZERO, 10).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(b.records().unwrap()[0].connection_id, b.session_id());
        handle.release().unwrap();
    }

    #[test]
    fn test_dead_unconfirmed_holder_expires_by_ttl() {
        let store = Store::new();

        {
            let mut gw = store.gateway();
            let registry = LockRegistry::new(DEFAULT_TABLE, QuoteStyle::Backtick, &gw).unwrap();
            assert!(registry.register(&mut gw, "x", 2).unwrap());
        }

        let b = store.coordinator();
        let start = Instant::now();
        let handle = b.lock("x", Duration::from_secs(6), 10).unwrap();
        let waited = start.elapsed();

        assert!(waited >= Duration::from_secs(1));
        assert!(waited < Duration::from_secs(5));
        handle.release().unwrap();
    }

    #[test]
    fn test_orphaned_native_lock_holder_is_terminated() {
        let store = Store::new();
        let mut orphan = store.gateway();
        orphan.acquire_native("x", Duration::ZERO).unwrap();

        let locks = store.coordinator();
        let handle = locks.lock("x", Duration::ZERO, 10).unwrap();

        assert!(matches!(
            orphan.execute("SELECT 1", &[]),
            Err(StoreError::SessionTerminated(_))
        ));
        assert_eq!(store.holder("x"), Some(locks.session_id()));
        handle.release().unwrap();
    }

    #[test]
    fn test_unkillable_holder_fails_and_rolls_back() {
        let store = Store::new();
        let mut orphan = store.gateway();
        orphan.acquire_native("x", Duration::ZERO).unwrap();

        let options = CoordinatorOptions {
            kill_retry_limit: 3,
            ..fast_options()
        };
        let gw = StubbornGateway::new(store.gateway(), 0, Kill::Ignore);
        let locks = LockCoordinator::new(gw, options).unwrap();

        let err = locks.lock("x", Duration::from_secs(5), 10).unwrap_err();
        assert!(matches!(err, Error::Acquire { .. }));
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("does not terminate"));
        assert!(locks.records().unwrap().is_empty());
    }

    #[test]
    fn test_unidentified_holder_is_polled_and_failed_kill_is_ignored() {
        let store = Store::new();
        let mut orphan = store.gateway();
        orphan.acquire_native("x", Duration::ZERO).unwrap();

        let options = CoordinatorOptions {
            kill_retry_limit: 5,
            ..fast_options()
        };
        let gw = StubbornGateway::new(store.gateway(), 2, Kill::KillThenFail);
        let locks = LockCoordinator::new(gw, options).unwrap();

        let start = Instant::now();
        let handle = locks.lock("x", Duration::ZERO, 10).unwrap();
        // two polls while the holder stayed hidden, then one kill
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(locks.gateway.borrow().holder_lookups, 3);
        assert_eq!(store.holder("x"), Some(locks.session_id()));
        assert!(matches!(
            orphan.execute("SELECT 1", &[]),
            Err(StoreError::SessionTerminated(_))
        ));
        handle.release().unwrap();
    }

    #[test]
    fn test_refused_kills_hit_retry_limit_and_roll_back() {
        let store = Store::new();
        let mut orphan = store.gateway();
        orphan.acquire_native("x", Duration::ZERO).unwrap();

        let options = CoordinatorOptions {
            kill_retry_limit: 3,
            ..fast_options()
        };
        let gw = StubbornGateway::new(store.gateway(), 1, Kill::Refuse);
        let locks = LockCoordinator::new(gw, options).unwrap();

        let err = locks.lock("x", Duration::from_secs(5), 10).unwrap_err();
        assert!(matches!(err, Error::Acquire { .. }));
        assert!(err.to_string().contains("does not terminate"));
        assert_eq!(locks.gateway.borrow().holder_lookups, 4);
        assert!(locks.records().unwrap().is_empty());
        assert_eq!(store.holder("x"), Some(orphan.session_id()));
    }

    #[test]
    fn test_independently_opened_sessions_exclude_each_other() {
        let store = Store::new();
        let a = store.coordinator();
        let b = store.coordinator();
        assert_ne!(a.session_id(), b.session_id());

        let held = a.lock("x", Duration::ZERO, 60).unwrap();

        let err = b.lock("x", Duration::from_millis(300), 60).unwrap_err();
        assert!(err.is_timeout());
        assert!(matches!(b.unlock("x"), Err(Error::Release { .. })));
        assert!(b.assert_held("x").is_err());

        a.assert_held("x").unwrap();
        let records = a.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].connection_id, a.session_id());
        assert_eq!(store.holder("x"), Some(a.session_id()));

        held.release().unwrap();
        b.lock("x", Duration::ZERO, 60).unwrap().release().unwrap();
    }

    #[test]
    fn test_crashed_holder_is_evicted_immediately() {
        let store = Store::new();

        let a = store.coordinator();
        a.lock("x", Duration::ZERO, 60).unwrap().detach();
        // the process is killed: no cleanup runs, the OS drops its lease
        a.gateway.into_inner().crash();

        let b = store.coordinator();
        let start = Instant::now();
        let handle = b.lock("x", Duration::ZERO, 10).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(b.records().unwrap()[0].connection_id, b.session_id());
        handle.release().unwrap();
    }

    #[test]
    fn test_out_of_range_ttl_fails_acquire() {
        let store = Store::new();
        let locks = store.coordinator();

        let err = locks.lock("x", Duration::ZERO, u64::MAX).unwrap_err();
        assert!(matches!(err, Error::Acquire { .. }));
        assert!(locks.records().unwrap().is_empty());
        assert_eq!(store.holder("x"), None);
    }

    #[test]
    fn test_unlock_after_external_delete_fails() {
        let store = Store::new();
        let locks = store.coordinator();

        let handle = locks.lock("x", Duration::ZERO, 10).unwrap();
        store.delete_claim("x");

        let err = handle.release().unwrap_err();
        assert!(matches!(err, Error::Release { source: None, .. }));
        assert_eq!(store.holder("x"), None);
    }

    #[test]
    fn test_unlock_after_connection_loss_fails() {
        let store = Store::new();
        let locks = store.coordinator();

        let handle = locks.lock("x", Duration::ZERO, 10).unwrap();
        store.kill(locks.session_id());

        let err = handle.release().unwrap_err();
        assert!(matches!(err, Error::Release { .. }));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_assert_ttl() {
        let store = Store::new();
        let locks = store.coordinator();

        let handle = locks.lock("x", Duration::ZERO, 10).unwrap();
        handle.assert_ttl(5).unwrap();
        handle.assert_held().unwrap();

        let err = handle.assert_ttl(20).unwrap_err();
        match err {
            Error::RemainingTtl { name, min_remaining, source } => {
                assert_eq!(name, "x");
                assert_eq!(min_remaining, 20);
                assert!(source.is_none());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_assert_ttl_fails_when_lock_lost() {
        let store = Store::new();
        let locks = store.coordinator();

        locks.lock("x", Duration::ZERO, 10).unwrap().detach();
        store.delete_claim("x");
        assert!(matches!(
            locks.assert_ttl("x", 1),
            Err(Error::RemainingTtl { source: None, .. })
        ));

        locks.lock("y", Duration::ZERO, 10).unwrap().detach();
        store.kill(locks.session_id());
        assert!(matches!(
            locks.assert_held("y"),
            Err(Error::RemainingTtl { source: Some(_), .. })
        ));
    }

    #[test]
    fn test_assert_ttl_of_other_session_fails() {
        let store = Store::new();
        let a = store.coordinator();
        let b = store.coordinator();

        let _held = a.lock("x", Duration::ZERO, 10).unwrap();
        assert!(b.assert_held("x").is_err());
    }

    #[test]
    fn test_repair_table() {
        let store = Store::new();
        store.coordinator().repair_table().unwrap();
    }

    #[test]
    fn test_lock_survives_single_corruption() {
        let store = Store::new();
        let mut gw = FlakyGateway::new(store.gateway());
        gw.corrupt_next = 1;
        let locks = LockCoordinator::new(gw, fast_options()).unwrap();

        let handle = locks.lock("x", Duration::ZERO, 10).unwrap();
        handle.release().unwrap();
        assert_eq!(locks.gateway.borrow().repairs, 1);
    }

    #[test]
    fn test_repeated_corruption_fails_acquire() {
        let store = Store::new();
        let mut gw = FlakyGateway::new(store.gateway());
        gw.corrupt_next = 2;
        let locks = LockCoordinator::new(gw, fast_options()).unwrap();

        let err = locks.lock("x", Duration::ZERO, 10).unwrap_err();
        assert!(matches!(err, Error::Acquire { .. }));
        let cause = err.source().unwrap();
        assert!(cause.to_string().contains("seems to be corrupted"));
    }

    #[test]
    fn test_independent_names_do_not_contend() {
        let store = Store::new();
        let a = store.coordinator();
        let b = store.coordinator();

        let x = a.lock("x", Duration::ZERO, 10).unwrap();
        let y = b.lock("y", Duration::ZERO, 10).unwrap();
        let z = a.lock("z", Duration::ZERO, 10).unwrap();
        assert_eq!(a.records().unwrap().len(), 3);

        x.release().unwrap();
        y.release().unwrap();
        z.release().unwrap();
    }

    #[test]
    fn test_mutual_exclusion() {
        let store = Store::new();
        let inside = Arc::new(AtomicBool::new(false));
        let entries = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let inside = Arc::clone(&inside);
                let entries = Arc::clone(&entries);
                thread::spawn(move || {
                    let locks = store.coordinator();
                    for _ in 0..5 {
                        let handle = locks.lock("shared", Duration::from_secs(30), 30).unwrap();
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        entries.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(5));
                        inside.store(false, Ordering::SeqCst);
                        handle.release().unwrap();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(entries.load(Ordering::SeqCst), 20);
        assert!(store.coordinator().records().unwrap().is_empty());
    }

    #[test]
    fn test_options_from_config() {
        let mut config = SharedLockConfig::default();
        config.table = "app_locks".into();
        config.tuning.poll_interval_ms = 50;
        config.tuning.kill_retry_limit = 7;

        let options = CoordinatorOptions::from(&config);
        assert_eq!(options.table, "app_locks");
        assert_eq!(options.poll_interval, Duration::from_millis(50));
        assert_eq!(options.kill_retry_limit, 7);
    }
}
