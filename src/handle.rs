//! Lock handle - an acquired lock, released when dropped

use std::fmt;

use crate::coordinator::{LockCoordinator, DEFAULT_MIN_REMAINING_TTL};
use crate::store::StoreGateway;
use crate::Result;

/// An acquired lock
///
/// Call [`release`](Self::release) to learn whether the lock was still held
/// when it was released. A handle dropped without `release` releases the lock
/// anyway and only logs a failure.
#[must_use = "dropping the handle releases the lock immediately"]
pub struct LockHandle<'a, G: StoreGateway> {
    coordinator: &'a LockCoordinator<G>,
    name: String,
    released: bool,
}

impl<'a, G: StoreGateway> LockHandle<'a, G> {
    pub(crate) fn new(coordinator: &'a LockCoordinator<G>, name: &str) -> Self {
        Self {
            coordinator,
            name: name.to_string(),
            released: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.coordinator.unlock(&self.name)
    }

    /// Fail unless the lock is still held for at least `min_remaining` seconds
    pub fn assert_ttl(&self, min_remaining: u64) -> Result<()> {
        self.coordinator.assert_ttl(&self.name, min_remaining)
    }

    pub fn assert_held(&self) -> Result<()> {
        self.assert_ttl(DEFAULT_MIN_REMAINING_TTL)
    }

    /// Seconds until the claim expires
    pub fn remaining_ttl(&self) -> Result<i64> {
        self.coordinator.remaining_ttl(&self.name)
    }

    /// Give up the handle without releasing the lock; returns the lock name
    ///
    /// The lock then lives until its TTL runs out, the coordinator unlocks it
    /// by name, or the session ends.
    pub fn detach(mut self) -> String {
        self.released = true;
        std::mem::take(&mut self.name)
    }
}

impl<G: StoreGateway> fmt::Debug for LockHandle<'_, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("name", &self.name)
            .field("released", &self.released)
            .finish()
    }
}

impl<G: StoreGateway> Drop for LockHandle<'_, G> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.coordinator.unlock(&self.name) {
            tracing::warn!("Releasing dropped lock \"{}\" failed: {}", self.name, err);
        }
    }
}
