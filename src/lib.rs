//! # Sharedlock - named, TTL-bounded locks shared through a relational store
//!
//! Independent processes that only share access to one relational store can
//! serialize work on a named resource:
//! - a registry table of lock records arbitrates contention through its
//!   uniqueness constraint on the lock name
//! - the store's native session lock detects dead holders, since it vanishes
//!   when the holder's connection does
//! - every claim carries a TTL after which competitors may evict it
//! - registry statements survive a damaged table by repairing it once and retrying
//!
//! ```no_run
//! use std::path::Path;
//! use std::time::Duration;
//! use sharedlock::{CoordinatorOptions, LockCoordinator, SqliteGateway};
//!
//! # fn main() -> sharedlock::Result<()> {
//! let gateway = SqliteGateway::open(Path::new("locks.db"))?;
//! let locks = LockCoordinator::new(gateway, CoordinatorOptions::default())?;
//! locks.ensure_table()?;
//!
//! let handle = locks.lock("nightly-import", Duration::from_secs(5), 60)?;
//! handle.assert_ttl(10)?;
//! handle.release()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod handle;
pub mod registry;
pub mod store;

use std::time::Duration;

// Re-exports for convenient access
pub use config::SharedLockConfig;
pub use coordinator::{CoordinatorOptions, LockCoordinator};
pub use handle::LockHandle;
pub use registry::{LockRecord, LockRegistry, QuoteStyle};
pub use store::{SessionId, SqliteGateway, StoreError, StoreGateway};

/// Result type alias for lock operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for lock operations
///
/// The public coordinator operations only ever return `Acquire`, `Timeout`,
/// `Release`, `RemainingTtl` or `TableRepair`; store failures reach callers as
/// the `source` of one of these.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Acquiring lock \"{name}\" failed: {reason}")]
    Acquire {
        name: String,
        reason: String,
        #[source]
        source: Option<Box<Error>>,
    },

    #[error("Acquiring lock \"{name}\" timed out after {} seconds", .timeout.as_secs_f64())]
    Timeout { name: String, timeout: Duration },

    #[error("Releasing lock \"{name}\" failed: {reason}")]
    Release {
        name: String,
        reason: String,
        #[source]
        source: Option<Box<Error>>,
    },

    #[error("Lock \"{name}\" is not to live for {min_remaining} seconds anymore")]
    RemainingTtl {
        name: String,
        min_remaining: u64,
        #[source]
        source: Option<Box<Error>>,
    },

    #[error(
        "Table {table} seems to be corrupted. Repair failed with status \"{}\" ({})",
        .status.as_deref().unwrap_or(""),
        .messages.join(", ")
    )]
    TableRepair {
        table: String,
        status: Option<String>,
        messages: Vec<String>,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Name of the lock the error is about, if any
    pub fn lock_name(&self) -> Option<&str> {
        match self {
            Error::Acquire { name, .. }
            | Error::Timeout { name, .. }
            | Error::Release { name, .. }
            | Error::RemainingTtl { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Acquisition failure of any kind; a timeout is one
    pub fn is_acquire(&self) -> bool {
        matches!(self, Error::Acquire { .. } | Error::Timeout { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub(crate) fn acquire(name: &str, reason: impl Into<String>) -> Self {
        Error::Acquire {
            name: name.to_string(),
            reason: reason.into(),
            source: None,
        }
    }

    /// Re-wrap a failure that happened while acquiring `name`
    pub(crate) fn into_acquire(self, name: &str) -> Self {
        match self {
            Error::Acquire { .. } | Error::Timeout { .. } => self,
            other => Error::Acquire {
                name: name.to_string(),
                reason: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Re-wrap a failure that happened while releasing `name`
    pub(crate) fn into_release(self, name: &str) -> Self {
        match self {
            Error::Release { .. } => self,
            other => Error::Release {
                name: name.to_string(),
                reason: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Re-wrap a failure that happened while asserting the remaining TTL of `name`
    pub(crate) fn into_remaining_ttl(self, name: &str, min_remaining: u64) -> Self {
        match self {
            Error::RemainingTtl { .. } => self,
            other => Error::RemainingTtl {
                name: name.to_string(),
                min_remaining,
                source: Some(Box::new(other)),
            },
        }
    }
}
