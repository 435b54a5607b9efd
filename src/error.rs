//! Error and soft-outcome types.
//!
//! Most "failure" conditions in this crate are not exceptional: a cache
//! rejecting an insert over its size limit, or a retry entry folding into
//! an existing one, are expected outcomes a caller branches on. Those are
//! modeled as plain enums, not `Result::Err`, following the store crate's
//! `TaskFailureOutcome` convention. `thiserror` is reserved for the one
//! genuine external-resource failure this crate can produce: the
//! performance cache manager's background thread failing to spawn.

use thiserror::Error;

/// Outcome of [`crate::cache::tdc::TimedDataCache::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The entry was stored (or refreshed, if already present).
    Stored,
    /// Rejected: the cache is at its configured maximum size.
    Rejected,
}

/// Outcome of queuing a retry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Entry accepted; retry waiters should be woken.
    Queued,
    /// Entry folded into an existing retry for the same order (no wakeup needed).
    NotQueued,
}

/// Errors produced by the performance cache manager.
#[derive(Debug, Error)]
pub enum PerfError {
    #[error("could not start performance cache manager thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}
