// SPDX-License-Identifier: MIT
//! Typed errors for component boundaries.
//!
//! Leaf modules return one of these instead of `anyhow::Error` so callers can
//! match on a specific kind (spec.md §7's error taxonomy); orchestration code
//! in `main.rs` and background-task bodies composes them with `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("row not found")]
    NotFound,
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
}

#[derive(Debug, Error)]
pub enum TailError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line exceeded {limit} bytes without a newline; truncated")]
    LineTooLong { limit: usize },
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to register watch on {path}: {source}")]
    Register {
        path: String,
        #[source]
        source: notify::Error,
    },
    #[error("no configured path could be watched")]
    AllPathsFailed,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid message id: {0}")]
    InvalidMessageId(String),
    #[error("mta binary not found at {0}")]
    BinaryMissing(String),
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("mta exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("io error spawning mta binary: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("another operation is already in flight for this message id")]
    AlreadyInFlight,
    #[error("bulk operation requested {actual} ids, exceeding the configured cap of {limit}")]
    BulkTooLarge { actual: usize, limit: usize },
}
