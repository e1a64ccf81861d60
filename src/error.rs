//! Error taxonomy for the storage engine.
//!
//! Every fallible operation in `calico` returns [`Result<T>`], backed by a single
//! [`Error`] enum. The kinds mirror §7 of the design: `NotFound` and `InvalidArgument`
//! are routine and returned unchanged to callers; `Corruption` and `Io` latch the
//! engine into a failed state (see [`crate::engine::Engine`]); `Busy` is consumed
//! internally by the pager's retry loop and should never escape to a public caller.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Taxonomy of failure kinds the engine can report.
///
/// This is a taxonomy, not a set of unrelated error types: every variant here is a
/// `calico::Error`, so callers match on `Error` directly rather than threading
/// several result types through the public API.
#[derive(Debug, Error)]
pub enum Error {
    /// The key or entity does not exist. Retriable and non-fatal.
    #[error("not found")]
    NotFound,

    /// The caller violated a precondition (empty key, oversized key, bad option).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// API misuse: commit on a non-current transaction, write through a read-only
    /// view, or any operation attempted while the engine is latched into an error
    /// state.
    #[error("logic error: {0}")]
    LogicError(String),

    /// A checksum or structural invariant was violated while parsing on-disk state.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The underlying `Env` reported a system failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// No frame was available in the pager's cache; the caller (always internal)
    /// retries after flushing the WAL. Never surfaced to a public caller.
    #[error("busy: no frame available")]
    Busy,
}

impl Error {
    /// True for the kinds that latch the engine into a failed state once observed
    /// during a mutation (§7): corruption and I/O failures.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corruption(_) | Error::Io(_))
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Error {
        Error::InvalidArgument(msg.into())
    }

    pub fn logic(msg: impl Into<String>) -> Error {
        Error::LogicError(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Error {
        Error::Corruption(msg.into())
    }
}
