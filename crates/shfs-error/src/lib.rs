#![forbid(unsafe_code)]
//! Error types for the SHFS tools.
//!
//! Defines `ShfsError` and a `Result<T>` alias used throughout the workspace.

use thiserror::Error;

/// Unified error type for all SHFS operations.
#[derive(Debug, Error)]
pub enum ShfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid or unsupported SHFS label on {device}: {source}")]
    Label {
        device: String,
        #[source]
        source: shfs_types::ParseError,
    },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("parse error: {0}")]
    Parse(#[from] shfs_types::ParseError),

    #[error("corrupt metadata at chunk {chunk}: {detail}")]
    Corruption { chunk: u64, detail: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("no space left on volume")]
    NoSpace,

    #[error("no such object: {0}")]
    NotFound(String),

    #[error("an object with hash {0} already exists")]
    Duplicate(String),

    #[error("target bucket of the hash table is full")]
    BucketFull,

    #[error("not a valid object hash: {0}")]
    BadHash(String),

    #[error("{0} is not a regular file")]
    NotRegularFile(String),

    #[error("chunk range [{start}, {start}+{count}) is already reserved")]
    AllocOverlap { start: u64, count: u64 },

    #[error("chunk range [{start}, {start}+{count}) is not fully reserved")]
    AllocNotReserved { start: u64, count: u64 },

    #[error("chunk range [{start}, {start}+{count}) exceeds the volume")]
    AllocOutOfRange { start: u64, count: u64 },
}

impl ShfsError {
    /// Whether this is a per-action user error (spec USER-ERROR): reported,
    /// counted, and the token sequence continues. Everything else either
    /// aborts the run (mount-fatal, cancellation) or marks the action failed
    /// with an I/O diagnosis.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::NoSpace
                | Self::NotFound(_)
                | Self::Duplicate(_)
                | Self::BucketFull
                | Self::BadHash(_)
                | Self::NotRegularFile(_)
        )
    }
}

/// Result alias using `ShfsError`.
pub type Result<T> = std::result::Result<T, ShfsError>;
