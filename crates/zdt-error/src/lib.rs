#![forbid(unsafe_code)]
//! Error types for the traversal workspace.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `zdt-types` | On-disk layout violations found while decoding bytes |
//! | Runtime | `ZdtError` | `zdt-error` (this crate) | Everything a walk can return to its caller |
//!
//! `zdt-error` does not depend on `zdt-types`. Parse failures are wrapped
//! as [`ZdtError::Corruption`] at the point where the block location is
//! known (the traversal engine), or as [`ZdtError::Parse`] otherwise.
//!
//! ## Sources of error during a walk
//!
//! - block reads: [`ZdtError::Io`] and [`ZdtError::Checksum`] come from the
//!   block reader, never from the engine itself;
//! - the visitor: [`ZdtError::Callback`] carries whatever errno the
//!   consumer chose, and is opaque to the engine;
//! - the prefetch task: [`ZdtError::Interrupted`] only ever circulates
//!   inside the prefetch task and is swallowed at its boundary.
//!
//! "Do not descend" is not an error. It is expressed through the visitor's
//! return value and never reaches this type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZdtError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The block was read but its contents fail checksum verification.
    #[error("checksum mismatch for block at {location}: {detail}")]
    Checksum { location: String, detail: String },

    /// The block was read and verified but its contents are structurally
    /// invalid (bad record counts, truncated headers, out-of-range fields).
    #[error("corrupt block at {location}: {detail}")]
    Corruption { location: String, detail: String },

    /// Parse-layer error surfaced without a block location.
    #[error("parse error: {0}")]
    Parse(String),

    /// Error reported by a traversal visitor.
    #[error("visitor error (errno {errno}): {detail}")]
    Callback { errno: libc::c_int, detail: String },

    /// The walk was interrupted by cancellation.
    #[error("operation interrupted")]
    Interrupted,

    /// The requested object or dataset does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid configuration or argument supplied by the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ZdtError {
    /// Map this error to a POSIX errno. Checksum and corruption failures
    /// surface as `EIO`.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Checksum { .. } | Self::Corruption { .. } => libc::EIO,
            Self::Parse(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::Callback { errno, .. } => *errno,
            Self::Interrupted => libc::EINTR,
            Self::NotFound(_) => libc::ENOENT,
        }
    }

    /// Convenience constructor for visitor-side failures.
    #[must_use]
    pub fn callback(errno: libc::c_int, detail: impl Into<String>) -> Self {
        Self::Callback {
            errno,
            detail: detail.into(),
        }
    }

    /// True for errors raised by the storage layer rather than by a
    /// visitor or by cancellation.
    #[must_use]
    pub fn is_media_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Checksum { .. } | Self::Corruption { .. }
        )
    }
}

/// Result alias using `ZdtError`.
pub type Result<T> = std::result::Result<T, ZdtError>;
