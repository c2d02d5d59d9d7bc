#![forbid(unsafe_code)]
//! Error types for btrfs-spacecheck.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `bsc-types` | Malformed ioctl result buffers |
//! | Runtime | `CheckError` | `bsc-error` (this crate) | Failures that abort the whole run |
//!
//! Corruption is deliberately *not* an error. Findings about the extent tree
//! or the free space tree are values (`bsc-check::Finding`) that accumulate
//! into the run summary and drive exit status 3. A `CheckError` always means
//! the check itself could not be completed.
//!
//! ## Exit Status Mapping
//!
//! Every `CheckError` variant maps to exactly one [`ExitStatus`] via
//! [`CheckError::exit_status`]. The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | Exit status |
//! |---------|-------------|
//! | `Usage` | 2 |
//! | `NotBtrfs` | 2 |
//! | `Io` | 1 |
//! | `Query` | 1 |
//! | `Ioctl` | 1 |
//! | `Allocation` | 1 |
//! | `Parse` | 1 |
//! | `Unsupported` | 1 |
//! | `Cancelled` | 1 |
//!
//! ## Design Constraints
//!
//! - `bsc-error` MUST NOT depend on `bsc-types` or `bsc-ondisk`, so there is
//!   no `From<ParseError>`. A search result buffer that fails to decode is
//!   reported by `bsc-ioctl` as an `InvalidData` I/O error from the search
//!   primitive and therefore surfaces as `Query`. `Parse` is reserved for
//!   filesystem geometry the kernel reports but the checker cannot accept
//!   (an invalid sector size from `BTRFS_IOC_FS_INFO`).

use std::fmt;
use thiserror::Error;

/// Process exit status reported by the command-line tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExitStatus {
    /// No corruption detected.
    Clean,
    /// The check could not be completed (I/O failure, cancellation, ...).
    InternalError,
    /// Bad arguments, or the path is not on a Btrfs filesystem.
    UsageError,
    /// Corruption was detected (confirmed or suspected).
    CorruptionDetected,
}

impl ExitStatus {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Clean => 0,
            Self::InternalError => 1,
            Self::UsageError => 2,
            Self::CorruptionDetected => 3,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => write!(f, "clean"),
            Self::InternalError => write!(f, "internal_error"),
            Self::UsageError => write!(f, "usage_error"),
            Self::CorruptionDetected => write!(f, "corruption_detected"),
        }
    }
}

/// Unified error type for everything that can abort a check run.
#[derive(Debug, Error)]
pub enum CheckError {
    /// Invalid command-line arguments or configuration.
    #[error("usage error: {0}")]
    Usage(String),

    /// The path does not live on a Btrfs filesystem.
    #[error("not a Btrfs filesystem: {0}")]
    NotBtrfs(String),

    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The paged tree search primitive failed.
    ///
    /// Distinct from normal end of iteration, which is not an error.
    #[error("tree search failed on tree {tree}: {source}")]
    Query {
        tree: u64,
        #[source]
        source: std::io::Error,
    },

    /// A filesystem control request (info, features, freeze, thaw, sync) failed.
    #[error("{op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The derived free extent buffer could not grow.
    #[error("cannot allocate free extent buffer of {entries} entries")]
    Allocation { entries: usize },

    /// Filesystem geometry reported by the kernel is unusable.
    #[error("malformed filesystem info: {0}")]
    Parse(String),

    /// The filesystem uses a layout this checker does not understand.
    #[error("unsupported filesystem layout: {0}")]
    Unsupported(String),

    /// A termination signal arrived and the scan was abandoned.
    #[error("check interrupted by signal")]
    Cancelled,
}

impl CheckError {
    /// Exit status the command-line tool reports for this error.
    #[must_use]
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Usage(_) | Self::NotBtrfs(_) => ExitStatus::UsageError,
            Self::Io(_)
            | Self::Query { .. }
            | Self::Ioctl { .. }
            | Self::Allocation { .. }
            | Self::Parse(_)
            | Self::Unsupported(_)
            | Self::Cancelled => ExitStatus::InternalError,
        }
    }

    /// Raw OS errno behind this error, if any.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(err) | Self::Query { source: err, .. } | Self::Ioctl { source: err, .. } => {
                err.raw_os_error()
            }
            _ => None,
        }
    }
}

/// Result alias using `CheckError`.
pub type Result<T> = std::result::Result<T, CheckError>;
