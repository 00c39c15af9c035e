#![forbid(unsafe_code)]
//! Error types for e2c.
//!
//! # Error Taxonomy
//!
//! e2c uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `e2c-types` | Byte-level format violations detected while decoding records |
//! | Runtime | `E2cError` | `e2c-error` (this crate) | Caller-facing errors returned by path resolution |
//!
//! ## Mapping Policy: ParseError → E2cError
//!
//! `e2c-error` does not depend on `e2c-types`. The conversion lives in
//! `e2c-core`, which depends on both crates.
//!
//! | ParseError Variant | E2cError Variant |
//! |--------------------|------------------|
//! | `InsufficientData` | `OutOfBounds { offset, needed, available }` |
//! | `InvalidMagic` | `InvalidFilesystem(detail)` |
//! | `InvalidField` | `InvalidFilesystem(detail)` |
//! | `IntegerConversion` | `InvalidFilesystem(detail)` |
//! | `InvalidArgument` | `InvalidArgument(detail)` |
//!
//! ## errno Mapping
//!
//! Every `E2cError` variant maps to exactly one POSIX errno via
//! [`E2cError::to_errno`], so a CLI wrapper can exit the way `cat` would.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `OutOfBounds` | `EIO` |
//! | `InvalidFilesystem` | `EIO` |
//! | `InvalidArgument` | `EINVAL` |
//! | `InvalidPath` | `EINVAL` |
//! | `NotFound` | `ENOENT` |
//! | `DepthExceeded` | `ENAMETOOLONG` |
//!
//! `NotFound` is the only non-exceptional negative outcome. Callers should
//! check [`E2cError::is_not_found`] and print an ordinary "no such file"
//! message for it, and an internal-error message for everything else.

use thiserror::Error;

/// Unified error type for path resolution against an ext2 image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum E2cError {
    /// A computed byte range falls outside the image buffer.
    #[error("out of bounds: need {needed} bytes at offset {offset}, {available} available")]
    OutOfBounds {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A structural invariant of the image is violated: corrupt `rec_len`
    /// chain, zero data-block pointer, overflowing block-size shift, or a
    /// non-directory inode where a directory was expected.
    #[error("invalid filesystem: {0}")]
    InvalidFilesystem(String),

    /// A caller-supplied identifier is outside its valid domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The path string is malformed (no leading slash, empty component).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Well-formed input, valid structure, but the named entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The path has more components than the configured limit allows.
    #[error("path depth {depth} exceeds configured limit {limit}")]
    DepthExceeded { depth: usize, limit: usize },
}

impl E2cError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive, so adding a variant is a compile error
    /// until its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::OutOfBounds { .. } | Self::InvalidFilesystem(_) => libc::EIO,
            Self::InvalidArgument(_) | Self::InvalidPath(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::DepthExceeded { .. } => libc::ENAMETOOLONG,
        }
    }

    /// Whether this is the ordinary "no such file" outcome.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias using `E2cError`.
pub type Result<T> = std::result::Result<T, E2cError>;
