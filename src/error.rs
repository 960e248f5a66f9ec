//! Crate-wide error type.

use std::io;

use thiserror::Error;

use crate::htm::MAX_LEVEL;

/// Errors produced by catalog loading, indexing and queries.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied value is out of its domain (bad radius, malformed
    /// polygon, entry size smaller than a position record, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Subdivision level outside `0..=MAX_LEVEL`.
    #[error("subdivision level {0} out of range 0..={MAX_LEVEL}")]
    Level(u32),

    /// The tree index file contradicts itself or the data file.
    #[error("corrupt tree index: {0}")]
    CorruptIndex(String),

    /// Underlying file or mapping failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
