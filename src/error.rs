//src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong while building, persisting or walking the
/// k-mer structures.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad magic, unsupported version, wrong file kind or a truncated body.
    #[error("{path}: {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("k-mer size mismatch: expected {expected}, found {found}")]
    KsizeMismatch { expected: u8, found: u8 },

    #[error("table dimension mismatch: {0}")]
    Dimension(String),

    #[error("invalid k-mer size {0}; must be between 1 and 32")]
    InvalidKsize(u8),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The table is too small for the number of distinct k-mers inserted.
    #[error("false positive rate {rate:.3} exceeds {max:.3}; increase the table size")]
    FalsePositiveRate { rate: f64, max: f64 },

    #[error("tagging is disabled and no tags are loaded; cannot partition")]
    TaggingDisabled,

    #[error("paired mode: record {name} has no mate")]
    UnpairedRead { name: String },

    #[error("{failed} of {total} records failed to parse, above the allowed rate {max}")]
    FailureRate { failed: u64, total: u64, max: f64 },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn format<P: Into<PathBuf>>(path: P, reason: impl Into<String>) -> Self {
        Error::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
