//! Custom error types for the raw-tier builder.
//!
//! This module defines the primary error type, `RawError`, shared by every stage of a
//! conversion run. Using the `thiserror` crate, it provides one consistent vocabulary for
//! the failures that can occur, from a missing input file to a corrupt record deep inside
//! a multi-gigabyte stream.
//!
//! ## Error Hierarchy
//!
//! `RawError` groups its variants by when they can happen:
//!
//! - **Pre-flight** (`InputNotFound`, `UnknownFormat`, `Configuration`, `OutputExists`):
//!   raised before any output is touched. The caller fixes the request and retries.
//! - **Stream structure** (`Format`, `TruncatedInput`): raised by a streamer when the
//!   header or a record boundary cannot be trusted. Fatal to the run, but batches that
//!   were already flushed stay valid.
//! - **Record content** (`MalformedRecord`): a record whose boundary is known but whose
//!   contents are invalid. Skipped and counted unless strict mode is on.
//! - **Collaborators** (`Io`, `Json`, `Storage`, `Config`, `FeatureNotEnabled`): wrapped
//!   errors from the filesystem, serde, the columnar stores and figment.
//!
//! By using `#[from]`, `RawError` can be created from the underlying error types with the
//! `?` operator.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type RawResult<T> = std::result::Result<T, RawError>;

/// Errors produced while converting a DAQ stream.
#[derive(Error, Debug)]
pub enum RawError {
    /// The input source does not exist or cannot be read.
    #[error("Input not found: {}", .0.display())]
    InputNotFound(PathBuf),

    /// No streamer could be resolved for the input.
    #[error("Unknown input format: {0}")]
    UnknownFormat(String),

    /// The stream header or record structure is invalid.
    #[error("Format error: {0}")]
    Format(String),

    /// The input ended before a header or record was complete.
    #[error("Truncated input at byte {offset}: needed {needed} bytes, only {available} available")]
    TruncatedInput {
        /// Byte offset where the incomplete unit starts.
        offset: u64,
        /// Bytes the unit declares.
        needed: u64,
        /// Bytes that were actually available.
        available: u64,
    },

    /// The routing specification or run options are inconsistent.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A destination already exists and overwriting was not permitted.
    #[error("Output {} exists. Enable overwrite to proceed", .0.display())]
    OutputExists(PathBuf),

    /// A record could be delimited but its contents are invalid.
    #[error("Malformed record at byte {offset}: {reason}")]
    MalformedRecord {
        /// Byte offset of the record header.
        offset: u64,
        /// Why the record was rejected.
        reason: String,
    },

    /// Filesystem or input stream failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Routing spec or header JSON could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The columnar store rejected a write.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Figment failed to load or extract the configuration.
    #[error("Configuration loading error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A store was requested whose cargo feature is disabled.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for RawError {
    fn from(value: figment::Error) -> Self {
        RawError::Config(Box::new(value))
    }
}

#[cfg(feature = "storage_arrow")]
impl From<arrow::error::ArrowError> for RawError {
    fn from(value: arrow::error::ArrowError) -> Self {
        RawError::Storage(value.to_string())
    }
}

#[cfg(feature = "storage_csv")]
impl From<csv::Error> for RawError {
    fn from(value: csv::Error) -> Self {
        RawError::Storage(value.to_string())
    }
}

impl RawError {
    /// Whether the error was raised before any output could have been modified.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            RawError::InputNotFound(_)
                | RawError::UnknownFormat(_)
                | RawError::Configuration(_)
                | RawError::OutputExists(_)
        )
    }

    /// Whether the error concerns a single record and may be skipped.
    pub fn is_record_local(&self) -> bool {
        matches!(self, RawError::MalformedRecord { .. })
    }
}
