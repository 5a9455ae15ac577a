//! Error handling helpers for the transport crate.
//!
//! The transport layer keeps its error surface small: positional field
//! mismatches when decoding messages and failures creating or attaching
//! shared segments. Bus-level call failures use [`crate::BusError`].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

/// Errors surfaced by low-level transport helpers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A positional read found a field of a different type.
    #[error("field {index}: expected {expected}, found {found}")]
    FieldType {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    /// A positional read ran past the last field.
    #[error("field {index}: expected {expected}, message has no more fields")]
    MissingField { index: usize, expected: &'static str },

    /// Creating a shared segment failed.
    #[error("failed to create shared segment {path:?} ({size} bytes): {source}")]
    SegmentCreate {
        path: PathBuf,
        size: usize,
        #[source]
        source: io::Error,
    },

    /// Attaching to an existing shared segment failed.
    #[error("failed to attach shared segment {path:?}: {source}")]
    SegmentAttach {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Segment names are single components inside the segment directory.
    #[error("invalid shared segment name {name:?}")]
    InvalidSegmentName { name: String },

    /// Segment sizes must be non-zero.
    #[error("shared segment {name} must not be empty")]
    EmptySegment { name: String },

    /// The bus notifier thread could not be started.
    #[error("failed to start bus notifier thread: {0}")]
    NotifierSpawn(#[source] io::Error),

    /// The delivery target stopped accepting messages.
    #[error("delivery target {0} is not running")]
    SinkClosed(String),
}
