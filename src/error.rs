//! Error types for modemlink.

use std::fmt;

use thiserror::Error;

use crate::fs::Operation;
use crate::obex::{Opcode, ResponseCode};

/// Category of a rejected AT command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtErrorKind {
    /// Plain `ERROR` terminal token.
    Error,
    /// `+CME ERROR: <detail>` (equipment error).
    Cme,
    /// `+CMS ERROR: <detail>` (message service error).
    Cms,
}

impl fmt::Display for AtErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtErrorKind::Error => f.write_str("ERROR"),
            AtErrorKind::Cme => f.write_str("+CME ERROR"),
            AtErrorKind::Cms => f.write_str("+CMS ERROR"),
        }
    }
}

/// Main error type for all modem operations.
#[derive(Debug, Error)]
pub enum ModemError {
    /// I/O error on the underlying link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No correlated response arrived within the wait budget.
    #[error("Protocol timeout: {0}")]
    ProtocolTimeout(String),

    /// The module answered an AT command with `ERROR`, `+CME ERROR` or `+CMS ERROR`.
    ///
    /// `code` is only populated when the session negotiated numeric error
    /// reporting; otherwise `message` carries the module's literal text.
    #[error("AT command rejected ({kind}): {message}")]
    CommandRejected {
        kind: AtErrorKind,
        code: Option<u16>,
        message: String,
    },

    /// The module answered an OBEX request with a non-success response code.
    #[error("OBEX {request} rejected with {code}")]
    ObexRejected { request: Opcode, code: ResponseCode },

    /// Malformed OBEX frame (length mismatch, unknown code or header).
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Operation attempted in the wrong link mode.
    #[error("Mode violation: {0}")]
    ModeViolation(String),

    /// Target exists, directory not empty, or not enough free space.
    #[error("Filesystem conflict: {0}")]
    FilesystemConflict(String),

    /// File or folder is not present in the current listing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A multi-part transfer was cancelled.
    #[error("{operation} interrupted after {bytes_transferred} bytes")]
    TransferInterrupted {
        operation: Operation,
        bytes_transferred: u64,
    },

    /// Caller supplied an argument the module cannot accept.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Folder-listing payload could not be decoded.
    #[error("Folder listing error: {0}")]
    Listing(String),

    /// Link closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias using ModemError.
pub type Result<T> = std::result::Result<T, ModemError>;
