//! Error types for Tether.
//!
//! Every fallible operation in the core returns [`Result`]. Variants fall
//! into three families: format errors (a broken stream that must be torn
//! down), connection errors (retried by the dial loop only) and resource
//! errors (file-system failures, never retried).

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// A specialized `Result` type for Tether operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Tether.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame or Description line (E001)
    #[error("malformed stream: {0}")]
    Format(String),

    /// Frame payload does not fit the 15-bit length field (E002)
    #[error("frame payload of {0} bytes exceeds the header length field")]
    PayloadTooLarge(usize),

    /// Connection lost during transfer (E003)
    #[error("connection lost during transfer to {0}")]
    ConnectionLost(SocketAddr),

    /// Content hash of a received payload differs from the declared one (E004)
    #[error("checksum mismatch for '{name}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Declared payload name
        name: String,
        /// Checksum carried by the Description
        expected: String,
        /// Checksum of the received content
        actual: String,
    },

    /// Payload kind does not match its Description (E005)
    #[error("unsupported payload: {0}")]
    UnsupportedPayload(String),

    /// The connection manager is not running
    #[error("connection manager is not running")]
    NotRunning,

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::Format(_) => Some("E001"),
            Self::PayloadTooLarge(_) => Some("E002"),
            Self::ConnectionLost(_) => Some("E003"),
            Self::ChecksumMismatch { .. } => Some("E004"),
            Self::UnsupportedPayload(_) => Some("E005"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (can be retried).
    ///
    /// Only connection-level failures qualify; the dial loop is the one
    /// place that actually retries them.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::NotRunning)
    }
}
