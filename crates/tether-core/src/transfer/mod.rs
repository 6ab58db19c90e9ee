//! Moving one payload across one connection.
//!
//! A transfer is a Description line followed by the payload's frames. The
//! sending side is driven by [`send_transfer`], which publishes progress as
//! [`TransferInfo`] snapshots; the receiving side runs [`receive_connection`]
//! per inbound connection and yields [`Received`] artifacts.

pub mod receive;
pub mod send;

pub use receive::{receive_connection, InboundDecoder, Received};
pub use send::send_transfer;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::file::{file_sha256_hex, sha256_hex, Chunker, FALLBACK_NAME};
use crate::protocol::{Description, PayloadKind};

/// Name used in Descriptions of byte payloads.
pub const BYTES_NAME: &str = "bytes";

/// Something that can be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A file read from disk when the send starts
    File(PathBuf),
    /// An in-memory buffer
    Bytes(Vec<u8>),
}

impl Payload {
    /// Byte payload holding UTF-8 text.
    #[must_use]
    pub fn text(text: &str) -> Self {
        Self::Bytes(text.as_bytes().to_vec())
    }

    /// Kind declared for this payload in its Description.
    #[must_use]
    pub const fn kind(&self) -> PayloadKind {
        match self {
            Self::File(_) => PayloadKind::File,
            Self::Bytes(_) => PayloadKind::Bytes,
        }
    }

    /// Build a Description for this payload: fresh id, size, name and
    /// SHA-256 checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if a file payload cannot be read.
    pub async fn describe(&self, index: u32) -> Result<Description> {
        match self {
            Self::File(path) => {
                let size = file_len(path).await?;
                let checksum = file_sha256_hex(path).await?;
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(FALLBACK_NAME);
                Ok(Description::new(PayloadKind::File, size, index, name).with_checksum(checksum))
            }
            Self::Bytes(data) => Ok(Description::new(
                PayloadKind::Bytes,
                data.len() as u64,
                index,
                BYTES_NAME,
            )
            .with_checksum(sha256_hex(data))),
        }
    }

    /// Turn the payload into its frame producer.
    pub(crate) async fn into_chunker(self, max_payload: usize) -> Result<Chunker> {
        let kind = self.kind().as_byte();
        match self {
            Self::File(path) => Chunker::open_file(&path, kind, max_payload).await,
            Self::Bytes(data) => Chunker::from_bytes(data, kind, max_payload),
        }
    }

    /// Reject a Description that declares a different kind.
    pub(crate) fn check_matches(&self, description: &Description) -> Result<()> {
        if self.kind() == description.kind {
            return Ok(());
        }
        Err(Error::UnsupportedPayload(format!(
            "{:?} payload cannot be sent as {:?} ('{}')",
            self.kind(),
            description.kind,
            description.name
        )))
    }
}

async fn file_len(path: &Path) -> Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(Error::UnsupportedPayload(format!(
            "{} is not a regular file",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::FileNotFound(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Progress of one outbound transfer.
///
/// Only the send task mutates it; observers get snapshots through a
/// `tokio::sync::watch` channel.
#[derive(Debug, Clone, Serialize)]
pub struct TransferInfo {
    /// What is being sent
    pub description: Description,
    /// When the send was requested
    pub start_time: DateTime<Utc>,
    /// When the send finished, successfully or not
    pub end_time: Option<DateTime<Utc>>,
    /// Every frame was written and the connection released
    pub succeeded: bool,
    /// The transfer was aborted
    pub failed: bool,
    /// Payload bytes written so far
    pub bytes_transferred: u64,
    /// Payload bytes to write in total
    pub total_bytes: u64,
    /// Failure reason
    pub error: Option<String>,
}

impl TransferInfo {
    /// Fresh record for a transfer that is about to start.
    #[must_use]
    pub fn new(description: Description) -> Self {
        let total_bytes = description.size;
        Self {
            description,
            start_time: Utc::now(),
            end_time: None,
            succeeded: false,
            failed: false,
            bytes_transferred: 0,
            total_bytes,
            error: None,
        }
    }

    /// Whether the transfer reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.succeeded || self.failed
    }

    /// Progress as a percentage (0.0 - 100.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.succeeded {
                100.0
            } else {
                0.0
            }
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
        }
    }

    /// Time spent so far, or in total once finished.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).to_std().unwrap_or_default()
    }

    pub(crate) fn mark_succeeded(&mut self) {
        self.succeeded = true;
        self.end_time = Some(Utc::now());
    }

    pub(crate) fn mark_failed(&mut self, error: &Error) {
        self.failed = true;
        self.end_time = Some(Utc::now());
        self.error = Some(error.to_string());
    }
}
