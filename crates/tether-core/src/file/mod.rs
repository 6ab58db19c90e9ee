//! Payload chunking and reassembly for Tether.
//!
//! This module handles:
//! - Slicing byte buffers and files into bounded frames
//! - Reassembling ordered frames into files or byte buffers
//! - Content checksums (SHA-256, hex encoded)
//! - Sanitizing declared names before they touch the file system
//!
//! ## Received File Naming
//!
//! Completed files are renamed to `REC_<transfer-uuid>_<name>` inside the
//! downloads directory. While a file is in flight it lives in a hidden temp
//! file whose name is unique to the receiving connection, so concurrent
//! receives never share a temp file.

pub mod chunker;
pub mod reassembler;

pub use chunker::{slice_bytes, Chunker};
pub use reassembler::{Artifact, Reassembled, Reassembler};

use std::fmt::Write as _;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};
use crate::protocol::MAX_PAYLOAD_LEN;

/// Prefix of every received file name
pub const RECEIVED_FILE_PREFIX: &str = "REC_";

/// Name used when a declared name has no usable file component
pub const FALLBACK_NAME: &str = "unnamed";

/// Check that a per-frame payload budget is usable.
pub(crate) fn check_max_payload(max_payload: usize) -> Result<()> {
    if max_payload == 0 || max_payload > MAX_PAYLOAD_LEN {
        return Err(Error::InvalidConfig {
            key: "max_payload".to_string(),
            reason: format!("must be between 1 and {MAX_PAYLOAD_LEN}, got {max_payload}"),
        });
    }
    Ok(())
}

/// Encode bytes as lowercase hex.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

/// Hex-encoded SHA-256 of a byte buffer.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

/// Hex-encoded SHA-256 of a file, read in fixed-size blocks.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn file_sha256_hex(path: &Path) -> Result<String> {
    let mut file = open_existing(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(to_hex(&hasher.finalize()))
}

/// Open a file for reading, mapping a missing file to [`Error::FileNotFound`].
pub(crate) async fn open_existing(path: &Path) -> Result<tokio::fs::File> {
    tokio::fs::File::open(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::FileNotFound(path.display().to_string())
        } else {
            Error::Io(e)
        }
    })
}

/// Reduce a declared name to a single safe file-name component.
///
/// Directory parts are dropped, so a peer cannot write outside the
/// downloads directory.
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    let candidate = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();

    let component = Path::new(candidate)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..");

    component.map_or_else(|| FALLBACK_NAME.to_string(), ToString::to_string)
}

/// Final file name for a received transfer.
#[must_use]
pub fn received_file_name(id: &uuid::Uuid, declared_name: &str) -> String {
    format!("{RECEIVED_FILE_PREFIX}{id}_{}", sanitize_name(declared_name))
}

/// Format a byte count for display.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
