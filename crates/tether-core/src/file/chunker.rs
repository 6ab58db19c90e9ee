//! Slicing payloads into frames.

use std::path::Path;

use tokio::io::AsyncReadExt;

use super::{check_max_payload, open_existing};
use crate::error::{Error, Result};
use crate::protocol::Frame;

/// Slice an in-memory buffer into frames of at most `max_payload` bytes.
///
/// The final frame carries `is_last`. An empty buffer yields exactly one
/// empty terminal frame.
///
/// # Errors
///
/// Returns an error if `max_payload` is zero or exceeds the header's
/// length field.
pub fn slice_bytes(
    data: &[u8],
    kind: u8,
    max_payload: usize,
) -> Result<impl Iterator<Item = Frame> + '_> {
    check_max_payload(max_payload)?;

    let total = data.len().div_ceil(max_payload).max(1);
    Ok((0..total).map(move |i| {
        let start = i * max_payload;
        let end = (start + max_payload).min(data.len());
        Frame::new(kind, data[start..end].to_vec(), i + 1 == total)
    }))
}

enum Source {
    Bytes {
        data: Vec<u8>,
        offset: usize,
    },
    File {
        file: tokio::fs::File,
        length: u64,
        read: u64,
        buffer: Vec<u8>,
    },
}

/// Single-pass frame producer over a byte buffer or an open file.
///
/// Files are read sequentially into one reused buffer; only the bytes
/// actually read go into each frame.
pub struct Chunker {
    kind: u8,
    max_payload: usize,
    source: Source,
    finished: bool,
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("kind", &self.kind)
            .field("max_payload", &self.max_payload)
            .field("total_bytes", &self.total_bytes())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Chunker {
    /// Create a chunker over an owned byte buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_payload` is out of range.
    pub fn from_bytes(data: Vec<u8>, kind: u8, max_payload: usize) -> Result<Self> {
        check_max_payload(max_payload)?;
        Ok(Self {
            kind,
            max_payload,
            source: Source::Bytes { data, offset: 0 },
            finished: false,
        })
    }

    /// Open a file and create a chunker over it.
    ///
    /// The file length is captured now; bytes appended later are not sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or `max_payload` is
    /// out of range.
    pub async fn open_file(path: &Path, kind: u8, max_payload: usize) -> Result<Self> {
        check_max_payload(max_payload)?;
        let file = open_existing(path).await?;
        let length = file.metadata().await?.len();
        Ok(Self {
            kind,
            max_payload,
            source: Source::File {
                file,
                length,
                read: 0,
                buffer: vec![0u8; max_payload],
            },
            finished: false,
        })
    }

    /// Total number of payload bytes this chunker will produce.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        match &self.source {
            Source::Bytes { data, .. } => data.len() as u64,
            Source::File { length, .. } => *length,
        }
    }

    /// Produce the next frame, or `None` once the terminal frame was returned.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the file fails or the file shrank while
    /// it was being read.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.finished {
            return Ok(None);
        }

        let (payload, is_last) = match &mut self.source {
            Source::Bytes { data, offset } => {
                let end = (*offset + self.max_payload).min(data.len());
                let payload = data[*offset..end].to_vec();
                *offset = end;
                (payload, end == data.len())
            }
            Source::File {
                file,
                length,
                read,
                buffer,
            } => {
                let remaining = *length - *read;
                if remaining == 0 {
                    (Vec::new(), true)
                } else {
                    let want = buffer.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let n = file.read(&mut buffer[..want]).await?;
                    if n == 0 {
                        return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            format!("file ended after {read} of {length} bytes"),
                        )));
                    }
                    *read += n as u64;
                    (buffer[..n].to_vec(), *read >= *length)
                }
            }
        };

        self.finished = is_last;
        Ok(Some(Frame::new(self.kind, payload, is_last)))
    }
}
