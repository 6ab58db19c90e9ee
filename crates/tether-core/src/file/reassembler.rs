//! Rebuilding payloads from ordered frames.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{received_file_name, to_hex};
use crate::error::Result;
use crate::protocol::{Description, Frame, KIND_FILE};

/// A completed, reassembled payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// File written to the downloads directory
    File(PathBuf),
    /// Byte buffer held in memory
    Bytes(Vec<u8>),
}

/// A reassembled payload together with what was measured while building it.
#[derive(Debug, Clone)]
pub struct Reassembled {
    /// The payload
    pub artifact: Artifact,
    /// Number of payload bytes received
    pub size: u64,
    /// Hex-encoded SHA-256 of the received content
    pub checksum: String,
}

#[derive(Debug)]
struct PartialFile {
    file: tokio::fs::File,
}

/// Reassembles one logical stream at a time.
///
/// Create one per receiving connection. Its temp file name is derived from
/// a key unique to the instance, so reassemblers on different connections
/// never write to the same temp file.
#[derive(Debug)]
pub struct Reassembler {
    download_dir: PathBuf,
    stream_key: Uuid,
    file: Option<PartialFile>,
    buffer: Vec<u8>,
    hasher: Sha256,
    received: u64,
}

impl Reassembler {
    /// Create a reassembler writing files into `download_dir`.
    #[must_use]
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            stream_key: Uuid::new_v4(),
            file: None,
            buffer: Vec::new(),
            hasher: Sha256::new(),
            received: 0,
        }
    }

    /// Path of the temp file used for in-flight file streams.
    #[must_use]
    pub fn temp_path(&self) -> PathBuf {
        self.download_dir.join(format!(".{}.part", self.stream_key))
    }

    /// Directory completed files are moved into.
    #[must_use]
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Whether a stream is currently in progress.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.file.is_some() || self.received > 0
    }

    /// Merge the next frame of the current stream.
    ///
    /// Returns the finished payload when `frame.is_last` is set. Frames
    /// with kind `0` stream to disk; all other kinds accumulate in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if writing or renaming the file fails. The stream
    /// is abandoned and its temp file is left in place.
    pub async fn merge(
        &mut self,
        frame: Frame,
        description: &Description,
    ) -> Result<Option<Reassembled>> {
        self.hasher.update(&frame.payload);
        self.received += frame.payload.len() as u64;

        if frame.kind == KIND_FILE {
            if let Err(e) = self.append_to_file(&frame.payload).await {
                self.abandon();
                return Err(e);
            }
            if !frame.is_last {
                return Ok(None);
            }
            match self.finish_file(description).await {
                Ok(done) => Ok(Some(done)),
                Err(e) => {
                    self.abandon();
                    Err(e)
                }
            }
        } else {
            self.buffer.extend_from_slice(&frame.payload);
            if !frame.is_last {
                return Ok(None);
            }
            if self.file.take().is_some() {
                tracing::debug!("Dropped temp file of a stream that ended in memory");
            }
            let bytes = std::mem::take(&mut self.buffer);
            Ok(Some(self.complete(Artifact::Bytes(bytes))))
        }
    }

    /// Drop the in-flight stream. Any temp file stays on disk.
    pub fn abandon(&mut self) {
        self.file = None;
        self.buffer.clear();
        self.hasher = Sha256::new();
        self.received = 0;
    }

    async fn append_to_file(&mut self, payload: &[u8]) -> Result<()> {
        if self.file.is_none() {
            tokio::fs::create_dir_all(&self.download_dir).await?;
            let path = self.temp_path();
            let file = tokio::fs::File::create(&path).await?;
            tracing::debug!("Opened temp file {}", path.display());
            self.file = Some(PartialFile { file });
        }

        if let Some(partial) = self.file.as_mut() {
            partial.file.write_all(payload).await?;
        }
        Ok(())
    }

    async fn finish_file(&mut self, description: &Description) -> Result<Reassembled> {
        if let Some(mut partial) = self.file.take() {
            partial.file.flush().await?;
            partial.file.sync_all().await?;
        }

        let final_path = self
            .download_dir
            .join(received_file_name(&description.id, &description.name));
        tokio::fs::rename(self.temp_path(), &final_path).await?;
        tracing::debug!("Completed file {}", final_path.display());

        Ok(self.complete(Artifact::File(final_path)))
    }

    fn complete(&mut self, artifact: Artifact) -> Reassembled {
        let hasher = std::mem::take(&mut self.hasher);
        let done = Reassembled {
            artifact,
            size: self.received,
            checksum: to_hex(&hasher.finalize()),
        };
        self.received = 0;
        done
    }
}
