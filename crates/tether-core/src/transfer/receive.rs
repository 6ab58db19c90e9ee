//! Inbound side of a transfer.
//!
//! A connection carries one or more transfers back to back:
//!
//! ```text
//! {"id":..,"kind":0,..}\n [frame] [frame] .. [frame, is_last] {"id":..}\n [frame] ..
//! ```
//!
//! [`InboundDecoder`] turns raw reads into completed [`Received`] payloads,
//! whatever the read boundaries are.

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::file::{Artifact, Reassembled, Reassembler};
use crate::protocol::{Description, FrameDecoder, MAX_DESCRIPTION_LINE};
use crate::transport::Transport;

/// A completed inbound transfer.
#[derive(Debug, Clone)]
pub struct Received {
    /// Description the sender announced
    pub description: Description,
    /// The reassembled payload
    pub artifact: Artifact,
}

#[derive(Debug)]
enum Phase {
    /// Collecting a Description line
    Line(Vec<u8>),
    /// Decoding the frames of a described transfer
    Frames {
        description: Description,
        decoder: FrameDecoder,
        received: u64,
    },
}

/// Per-connection decoder from raw reads to completed payloads.
#[derive(Debug)]
pub struct InboundDecoder {
    phase: Phase,
    reassembler: Reassembler,
    verify_checksum: bool,
}

impl InboundDecoder {
    /// Create a decoder that reassembles into `reassembler`.
    #[must_use]
    pub fn new(reassembler: Reassembler, verify_checksum: bool) -> Self {
        Self {
            phase: Phase::Line(Vec::new()),
            reassembler,
            verify_checksum,
        }
    }

    /// Whether the decoder sits between transfers with nothing buffered.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(&self.phase, Phase::Line(line) if line.is_empty())
    }

    /// Feed one raw read. Returns every transfer it completed.
    ///
    /// Transfers whose content does not match their declared checksum are
    /// dropped (and their file deleted) instead of being returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] for a malformed or oversized Description
    /// line, a frame whose kind differs from the Description, or more
    /// payload than the Description declared. Returns an I/O error from
    /// the reassembler. The connection should
    /// be dropped after an error.
    pub async fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Received>> {
        let mut pending = bytes.to_vec();
        let mut completed = Vec::new();

        loop {
            match &mut self.phase {
                Phase::Line(line) => {
                    let Some(newline) = pending.iter().position(|b| *b == b'\n') else {
                        line.extend_from_slice(&pending);
                        if line.len() > MAX_DESCRIPTION_LINE {
                            return Err(Error::Format(format!(
                                "description line exceeds {MAX_DESCRIPTION_LINE} bytes"
                            )));
                        }
                        return Ok(completed);
                    };

                    line.extend_from_slice(&pending[..newline]);
                    let text = std::str::from_utf8(line)
                        .map_err(|e| Error::Format(format!("description is not UTF-8: {e}")))?;
                    let description = Description::from_line(text)?;
                    tracing::debug!(
                        "Incoming '{}' ({}, {} bytes)",
                        description.name,
                        description.id,
                        description.size
                    );

                    let mut decoder = FrameDecoder::new();
                    decoder.push(&pending[newline + 1..]);
                    pending.clear();
                    self.phase = Phase::Frames {
                        description,
                        decoder,
                        received: 0,
                    };
                }
                Phase::Frames {
                    description,
                    decoder,
                    received,
                } => {
                    if !pending.is_empty() {
                        decoder.push(&pending);
                        pending.clear();
                    }

                    let Some(frame) = decoder.next_frame() else {
                        return Ok(completed);
                    };

                    if frame.kind != description.kind.as_byte() {
                        return Err(Error::Format(format!(
                            "frame kind {} in a kind {} transfer",
                            frame.kind,
                            description.kind.as_byte()
                        )));
                    }
                    *received += frame.payload.len() as u64;
                    if *received > description.size {
                        return Err(Error::Format(format!(
                            "'{}' declared {} bytes but more arrived",
                            description.name, description.size
                        )));
                    }
                    let Some(done) = self.reassembler.merge(frame, description).await? else {
                        continue;
                    };

                    let description = description.clone();
                    pending = decoder.take_remaining();
                    self.phase = Phase::Line(Vec::new());

                    if let Some(received) = self.accept(description, done).await {
                        completed.push(received);
                    }
                }
            }
        }
    }

    /// Drop any half-received transfer. Its temp file stays on disk.
    pub fn abandon(&mut self) {
        self.reassembler.abandon();
        self.phase = Phase::Line(Vec::new());
    }

    async fn accept(&self, description: Description, done: Reassembled) -> Option<Received> {
        if done.size != description.size {
            tracing::warn!(
                "'{}' declared {} bytes but {} arrived",
                description.name,
                description.size,
                done.size
            );
        }

        let verify = self.verify_checksum && !description.checksum.is_empty();
        if verify && !description.checksum.eq_ignore_ascii_case(&done.checksum) {
            let err = Error::ChecksumMismatch {
                name: description.name.clone(),
                expected: description.checksum.clone(),
                actual: done.checksum,
            };
            tracing::warn!(
                "Rejected transfer {} [{}]: {}",
                description.id,
                err.code().unwrap_or_default(),
                err
            );

            if let Artifact::File(path) = &done.artifact {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    tracing::warn!("Failed to remove rejected file {}: {}", path.display(), e);
                }
            }
            return None;
        }

        Some(Received {
            description,
            artifact: done.artifact,
        })
    }
}

/// Receive transfers from one connection until it closes or `cancel` fires.
///
/// Each completed transfer is published on `updates`. The transport is
/// closed on return. Returns the number of transfers published.
///
/// # Errors
///
/// Returns an error if the stream is malformed, a read or write fails, or
/// the peer hangs up in the middle of a transfer.
pub async fn receive_connection(
    transport: Transport,
    mut decoder: InboundDecoder,
    updates: &broadcast::Sender<Received>,
    cancel: &CancellationToken,
) -> Result<usize> {
    let result = pump(&transport, &mut decoder, updates, cancel).await;
    if result.is_err() {
        decoder.abandon();
    }
    transport.close().await;
    result
}

async fn pump(
    transport: &Transport,
    decoder: &mut InboundDecoder,
    updates: &broadcast::Sender<Received>,
    cancel: &CancellationToken,
) -> Result<usize> {
    let reads = transport.receive_bytes();
    tokio::pin!(reads);
    let mut published = 0;

    loop {
        let next = tokio::select! {
            next = reads.next() => next,
            () = cancel.cancelled() => return Ok(published),
        };
        let Some(read) = next else {
            break;
        };

        for received in decoder.feed(&read?).await? {
            tracing::info!(
                "Received '{}' ({} bytes) from {}",
                received.description.name,
                received.description.size,
                transport.peer_addr()
            );
            // No subscribers is not an error.
            let _ = updates.send(received);
            published += 1;
        }
    }

    if decoder.is_idle() {
        Ok(published)
    } else {
        Err(Error::ConnectionLost(transport.peer_addr()))
    }
}
