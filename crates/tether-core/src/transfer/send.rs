//! Outbound side of a transfer.

use tokio::sync::watch;

use super::{Payload, TransferInfo};
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::file::Chunker;
use crate::protocol::{pack, Description};
use crate::transport::Transport;

/// Send `payload` on a pooled connection.
///
/// Waits for a connection, writes the Description line and then every
/// frame, updating `progress` after each write. The connection is closed
/// afterwards whether or not the transfer succeeded. Terminal state is left
/// to the caller.
///
/// # Errors
///
/// Returns an error if the payload cannot be read, the manager stops
/// before a connection is available, or a frame write fails.
pub async fn send_transfer(
    connections: &ConnectionManager,
    payload: Payload,
    description: &Description,
    max_payload: usize,
    progress: &watch::Sender<TransferInfo>,
) -> Result<()> {
    payload.check_matches(description)?;
    let mut chunker = payload.into_chunker(max_payload).await?;
    let total = chunker.total_bytes();
    progress.send_modify(|info| info.total_bytes = total);

    let transport = acquire(connections, description).await?;
    tracing::debug!(
        "Sending '{}' ({}) on transport #{}",
        description.name,
        description.id,
        transport.id()
    );

    let result = write_frames(&transport, &mut chunker, progress).await;
    transport.close().await;
    result
}

/// Take pooled connections until one accepts the Description line.
async fn acquire(connections: &ConnectionManager, description: &Description) -> Result<Transport> {
    let line = description.to_line()?;

    loop {
        let transport = connections.take_connection().await.ok_or(Error::NotRunning)?;

        if !transport.is_connected() {
            tracing::debug!("Discarding stale transport #{}", transport.id());
            transport.close().await;
            continue;
        }

        if transport.send_bytes(line.as_bytes()).await {
            return Ok(transport);
        }

        tracing::debug!(
            "Description write failed on transport #{}, trying another",
            transport.id()
        );
        transport.close().await;
    }
}

async fn write_frames(
    transport: &Transport,
    chunker: &mut Chunker,
    progress: &watch::Sender<TransferInfo>,
) -> Result<()> {
    while let Some(frame) = chunker.next_frame().await? {
        let packed = pack(&frame)?;
        if !transport.send_bytes(&packed).await {
            return Err(Error::ConnectionLost(transport.peer_addr()));
        }

        let written = frame.payload.len() as u64;
        progress.send_modify(|info| info.bytes_transferred += written);
    }
    Ok(())
}
