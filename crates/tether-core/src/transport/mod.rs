//! One raw TCP connection.
//!
//! A [`Transport`] knows nothing about frames. It writes byte buffers and
//! exposes inbound data as a stream of raw reads whose boundaries are
//! whatever the socket delivered.
//!
//! Closing a transport cancels in-flight reads and writes, so `close` may
//! race an active `receive_bytes` stream safely.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Configure TCP keep-alive on a socket.
///
/// Idle pooled connections can sit for a long time before a sender takes
/// them; keep-alive lets the OS notice a vanished peer.
///
/// Configuration:
/// - Start probing after 10 seconds of idle time
/// - Send probes every 5 seconds
fn configure_socket(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(io::Error::other(e)))?;
    stream.set_nodelay(true)?;

    Ok(())
}

/// A connected, bidirectional byte transport.
#[derive(Debug)]
pub struct Transport {
    id: u64,
    peer: SocketAddr,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    read_buffer_size: usize,
}

impl Transport {
    /// Wrap an established TCP stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer address cannot be read or the socket
    /// cannot be configured.
    pub fn new(stream: TcpStream, read_buffer_size: usize) -> Result<Self> {
        let peer = stream.peer_addr()?;
        configure_socket(&stream)?;

        let (reader, writer) = stream.into_split();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Transport #{} established with {}", id, peer);

        Ok(Self {
            id,
            peer,
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(writer),
            connected: Arc::new(AtomicBool::new(true)),
            cancel: CancellationToken::new(),
            read_buffer_size: read_buffer_size.max(1),
        })
    }

    /// Dial `addr` and wrap the resulting stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(addr: SocketAddr, read_buffer_size: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream, read_buffer_size)
    }

    /// Process-unique id, used in logs.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address of the connection.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn is_open(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    /// Whether the connection is still usable.
    ///
    /// Returns `false` after `close`, after the peer hung up, or after a
    /// failed write. While the read half is idle (not handed to a receive
    /// stream) the socket is probed without blocking, so a pooled
    /// connection whose peer went away is noticed before it is used. A
    /// peer that wrote to an idle connection breaks the one-way protocol,
    /// so the probe marks the connection disconnected.
    pub fn is_connected(&self) -> bool {
        if !self.is_open() {
            return false;
        }

        let Ok(guard) = self.reader.try_lock() else {
            return true;
        };
        let Some(reader) = guard.as_ref() else {
            return true;
        };

        let mut probe = [0u8; 1];
        match reader.try_read(&mut probe) {
            Ok(0) => {
                tracing::debug!("Transport #{}: peer {} hung up", self.id, self.peer);
                self.connected.store(false, Ordering::Release);
                false
            }
            Ok(_) => {
                tracing::warn!(
                    "Transport #{}: unexpected data from {}, dropping connection",
                    self.id,
                    self.peer
                );
                self.connected.store(false, Ordering::Release);
                false
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(e) => {
                tracing::debug!("Transport #{}: probe failed: {}", self.id, e);
                self.connected.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Write and flush `bytes`.
    ///
    /// Returns `false` without writing if the transport is not connected,
    /// and `false` if the write fails or the transport is closed meanwhile.
    pub async fn send_bytes(&self, bytes: &[u8]) -> bool {
        if !self.is_open() {
            tracing::debug!("Transport #{}: send skipped, not connected", self.id);
            return false;
        }

        let mut writer = self.writer.lock().await;
        let result = tokio::select! {
            r = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => r,
            () = self.cancel.cancelled() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "transport closed",
            )),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Transport #{}: write to {} failed: {}", self.id, self.peer, e);
                self.connected.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Stream of raw reads, each at most the configured buffer size.
    ///
    /// The stream ends when the peer closes or the transport is closed, and
    /// yields a final `Err` on a read error. Only one receive stream exists
    /// per transport; later calls return an empty stream.
    pub fn receive_bytes(&self) -> impl Stream<Item = io::Result<Vec<u8>>> + Send + 'static {
        let reader = if self.is_open() {
            self.reader.lock().ok().and_then(|mut guard| guard.take())
        } else {
            None
        };
        if reader.is_none() {
            tracing::debug!("Transport #{}: no readable half, empty stream", self.id);
        }

        let id = self.id;
        let size = self.read_buffer_size;
        let cancel = self.cancel.clone();
        let connected = Arc::clone(&self.connected);

        async_stream::stream! {
            if let Some(mut reader) = reader {
                loop {
                    let mut buffer = vec![0u8; size];
                    let read = tokio::select! {
                        r = reader.read(&mut buffer) => r,
                        () = cancel.cancelled() => {
                            tracing::debug!("Transport #{}: receive cancelled", id);
                            break;
                        }
                    };
                    match read {
                        Ok(0) => {
                            tracing::debug!("Transport #{}: peer closed", id);
                            connected.store(false, Ordering::Release);
                            break;
                        }
                        Ok(n) => {
                            buffer.truncate(n);
                            yield Ok(buffer);
                        }
                        Err(e) => {
                            connected.store(false, Ordering::Release);
                            yield Err(e);
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Close the connection. Safe to call more than once and concurrently
    /// with an active read.
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.connected.store(false, Ordering::Release);

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Transport #{}: shutdown: {}", self.id, e);
        }
        tracing::debug!("Transport #{} to {} closed", self.id, self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::net::TcpListener;

    async fn pair(buffer_size: usize) -> (Transport, Transport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(
            Transport::connect(addr, buffer_size),
            listener.accept()
        );
        let (stream, _) = accepted.unwrap();
        (client.unwrap(), Transport::new(stream, buffer_size).unwrap())
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (client, server) = pair(16).await;
        let payload: Vec<u8> = (0..100u8).collect();

        assert!(client.send_bytes(&payload).await);
        client.close().await;

        let reads: Vec<Vec<u8>> = server
            .receive_bytes()
            .map(|r| r.expect("read"))
            .collect()
            .await;

        assert!(reads.iter().all(|r| !r.is_empty() && r.len() <= 16));
        assert_eq!(reads.concat(), payload);
    }

    #[tokio::test]
    async fn test_close_ends_pending_receive() {
        let (client, server) = pair(1024).await;
        let server = Arc::new(server);

        let reader = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.receive_bytes().count().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.close().await;

        let count = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("receive should end after close")
            .unwrap();
        assert_eq!(count, 0);
        drop(client);
    }

    #[tokio::test]
    async fn test_send_after_close_fails_fast() {
        let (client, _server) = pair(1024).await;
        client.close().await;
        client.close().await;

        assert!(!client.is_connected());
        assert!(!client.send_bytes(b"late").await);
    }

    #[tokio::test]
    async fn test_detects_peer_hangup() {
        let (client, server) = pair(1024).await;
        assert!(client.is_connected());

        server.close().await;
        drop(server);

        let mut connected = true;
        for _ in 0..50 {
            connected = client.is_connected();
            if !connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!connected);
    }

    #[tokio::test]
    async fn test_unexpected_inbound_data_disconnects() {
        let (client, server) = pair(1024).await;
        assert!(server.send_bytes(b"?").await);

        let mut connected = true;
        for _ in 0..50 {
            connected = client.is_connected();
            if !connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!connected);
        assert!(!client.send_bytes(b"late").await);
    }

    #[tokio::test]
    async fn test_single_receive_stream() {
        let (client, server) = pair(1024).await;
        let first = server.receive_bytes();
        let second_count = server.receive_bytes().count().await;
        assert_eq!(second_count, 0);
        drop(first);
        drop(client);
    }

    #[tokio::test]
    async fn test_connection_ids_are_unique() {
        let (client, server) = pair(1024).await;
        assert_ne!(client.id(), server.id());
        assert!(server.peer_addr().ip().is_loopback());
    }
}
