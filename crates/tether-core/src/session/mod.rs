//! Session management.
//!
//! A [`SessionManager`] owns one peer pairing: its [`ConnectionManager`],
//! the receive tasks for inbound connections and every in-flight send. All
//! of them run in one task scope; a failing task is logged and reported on
//! its own progress channel but never stops its siblings.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tether_core::session::SessionManager;
//! use tether_core::transfer::Payload;
//!
//! let session = SessionManager::new(Default::default());
//! session.setup(47100, 47100, Some("192.168.1.20".parse()?)).await?;
//!
//! let payload = Payload::text("hello");
//! let description = payload.describe(0).await?;
//! let mut progress = session.send(payload, description).await?;
//! progress.wait_for(|info| info.succeeded || info.failed).await?;
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::SessionConfig;
use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::error::{Error, Result};
use crate::file::Reassembler;
use crate::protocol::Description;
use crate::transfer::{
    receive_connection, send_transfer, InboundDecoder, Payload, Received, TransferInfo,
};
use crate::transport::Transport;

/// Capacity of the completed-transfer broadcast channel.
const UPDATE_CAPACITY: usize = 64;

/// How long `exit` waits for tasks to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Point-in-time view of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateSummary {
    /// Peer address being dialed, if known
    pub peer_address: Option<IpAddr>,
    /// Port dialed on the peer
    pub peer_port: Option<u16>,
    /// Idle outbound connections in the pool
    pub pooled_connections: usize,
    /// Address the listener is bound to
    pub local_addr: Option<SocketAddr>,
}

#[derive(Debug)]
struct Active {
    connections: Arc<ConnectionManager>,
    cancel: CancellationToken,
}

impl Active {
    async fn shutdown(self) {
        self.cancel.cancel();
        self.connections.stop().await;
    }
}

/// One peer pairing with its sends and receives.
#[derive(Debug)]
pub struct SessionManager {
    config: SessionConfig,
    active: tokio::sync::Mutex<Option<Active>>,
    updates: broadcast::Sender<Received>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    exited: AtomicBool,
}

impl SessionManager {
    /// Create a session that is not yet connected to anything.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            config,
            active: tokio::sync::Mutex::new(None),
            updates,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            exited: AtomicBool::new(false),
        }
    }

    /// Runtime settings of this session.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start listening on `local_port` and dialing the peer on `remote_port`.
    ///
    /// Any previous setup is shut down first. When `remote_address` is
    /// `None` the peer is learned from the first inbound connection.
    /// Returns the bound listener address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] after [`SessionManager::exit`], or an
    /// I/O error if the listener cannot be bound.
    pub async fn setup(
        &self,
        local_port: u16,
        remote_port: u16,
        remote_address: Option<IpAddr>,
    ) -> Result<SocketAddr> {
        self.setup_with(ConnectionConfig {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_port,
            remote_port,
            remote_address,
            pool_capacity: self.config.pool_capacity,
            dial_backoff: self.config.dial_backoff,
            socket_buffer_size: self.config.socket_buffer_size,
        })
        .await
    }

    /// [`SessionManager::setup`] with full control over connection settings.
    ///
    /// # Errors
    ///
    /// See [`SessionManager::setup`].
    pub async fn setup_with(&self, connection: ConnectionConfig) -> Result<SocketAddr> {
        if self.exited.load(Ordering::Acquire) {
            return Err(Error::NotRunning);
        }

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            tracing::info!("Replacing previous session setup");
            previous.shutdown().await;
        }

        let cancel = self.cancel.child_token();
        let connections = Arc::new(ConnectionManager::with_scope(
            connection,
            self.tracker.clone(),
            &cancel,
        ));
        let inbound = connections.run().await?;
        let local_addr = connections.local_addr().ok_or_else(|| {
            Error::Internal("listener address unavailable after start".to_string())
        })?;

        self.tracker.spawn(supervise_inbound(
            inbound,
            self.config.clone(),
            self.updates.clone(),
            self.tracker.clone(),
            cancel.clone(),
        ));

        *active = Some(Active {
            connections,
            cancel,
        });
        tracing::info!("Session ready on {}", local_addr);
        Ok(local_addr)
    }

    /// Send `payload` described by `description`.
    ///
    /// Returns a progress channel; the transfer runs in the background and
    /// finishes with either `succeeded` or `failed` set. A send waits for a
    /// pooled connection for as long as the session runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedPayload`] if the payload does not match
    /// the Description's kind, or [`Error::NotRunning`] before `setup`.
    pub async fn send(
        &self,
        payload: Payload,
        description: Description,
    ) -> Result<watch::Receiver<TransferInfo>> {
        payload.check_matches(&description)?;

        let (connections, cancel) = {
            let active = self.active.lock().await;
            let active = active.as_ref().ok_or(Error::NotRunning)?;
            (Arc::clone(&active.connections), active.cancel.clone())
        };

        let (progress_tx, progress_rx) = watch::channel(TransferInfo::new(description.clone()));
        let max_payload = self.config.max_payload();

        self.tracker.spawn(async move {
            let outcome = tokio::select! {
                r = send_transfer(&connections, payload, &description, max_payload, &progress_tx) => r,
                () = cancel.cancelled() => Err(Error::NotRunning),
            };

            match outcome {
                Ok(()) => {
                    tracing::info!("Sent '{}' ({} bytes)", description.name, description.size);
                    progress_tx.send_modify(TransferInfo::mark_succeeded);
                }
                Err(e) => {
                    tracing::warn!("Send of '{}' failed: {}", description.name, e);
                    progress_tx.send_modify(|info| info.mark_failed(&e));
                }
            }
        });

        Ok(progress_rx)
    }

    /// Subscribe to completed inbound transfers.
    ///
    /// Only transfers completed after subscribing are delivered.
    pub fn receive_updates(&self) -> broadcast::Receiver<Received> {
        self.updates.subscribe()
    }

    /// Current peer and pool state.
    pub async fn state_summary(&self) -> StateSummary {
        let active = self.active.lock().await;
        active
            .as_ref()
            .map(|active| StateSummary {
                peer_address: active.connections.peer_address(),
                peer_port: Some(active.connections.peer_port()),
                pooled_connections: active.connections.pooled_count(),
                local_addr: active.connections.local_addr(),
            })
            .unwrap_or_default()
    }

    /// Shut everything down. Idempotent; the session cannot be set up again.
    pub async fn exit(&self) {
        if self.exited.swap(true, Ordering::AcqRel) {
            return;
        }

        let active = self.active.lock().await.take();
        self.cancel.cancel();
        if let Some(active) = active {
            active.shutdown().await;
        }

        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "{} session tasks still running after {:?}",
                self.tracker.len(),
                SHUTDOWN_GRACE
            );
        }
        tracing::info!("Session exited");
    }
}

async fn supervise_inbound(
    mut inbound: mpsc::Receiver<Transport>,
    config: SessionConfig,
    updates: broadcast::Sender<Received>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        let transport = tokio::select! {
            next = inbound.recv() => match next {
                Some(transport) => transport,
                None => break,
            },
            () = cancel.cancelled() => break,
        };

        let decoder = InboundDecoder::new(
            Reassembler::new(config.download_dir.clone()),
            config.verify_checksum,
        );
        let updates = updates.clone();
        let cancel = cancel.clone();

        tracker.spawn(async move {
            let id = transport.id();
            let peer = transport.peer_addr();
            match receive_connection(transport, decoder, &updates, &cancel).await {
                Ok(count) => {
                    tracing::debug!("Transport #{} from {} done ({} transfers)", id, peer, count);
                }
                Err(e) => tracing::warn!("Receive from {} failed: {}", peer, e),
            }
        });
    }
    tracing::debug!("Inbound supervisor stopped");
}

/// Sessions keyed by identifier.
///
/// Owned explicitly by whoever sets sessions up; there is no global
/// instance.
#[derive(Debug)]
pub struct SessionRegistry {
    config: SessionConfig,
    sessions: Mutex<HashMap<String, Arc<SessionManager>>>,
}

impl SessionRegistry {
    /// Create an empty registry whose sessions use `config`.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Session for `id`, created on first use.
    pub fn get_instance(&self, id: &str) -> Arc<SessionManager> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            sessions
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(SessionManager::new(self.config.clone()))),
        )
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exit every session and clear the registry.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<SessionManager>> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, session)| session)
            .collect();

        for session in sessions {
            session.exit().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::Artifact;
    use crate::protocol::PayloadKind;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> SessionConfig {
        SessionConfig {
            dial_backoff: Duration::from_millis(20),
            download_dir: dir.path().to_path_buf(),
            ..SessionConfig::default()
        }
    }

    fn loopback(local_port: u16, remote_port: u16) -> ConnectionConfig {
        ConnectionConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port,
            remote_port,
            remote_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            dial_backoff: Duration::from_millis(20),
            ..ConnectionConfig::default()
        }
    }

    /// Two sessions wired to each other over loopback.
    async fn paired(dir_a: &TempDir, dir_b: &TempDir) -> (SessionManager, SessionManager) {
        let a = SessionManager::new(test_config(dir_a));
        let b = SessionManager::new(test_config(dir_b));

        let addr_b = b.setup_with(loopback(0, 1)).await.unwrap();
        a.setup_with(loopback(0, addr_b.port())).await.unwrap();
        (a, b)
    }

    async fn finished(mut progress: watch::Receiver<TransferInfo>) -> TransferInfo {
        let info = tokio::time::timeout(
            Duration::from_secs(10),
            progress.wait_for(TransferInfo::is_finished),
        )
        .await
        .expect("transfer should finish")
        .expect("progress channel")
        .clone();
        info
    }

    #[tokio::test]
    async fn test_send_bytes_between_sessions() {
        let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let (a, b) = paired(&dir_a, &dir_b).await;
        let mut updates = b.receive_updates();

        let data: Vec<u8> = (0..2500u32).map(|i| (i % 256) as u8).collect();
        let payload = Payload::Bytes(data.clone());
        let description = payload.describe(0).await.unwrap();

        let info = finished(a.send(payload, description.clone()).await.unwrap()).await;
        assert!(info.succeeded, "error: {:?}", info.error);
        assert_eq!(info.bytes_transferred, 2500);
        assert!(info.end_time.is_some());

        let received = tokio::time::timeout(Duration::from_secs(10), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.description, description);
        assert_eq!(received.artifact, Artifact::Bytes(data));

        a.exit().await;
        b.exit().await;
    }

    #[tokio::test]
    async fn test_send_requires_setup() {
        let dir = TempDir::new().unwrap();
        let session = SessionManager::new(test_config(&dir));
        let payload = Payload::text("x");
        let description = payload.describe(0).await.unwrap();

        assert!(matches!(
            session.send(payload, description).await,
            Err(Error::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_send_rejects_kind_mismatch() {
        let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let (a, b) = paired(&dir_a, &dir_b).await;

        let description = Description::new(PayloadKind::File, 1, 0, "f");
        let result = a.send(Payload::text("x"), description).await;
        assert!(matches!(result, Err(Error::UnsupportedPayload(_))));

        a.exit().await;
        b.exit().await;
    }

    #[tokio::test]
    async fn test_missing_file_marks_failed() {
        let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let (a, b) = paired(&dir_a, &dir_b).await;

        let payload = Payload::File(dir_a.path().join("missing.bin"));
        let description = Description::new(PayloadKind::File, 10, 0, "missing.bin");
        let info = finished(a.send(payload, description).await.unwrap()).await;

        assert!(info.failed);
        assert!(info.end_time.is_some());
        assert!(info.error.is_some());

        a.exit().await;
        b.exit().await;
    }

    #[tokio::test]
    async fn test_state_summary() {
        let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let idle = SessionManager::new(test_config(&dir_a));
        assert_eq!(idle.state_summary().await, StateSummary::default());

        let (a, b) = paired(&dir_a, &dir_b).await;
        let summary = a.state_summary().await;
        assert_eq!(summary.peer_address, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(summary.local_addr.is_some());
        assert!(summary.peer_port.is_some());

        a.exit().await;
        b.exit().await;
    }

    #[tokio::test]
    async fn test_exit_fails_waiting_sends() {
        let dir = TempDir::new().unwrap();
        let session = SessionManager::new(test_config(&dir));
        let unreachable = ConnectionConfig {
            remote_address: None,
            ..loopback(0, 1)
        };
        session.setup_with(unreachable).await.unwrap();

        let payload = Payload::text("never delivered");
        let description = payload.describe(0).await.unwrap();
        let progress = session.send(payload, description).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        session.exit().await;
        session.exit().await;

        let info = finished(progress).await;
        assert!(info.failed);
        assert!(matches!(
            session.setup(0, 1, None).await,
            Err(Error::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_setup_replaces_previous() {
        let dir = TempDir::new().unwrap();
        let session = SessionManager::new(test_config(&dir));

        let first = session.setup_with(loopback(0, 1)).await.unwrap();
        let second = session.setup_with(loopback(0, 1)).await.unwrap();
        assert_ne!(first, second);

        // The first listener is gone.
        assert!(tokio::net::TcpStream::connect(first).await.is_err());
        session.exit().await;
    }

    #[tokio::test]
    async fn test_registry_reuses_instances() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new(test_config(&dir));
        assert!(registry.is_empty());

        let a = registry.get_instance("main");
        let again = registry.get_instance("main");
        let other = registry.get_instance("other");

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(registry.len(), 2);

        registry.shutdown().await;
        assert!(registry.is_empty());
        assert!(!Arc::ptr_eq(&a, &registry.get_instance("main")));
    }
}
