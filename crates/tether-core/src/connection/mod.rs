//! Connection management between a fixed pair of peers.
//!
//! A [`ConnectionManager`] runs two long-lived tasks:
//!
//! - **accept loop**: accepts inbound connections and hands them to the
//!   receiver returned by [`ConnectionManager::run`]. The first accepted
//!   peer becomes the dial target when none was configured.
//! - **dial loop**: keeps connecting to the peer and parks each new
//!   connection in a bounded pool. When the pool is full the loop waits
//!   for a sender to take one; failed dials are retried after a fixed
//!   backoff.
//!
//! Either side may originate a TCP connection; both sides still end up
//! with a supply of ready outbound connections.
//!
//! ```text
//!   Idle ──run()──▶ Running ──stop()──▶ Stopped
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Capacity of the inbound hand-off channel.
const INBOUND_QUEUE: usize = 16;

/// Settings for one managed peer pair.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Address the listener binds to
    pub bind_address: IpAddr,
    /// Port the listener binds to (0 picks a free port)
    pub local_port: u16,
    /// Port dialed on the peer
    pub remote_port: u16,
    /// Peer address; learned from the first inbound connection when `None`
    pub remote_address: Option<IpAddr>,
    /// Maximum number of idle outbound connections
    pub pool_capacity: usize,
    /// Delay after a failed dial
    pub dial_backoff: Duration,
    /// Size of a single socket read
    pub socket_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_port: crate::DEFAULT_PORT,
            remote_port: crate::DEFAULT_PORT,
            remote_address: None,
            pool_capacity: crate::DEFAULT_POOL_CAPACITY,
            dial_backoff: Duration::from_millis(crate::DEFAULT_DIAL_BACKOFF_MS),
            socket_buffer_size: crate::DEFAULT_SOCKET_BUFFER_SIZE,
        }
    }
}

/// Lifecycle of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Created, not yet running
    Idle,
    /// Accept and dial loops are active
    Running,
    /// Shut down; terminal
    Stopped,
}

/// Listener, reconnecting dialer and outbound connection pool.
#[derive(Debug)]
pub struct ConnectionManager {
    config: ConnectionConfig,
    state: Mutex<ManagerState>,
    peer_tx: watch::Sender<Option<IpAddr>>,
    pool_tx: flume::Sender<Transport>,
    pool_rx: flume::Receiver<Transport>,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Create a manager with its own task scope.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_scope(config, TaskTracker::new(), &CancellationToken::new())
    }

    /// Create a manager whose tasks run in `tracker` and stop when `parent`
    /// is cancelled.
    #[must_use]
    pub fn with_scope(
        config: ConnectionConfig,
        tracker: TaskTracker,
        parent: &CancellationToken,
    ) -> Self {
        let (pool_tx, pool_rx) = flume::bounded(config.pool_capacity.max(1));
        let (peer_tx, _) = watch::channel(config.remote_address);

        Self {
            config,
            state: Mutex::new(ManagerState::Idle),
            peer_tx,
            pool_tx,
            pool_rx,
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            tracker,
            cancel: parent.child_token(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        self.state
            .lock()
            .map_or(ManagerState::Stopped, |state| *state)
    }

    /// Bind the listener and start the accept and dial loops.
    ///
    /// Returns the channel on which accepted connections are delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager is not idle or the listener cannot
    /// be bound.
    pub async fn run(&self) -> Result<mpsc::Receiver<Transport>> {
        if self.state() != ManagerState::Idle {
            return Err(Error::Internal(
                "connection manager can only be started once".to_string(),
            ));
        }

        let bind = SocketAddr::new(self.config.bind_address, self.config.local_port);
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Listening on {}", local_addr);

        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::Internal("state lock poisoned".to_string()))?;
            if *state != ManagerState::Idle {
                return Err(Error::Internal(
                    "connection manager can only be started once".to_string(),
                ));
            }
            *state = ManagerState::Running;
        }
        if let Ok(mut addr) = self.local_addr.lock() {
            *addr = Some(local_addr);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

        let accept = self.tracker.spawn(accept_loop(
            listener,
            inbound_tx,
            self.peer_tx.clone(),
            self.config.clone(),
            self.cancel.clone(),
        ));
        let dial = self.tracker.spawn(dial_loop(
            self.pool_tx.clone(),
            self.peer_tx.subscribe(),
            self.config.clone(),
            self.cancel.clone(),
        ));

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(accept);
            tasks.push(dial);
        }

        Ok(inbound_rx)
    }

    /// Wait for a pooled outbound connection.
    ///
    /// Returns `None` right away when the manager is not running, and
    /// `None` if the manager stops while waiting. There is no timeout.
    pub async fn take_connection(&self) -> Option<Transport> {
        if self.state() != ManagerState::Running {
            return None;
        }

        tokio::select! {
            taken = self.pool_rx.recv_async() => taken.ok(),
            () = self.cancel.cancelled() => None,
        }
    }

    /// Stop both loops, close the listener and every pooled connection.
    ///
    /// Idempotent. The manager cannot be restarted.
    pub async fn stop(&self) {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if *state == ManagerState::Stopped {
                return;
            }
            *state = ManagerState::Stopped;
        }

        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut tasks| tasks.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Connection task ended abnormally: {}", e);
            }
        }

        let mut closed = 0usize;
        while let Ok(transport) = self.pool_rx.try_recv() {
            transport.close().await;
            closed += 1;
        }
        tracing::info!("Connection manager stopped ({} pooled connections closed)", closed);
    }

    /// Number of idle connections in the pool.
    pub fn pooled_count(&self) -> usize {
        self.pool_rx.len()
    }

    /// Peer address currently dialed, if known.
    pub fn peer_address(&self) -> Option<IpAddr> {
        *self.peer_tx.borrow()
    }

    /// Port dialed on the peer.
    pub fn peer_port(&self) -> u16 {
        self.config.remote_port
    }

    /// Address the listener is bound to, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound_tx: mpsc::Sender<Transport>,
    peer_tx: watch::Sender<Option<IpAddr>>,
    config: ConnectionConfig,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            () = cancel.cancelled() => break,
        };

        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::select! {
                    () = tokio::time::sleep(config.dial_backoff) => continue,
                    () = cancel.cancelled() => break,
                }
            }
        };

        peer_tx.send_if_modified(|peer| {
            if peer.is_none() {
                tracing::info!("Learned peer address {} from inbound connection", remote.ip());
                *peer = Some(remote.ip());
                true
            } else {
                false
            }
        });

        let transport = match Transport::new(stream, config.socket_buffer_size) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!("Dropping inbound connection from {}: {}", remote, e);
                continue;
            }
        };

        tokio::select! {
            sent = inbound_tx.send(transport) => {
                if sent.is_err() {
                    tracing::debug!("Inbound handler gone, accept loop exiting");
                    break;
                }
            }
            () = cancel.cancelled() => break,
        }
    }
    tracing::debug!("Accept loop stopped");
}

async fn dial_loop(
    pool_tx: flume::Sender<Transport>,
    mut peer_rx: watch::Receiver<Option<IpAddr>>,
    config: ConnectionConfig,
    cancel: CancellationToken,
) {
    loop {
        let peer = tokio::select! {
            r = async { peer_rx.wait_for(Option::is_some).await.map(|peer| *peer) } => r,
            () = cancel.cancelled() => break,
        };
        let Ok(Some(ip)) = peer else {
            break;
        };
        let addr = SocketAddr::new(ip, config.remote_port);

        let attempt = tokio::select! {
            r = Transport::connect(addr, config.socket_buffer_size) => r,
            () = cancel.cancelled() => break,
        };

        match attempt {
            Ok(transport) => {
                tracing::debug!("Dialed {} (transport #{})", addr, transport.id());
                tokio::select! {
                    pushed = pool_tx.send_async(transport) => {
                        if pushed.is_err() {
                            break;
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
            Err(e) => {
                tracing::debug!("Dial {} failed: {}", addr, e);
                tokio::select! {
                    () = tokio::time::sleep(config.dial_backoff) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }
    }
    tracing::debug!("Dial loop stopped");
}
