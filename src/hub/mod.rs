/**
 * Broadcast hub
 *
 * Owns the set of connected clients. Membership changes and broadcasts all
 * arrive over channels and are applied by one control loop, so the client
 * map is never shared between tasks.
 */
pub mod connection;
pub mod message;

pub use connection::{ClientConnection, ConnectionState, DisconnectReason};
pub use message::{Envelope, Frame};

use crate::config::HubConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ClientId(Uuid);

impl ClientId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub control loop has stopped")]
    Stopped,
}

/// The hub's view of a client: its id and the sending half of its outbound queue
#[derive(Debug)]
pub struct ClientHandle {
    pub id: ClientId,
    queue: mpsc::Sender<Frame>,
}

impl ClientHandle {
    /// Create a client handle with a bounded outbound queue of `capacity` frames
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ClientId::new(),
                queue: tx,
            },
            rx,
        )
    }
}

struct Registration {
    client: ClientHandle,
    accepted: oneshot::Sender<()>,
}

/// Snapshot of hub state, answered by the control loop when it is otherwise idle
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub clients: Vec<ClientId>,
    pub broadcasts: u64,
    pub dropped_clients: u64,
}

/// Cloneable entry point to a running hub
#[derive(Debug, Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<ClientId>,
    broadcast_tx: mpsc::Sender<Frame>,
    stats_tx: mpsc::Sender<oneshot::Sender<HubStats>>,
}

impl HubHandle {
    /// Add a client to the membership set.
    ///
    /// Resolves once the control loop has inserted the client.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Stopped` if the hub is no longer running
    pub async fn register(&self, client: ClientHandle) -> Result<(), HubError> {
        let (accepted, was_accepted) = oneshot::channel();
        self.register_tx
            .send(Registration { client, accepted })
            .await
            .map_err(|_| HubError::Stopped)?;
        was_accepted.await.map_err(|_| HubError::Stopped)
    }

    /// Remove a client and close its outbound queue. Removing an unknown or
    /// already removed client is a no-op.
    pub async fn unregister(&self, id: ClientId) {
        if self.unregister_tx.send(id).await.is_err() {
            debug!("Hub stopped before client {} was unregistered", id);
        }
    }

    /// Queue a frame for delivery to every registered client
    ///
    /// # Errors
    ///
    /// Returns `HubError::Stopped` if the hub is no longer running
    pub async fn broadcast(&self, frame: Frame) -> Result<(), HubError> {
        self.broadcast_tx
            .send(frame)
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// # Errors
    ///
    /// Returns `HubError::Stopped` if the hub is no longer running
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, stats) = oneshot::channel();
        self.stats_tx
            .send(reply)
            .await
            .map_err(|_| HubError::Stopped)?;
        stats.await.map_err(|_| HubError::Stopped)
    }
}

pub struct Hub {
    clients: HashMap<ClientId, mpsc::Sender<Frame>>,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<ClientId>,
    broadcast_rx: mpsc::Receiver<Frame>,
    stats_rx: mpsc::Receiver<oneshot::Sender<HubStats>>,
    broadcasts: u64,
    dropped_clients: u64,
}

impl Hub {
    #[must_use]
    pub fn new(config: &HubConfig) -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(config.membership_capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(config.membership_capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity);
        let (stats_tx, stats_rx) = mpsc::channel(8);

        let hub = Self {
            clients: HashMap::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            stats_rx,
            broadcasts: 0,
            dropped_clients: 0,
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            stats_tx,
        };
        (hub, handle)
    }

    /// Create a hub and run its control loop on a new task
    #[must_use]
    pub fn spawn(config: &HubConfig, shutdown: CancellationToken) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(config);
        let task = tokio::spawn(hub.run(shutdown));
        (handle, task)
    }

    /// Run the control loop until `shutdown` fires.
    ///
    /// Channels are polled in priority order: registrations, then
    /// unregistrations, then broadcasts, and stats only when all three are
    /// empty. A registration or unregistration sent before a broadcast is
    /// therefore always applied before that broadcast is delivered.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("📡 Hub control loop started");

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!("📡 Hub shutting down, closing {} client(s)", self.clients.len());
                    break;
                }
                Some(registration) = self.register_rx.recv() => {
                    self.register(registration);
                }
                Some(id) = self.unregister_rx.recv() => {
                    self.unregister(id);
                }
                Some(frame) = self.broadcast_rx.recv() => {
                    self.deliver(&frame);
                }
                Some(reply) = self.stats_rx.recv() => {
                    let _ = reply.send(self.snapshot());
                }
            }
        }

        // Dropping the queue senders lets every send pump finish and close its socket
        self.clients.clear();
    }

    fn register(&mut self, registration: Registration) {
        let Registration { client, accepted } = registration;
        self.clients.insert(client.id, client.queue);
        debug!("➕ Client {} registered ({} connected)", client.id, self.clients.len());
        let _ = accepted.send(());
    }

    fn unregister(&mut self, id: ClientId) {
        if self.clients.remove(&id).is_some() {
            debug!("➖ Client {} unregistered ({} connected)", id, self.clients.len());
        }
    }

    /// Offer `frame` to every client without waiting. A client whose queue is
    /// full is dropped rather than allowed to hold up the others.
    fn deliver(&mut self, frame: &Frame) {
        self.broadcasts += 1;
        let mut gone = Vec::new();

        for (id, queue) in &self.clients {
            match queue.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("🐢 Client {} cannot keep up, dropping it", id);
                    self.dropped_clients += 1;
                    gone.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Client {} queue already closed", id);
                    gone.push(*id);
                }
            }
        }

        for id in gone {
            self.unregister(id);
        }
    }

    fn snapshot(&self) -> HubStats {
        HubStats {
            clients: self.clients.keys().copied().collect(),
            broadcasts: self.broadcasts,
            dropped_clients: self.dropped_clients,
        }
    }
}
