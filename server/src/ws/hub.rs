//! Process-wide registry of live connections and the broadcast dispatcher.
//!
//! The registry is owned by a single control task ([`Hub::run`]). Everything
//! else talks to it through a cloneable [`HubHandle`] that pushes commands onto
//! one unbounded queue, so registration, removal and fan-out are serialized
//! without a lock around the map. Frames are handed to each connection with a
//! non-blocking `try_send`; a connection whose bounded queue is full is evicted
//! on the spot so one stalled client never holds up the rest.

use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::auth::session::Identity;
use crate::ws::protocol::{Envelope, Frame, OnlineUser};

/// Identifies one Connection instance. A reconnect gets a fresh id.
pub type ConnectionId = Uuid;

/// The hub's side of a connection: who it is and where to push frames.
///
/// The outbound sender lives only here, so dropping the handle closes the
/// connection's queue and ends its writer.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub identity: Identity,
    outbound: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    /// Create a handle with a bounded outbound queue of `capacity` frames.
    /// Returns the handle and the receiving end for the connection's writer.
    pub fn new(identity: Identity, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        Self::with_id(Uuid::now_v7(), identity, capacity)
    }

    pub fn with_id(
        id: ConnectionId,
        identity: Identity,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id,
                identity,
                outbound,
            },
            rx,
        )
    }
}

enum HubCommand {
    Register(ConnectionHandle),
    Unregister(ConnectionId),
    Broadcast(Frame),
    BroadcastPresence,
    Registered(oneshot::Sender<Vec<(ConnectionId, Identity)>>),
}

/// Cloneable front door to the hub's control loop.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
    /// Read-only mirror of the registry, written only by the control loop.
    online: Arc<DashMap<ConnectionId, OnlineUser>>,
}

impl HubHandle {
    pub fn register(&self, connection: ConnectionHandle) {
        self.send(HubCommand::Register(connection));
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.send(HubCommand::Unregister(id));
    }

    /// Queue `frame` for delivery to every registered connection.
    pub fn broadcast(&self, frame: Frame) {
        self.send(HubCommand::Broadcast(frame));
    }

    /// Encode `envelope` once and broadcast the resulting frame.
    pub fn broadcast_envelope(&self, envelope: &Envelope) {
        match envelope.encode() {
            Ok(frame) => self.broadcast(frame),
            Err(e) => tracing::error!(
                kind = envelope.kind(),
                error = %e,
                "Failed to encode envelope"
            ),
        }
    }

    /// Ask the control loop to broadcast its current online-users snapshot.
    pub fn broadcast_presence(&self) {
        self.send(HubCommand::BroadcastPresence);
    }

    /// Snapshot of connected users, one entry per user, sorted by nickname.
    /// Safe to call from any task; may trail the control loop slightly.
    pub fn online_users(&self) -> Vec<OnlineUser> {
        dedup_users(self.online.iter().map(|entry| entry.value().clone()))
    }

    /// Registry contents as seen by the control loop after every command
    /// submitted before this call has been applied.
    pub async fn registered(&self) -> Vec<(ConnectionId, Identity)> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Registered(tx));
        rx.await.unwrap_or_default()
    }

    fn send(&self, command: HubCommand) {
        if self.commands.send(command).is_err() {
            tracing::warn!("Hub control loop is not running, command dropped");
        }
    }
}

/// Registry state owned by the control loop.
pub struct Hub {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    online: Arc<DashMap<ConnectionId, OnlineUser>>,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    announce_presence: bool,
}

/// Create a hub and spawn its control loop on the current runtime.
pub fn spawn_hub(announce_presence: bool) -> HubHandle {
    let (hub, handle) = Hub::new(announce_presence);
    tokio::spawn(hub.run());
    handle
}

impl Hub {
    /// Create a hub and the handle that feeds it. The loop is not started;
    /// call [`Hub::run`] (or use [`spawn_hub`]).
    pub fn new(announce_presence: bool) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let online = Arc::new(DashMap::new());
        let hub = Self {
            connections: HashMap::new(),
            online: online.clone(),
            commands: rx,
            announce_presence,
        };
        (
            hub,
            HubHandle {
                commands: tx,
                online,
            },
        )
    }

    /// Control loop: the only place the registry is mutated.
    /// Ends when every [`HubHandle`] has been dropped.
    pub async fn run(mut self) {
        tracing::info!("Hub control loop started");
        while let Some(command) = self.commands.recv().await {
            self.handle_command(command);
        }
        tracing::info!(
            connections = self.connections.len(),
            "Hub control loop stopped"
        );
    }

    fn handle_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(connection) => {
                if self.register(connection) && self.announce_presence {
                    self.broadcast_presence();
                }
            }
            HubCommand::Unregister(id) => {
                if self.unregister(id) && self.announce_presence {
                    self.broadcast_presence();
                }
            }
            HubCommand::Broadcast(frame) => {
                self.broadcast(&frame);
            }
            HubCommand::BroadcastPresence => self.broadcast_presence(),
            HubCommand::Registered(reply) => {
                let _ = reply.send(
                    self.connections
                        .values()
                        .map(|c| (c.id, c.identity.clone()))
                        .collect(),
                );
            }
        }
    }

    /// Add a connection. Returns false (and drops the new handle) if the id
    /// is already registered.
    pub fn register(&mut self, connection: ConnectionHandle) -> bool {
        if self.connections.contains_key(&connection.id) {
            tracing::debug!(connection_id = %connection.id, "Connection already registered");
            return false;
        }

        tracing::info!(
            connection_id = %connection.id,
            user_id = connection.identity.user_id,
            nickname = %connection.identity.nickname,
            "Connection registered"
        );
        self.online
            .insert(connection.id, OnlineUser::from(&connection.identity));
        self.connections.insert(connection.id, connection);
        true
    }

    /// Remove a connection and close its queue. Returns false if it was not
    /// registered, so repeated calls are harmless.
    pub fn unregister(&mut self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some(connection) => {
                self.online.remove(&id);
                tracing::info!(
                    connection_id = %id,
                    user_id = connection.identity.user_id,
                    "Connection unregistered"
                );
                true
            }
            None => false,
        }
    }

    /// Push `frame` to every connection. Connections whose queue is full or
    /// closed are evicted. Returns the number of connections that took the frame.
    pub fn broadcast(&mut self, frame: &Frame) -> usize {
        let evicted = self.fan_out(frame);
        let delivered = self.connections.len();

        if !evicted.is_empty() && self.announce_presence {
            // Evictions from this follow-up are not announced again
            let presence = self.presence_frame();
            if let Some(presence) = presence {
                self.fan_out(&presence);
            }
        }

        delivered
    }

    /// Broadcast the current online-users snapshot.
    pub fn broadcast_presence(&mut self) {
        if let Some(frame) = self.presence_frame() {
            self.broadcast(&frame);
        }
    }

    /// Users behind the registered connections, deduplicated by user id.
    pub fn online_users(&self) -> Vec<OnlineUser> {
        dedup_users(
            self.connections
                .values()
                .map(|c| OnlineUser::from(&c.identity)),
        )
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn presence_frame(&self) -> Option<Frame> {
        let envelope = Envelope::OnlineUsers(self.online_users());
        match envelope.encode() {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode presence snapshot");
                None
            }
        }
    }

    fn fan_out(&mut self, frame: &Frame) -> Vec<ConnectionId> {
        let mut evicted = Vec::new();

        for connection in self.connections.values() {
            match connection.outbound.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        connection_id = %connection.id,
                        user_id = connection.identity.user_id,
                        "Outbound queue full, dropping slow connection"
                    );
                    evicted.push(connection.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(
                        connection_id = %connection.id,
                        "Outbound queue closed, dropping connection"
                    );
                    evicted.push(connection.id);
                }
            }
        }

        for id in &evicted {
            self.unregister(*id);
        }
        evicted
    }
}

fn dedup_users(users: impl Iterator<Item = OnlineUser>) -> Vec<OnlineUser> {
    let by_id: BTreeMap<i64, OnlineUser> = users.map(|u| (u.id, u)).collect();
    let mut users: Vec<OnlineUser> = by_id.into_values().collect();
    users.sort_by(|a, b| a.nickname.cmp(&b.nickname).then(a.id.cmp(&b.id)));
    users
}
