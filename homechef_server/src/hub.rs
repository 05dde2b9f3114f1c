//! The WebSocket connection hub.
//!
//! A single actor task owns the map of live connections. Sessions register and unregister by sending commands over a
//! channel, and so does everything that wants to push a frame to clients. Nothing else ever touches the map.
//!
//! Every connection has a bounded send buffer. When a broadcast finds the buffer full, the connection is dropped
//! rather than the frame: its kick token is cancelled, which makes the session close the socket, and it is removed
//! from the map.
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    future::Future,
    pin::Pin,
};

use chrono::{DateTime, Utc};
use homechef_engine::{
    db_types::Role,
    events::{EventHooks, OrderEvent},
};
use log::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, mpsc::error::TrySendError, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const COMMAND_BUFFER: usize = 1024;

/// A JSON frame pushed to WebSocket clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub event: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// The order's event sequence number, for clients that need to order frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Event,
    Pong,
    System,
}

impl WsFrame {
    pub fn for_event(event: &OrderEvent) -> Self {
        Self {
            kind: FrameKind::Event,
            event: event.kind.as_str().to_string(),
            data: event.data.clone(),
            user_id: None,
            seq: Some(event.seq),
            timestamp: event.timestamp,
        }
    }

    pub fn pong(user_id: &str) -> Self {
        Self {
            kind: FrameKind::Pong,
            event: "pong".to_string(),
            data: Value::Null,
            user_id: Some(user_id.to_string()),
            seq: None,
            timestamp: Utc::now(),
        }
    }

    pub fn system<S: Into<String>>(event: S, data: Value) -> Self {
        Self { kind: FrameKind::System, event: event.into(), data, user_id: None, seq: None, timestamp: Utc::now() }
    }
}

/// The hub's record of a live connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub user_id: String,
    pub role: Role,
    pub sender: mpsc::Sender<WsFrame>,
    pub kick: CancellationToken,
}

impl Connection {
    /// Creates the record for a new connection, and the receiving end of its send buffer.
    pub fn new<S: Into<String>>(user_id: S, role: Role, buffer_size: usize) -> (Self, mpsc::Receiver<WsFrame>) {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let conn =
            Self { id: Uuid::new_v4(), user_id: user_id.into(), role, sender, kick: CancellationToken::new() };
        (conn, receiver)
    }
}

/// Who a broadcast goes to. A connection receives a targeted frame once, however many of the targets it matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    User(String),
    Role(Role),
    Any { users: Vec<String>, roles: Vec<Role> },
}

impl Target {
    fn matches(&self, conn: &Connection) -> bool {
        match self {
            Target::All => true,
            Target::User(u) => conn.user_id == *u,
            Target::Role(r) => conn.role == *r,
            Target::Any { users, roles } => users.contains(&conn.user_id) || roles.contains(&conn.role),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStats {
    pub total_connections: usize,
    pub unique_users: usize,
    pub by_role: BTreeMap<String, usize>,
}

#[derive(Debug)]
enum HubCommand {
    Register(Connection),
    Unregister(Uuid),
    Broadcast { target: Target, frame: WsFrame },
    Stats(oneshot::Sender<HubStats>),
    Shutdown,
}

/// A cheap, cloneable handle for talking to the hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    async fn send(&self, cmd: HubCommand) {
        if self.commands.send(cmd).await.is_err() {
            debug!("🔌️ The connection hub has stopped. Command dropped");
        }
    }

    pub async fn register(&self, conn: Connection) {
        self.send(HubCommand::Register(conn)).await
    }

    pub async fn unregister(&self, id: Uuid) {
        self.send(HubCommand::Unregister(id)).await
    }

    pub async fn broadcast(&self, target: Target, frame: WsFrame) {
        self.send(HubCommand::Broadcast { target, frame }).await
    }

    pub async fn broadcast_all(&self, frame: WsFrame) {
        self.broadcast(Target::All, frame).await
    }

    pub async fn broadcast_to_user<S: Into<String>>(&self, user_id: S, frame: WsFrame) {
        self.broadcast(Target::User(user_id.into()), frame).await
    }

    pub async fn broadcast_to_role(&self, role: Role, frame: WsFrame) {
        self.broadcast(Target::Role(role), frame).await
    }

    /// Pushes an order event to the order's participants and to every admin.
    pub async fn publish_order_event(&self, event: &OrderEvent) {
        let users = event.audience.recipients().into_iter().map(|(u, _)| u.to_string()).collect();
        let target = Target::Any { users, roles: vec![Role::Admin] };
        self.broadcast(target, WsFrame::for_event(event)).await
    }

    pub async fn stats(&self) -> Option<HubStats> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Stats(tx)).await;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        self.send(HubCommand::Shutdown).await
    }

    /// Adds a hook that forwards every order event to the hub.
    pub fn add_to_hooks(&self, hooks: &mut EventHooks) {
        let hub = self.clone();
        hooks.on_order_event("websocket_hub", move |ev| -> Pin<Box<dyn Future<Output = ()> + Send>> {
            let hub = hub.clone();
            Box::pin(async move { hub.publish_order_event(&ev).await })
        });
    }
}

pub struct ConnectionHub {
    connections: HashMap<Uuid, Connection>,
    commands: mpsc::Receiver<HubCommand>,
}

impl ConnectionHub {
    pub fn new() -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        (Self { connections: HashMap::new(), commands: rx }, HubHandle { commands: tx })
    }

    /// Creates the hub and runs it on its own task.
    pub fn start() -> HubHandle {
        let (hub, handle) = Self::new();
        tokio::spawn(hub.run());
        handle
    }

    pub async fn run(mut self) {
        info!("🔌️ Connection hub started");
        while let Some(cmd) = self.commands.recv().await {
            match cmd {
                HubCommand::Register(conn) => {
                    debug!("🔌️ {} connected as {}:{}", conn.id, conn.role, conn.user_id);
                    self.connections.insert(conn.id, conn);
                },
                HubCommand::Unregister(id) => {
                    if self.connections.remove(&id).is_some() {
                        debug!("🔌️ {id} disconnected");
                    }
                },
                HubCommand::Broadcast { target, frame } => self.broadcast(&target, &frame),
                HubCommand::Stats(reply) => {
                    let _ = reply.send(self.stats());
                },
                HubCommand::Shutdown => break,
            }
        }
        for conn in self.connections.values() {
            conn.kick.cancel();
        }
        info!("🔌️ Connection hub stopped. {} connections dropped", self.connections.len());
    }

    fn broadcast(&mut self, target: &Target, frame: &WsFrame) {
        let mut dropped = Vec::new();
        let mut sent = 0usize;
        for conn in self.connections.values().filter(|c| target.matches(c)) {
            match conn.sender.try_send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("🔌️ {}:{} is not keeping up. Dropping connection {}", conn.role, conn.user_id, conn.id);
                    conn.kick.cancel();
                    dropped.push(conn.id);
                },
                Err(TrySendError::Closed(_)) => dropped.push(conn.id),
            }
        }
        for id in dropped {
            self.connections.remove(&id);
        }
        trace!("🔌️ {} sent to {sent} connection(s)", frame.event);
    }

    fn stats(&self) -> HubStats {
        let mut by_role = BTreeMap::new();
        for conn in self.connections.values() {
            *by_role.entry(conn.role.to_string()).or_insert(0) += 1;
        }
        let unique_users = self.connections.values().map(|c| c.user_id.as_str()).collect::<HashSet<_>>().len();
        HubStats { total_connections: self.connections.len(), unique_users, by_role }
    }
}
