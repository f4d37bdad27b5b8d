use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use gametable_engine::Seat;

use crate::lobby::Lobby;
use crate::session::{FlowState, PlayerGameState};

pub type ConnectionId = u64;

pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;
pub type MessageReceiver = mpsc::UnboundedReceiver<ServerMessage>;

/// Server-to-client WebSocket messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    State {
        #[serde(skip_serializing_if = "Option::is_none")]
        state: Option<Box<PlayerGameState>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        lobby: Option<Lobby>,
        flow_state: FlowState,
        #[serde(skip_serializing_if = "Option::is_none")]
        player_position: Option<Seat>,
        is_spectator: bool,
    },
    Pong { timestamp: i64 },
    Error { error: String },
    #[serde(rename_all = "camelCase")]
    Restart {
        state: Box<PlayerGameState>,
        flow_state: FlowState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Active,
    AwaitingPong,
    Closed,
}

/// One attached client. The session owns the table; a connection only
/// ever receives messages the session pushes during broadcast, which is
/// what keeps per-connection ordering FIFO.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub player_id: String,
    /// `None` is a spectator.
    pub seat: Option<Seat>,
    pub liveness: Liveness,
    pub last_ping: Instant,
    sender: MessageSender,
}

impl Connection {
    pub fn is_live(&self) -> bool {
        self.liveness != Liveness::Closed
    }
}

/// Session-owned subscriber set. Connections never mutate the session;
/// the session sends through this table while holding its mutation lane,
/// so any two broadcasts arrive in commit order on every socket.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: Vec<Connection>,
    next_id: ConnectionId,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection. Older live connections for the same
    /// (player, seat) are superseded: marked closed and dropped, which
    /// ends their send pumps cleanly.
    pub fn add(
        &mut self,
        player_id: impl Into<String>,
        seat: Option<Seat>,
        sender: MessageSender,
    ) -> ConnectionId {
        let player_id = player_id.into();
        for conn in &mut self.connections {
            if conn.player_id == player_id && conn.seat == seat {
                conn.liveness = Liveness::Closed;
            }
        }
        self.connections.retain(|c| c.is_live());

        let id = self.next_id;
        self.next_id += 1;
        self.connections.push(Connection {
            id,
            player_id,
            seat,
            liveness: Liveness::Active,
            last_ping: Instant::now(),
            sender,
        });
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id == id)
    }

    pub fn close(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.iter_mut().find(|c| c.id == id) {
            conn.liveness = Liveness::Closed;
        }
        self.connections.retain(|c| c.is_live());
    }

    /// Force-close every connection of one player (kick).
    pub fn close_player(&mut self, player_id: &str) {
        for conn in &mut self.connections {
            if conn.player_id == player_id {
                conn.liveness = Liveness::Closed;
            }
        }
        self.connections.retain(|c| c.is_live());
    }

    pub fn touch_ping(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.iter_mut().find(|c| c.id == id) {
            conn.last_ping = Instant::now();
            conn.liveness = Liveness::Active;
        }
    }

    /// Targeted send. A failed send closes the connection and leaves the
    /// rest untouched.
    pub fn send_to(&mut self, id: ConnectionId, message: ServerMessage) -> bool {
        let Some(conn) = self.connections.iter_mut().find(|c| c.id == id) else {
            return false;
        };
        if conn.sender.send(message).is_err() {
            conn.liveness = Liveness::Closed;
            self.connections.retain(|c| c.is_live());
            return false;
        }
        true
    }

    /// Fan a per-connection message out to every live connection. Dead
    /// sockets are pruned; their player ids are returned so the caller
    /// can mirror liveness into the lobby.
    pub fn broadcast(
        &mut self,
        mut build: impl FnMut(&Connection) -> ServerMessage,
    ) -> Vec<String> {
        let mut dropped = Vec::new();
        for conn in &mut self.connections {
            let message = build(conn);
            if conn.sender.send(message).is_err() {
                tracing::debug!(
                    connection_id = conn.id,
                    player_id = %conn.player_id,
                    "dropping dead connection during broadcast"
                );
                conn.liveness = Liveness::Closed;
                dropped.push(conn.player_id.clone());
            }
        }
        self.connections.retain(|c| c.is_live());
        dropped
    }

    /// Close connections that have not pinged within `idle`; flag ones
    /// past the half-way mark as awaiting a pong. Returns the player ids
    /// whose last live connection went away.
    pub fn sweep_idle(&mut self, idle: std::time::Duration) -> Vec<String> {
        let now = Instant::now();
        let mut swept = Vec::new();
        for conn in &mut self.connections {
            let silent = now.duration_since(conn.last_ping);
            if silent >= idle {
                conn.liveness = Liveness::Closed;
                swept.push(conn.player_id.clone());
            } else if silent >= idle / 2 && conn.liveness == Liveness::Active {
                conn.liveness = Liveness::AwaitingPong;
            }
        }
        self.connections.retain(|c| c.is_live());
        swept.retain(|player| !self.is_player_connected(player));
        swept
    }

    pub fn is_player_connected(&self, player_id: &str) -> bool {
        self.connections.iter().any(|c| c.player_id == player_id && c.is_live())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }
}
