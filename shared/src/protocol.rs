use crate::entity::{Bomb, Explosion, Player};
use crate::error::Result;
use crate::input::FrameInput;
use crate::map::TileChange;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Everything that crosses the wire, in both directions.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    // Client to server
    Join {
        /// `None` asks the server to pick a room
        room_id: Option<String>,
        name: String,
    },
    Leave,
    Input {
        sequence: u32,
        inputs: Vec<FrameInput>,
    },
    Reconnect {
        token: String,
    },
    RoomListRequest,
    RoomAction {
        action: RoomAction,
    },

    // Server to client
    Joined {
        player_id: u32,
        room_id: String,
        token: String,
        seed: u64,
        tick_rate: u32,
        frame: u32,
    },
    JoinRejected {
        reason: String,
    },
    Reconnected {
        player_id: u32,
        room_id: String,
        token: String,
        seed: u64,
        tick_rate: u32,
        frame: u32,
    },
    ReconnectRejected {
        reason: String,
    },
    Snapshot(Snapshot),
    Event(GameEvent),
    RoomList {
        rooms: Vec<RoomInfo>,
    },
    Disconnected {
        reason: String,
    },

    // Either direction
    Ping {
        nonce: u32,
        sent_at_ms: u64,
    },
    Pong {
        nonce: u32,
        echo_ms: u64,
        /// Sender's clock when the pong left, used for clock offset estimation
        peer_time_ms: u64,
    },
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Join { .. } => "join",
            Packet::Leave => "leave",
            Packet::Input { .. } => "input",
            Packet::Reconnect { .. } => "reconnect",
            Packet::RoomListRequest => "room-list-request",
            Packet::RoomAction { .. } => "room-action",
            Packet::Joined { .. } => "joined",
            Packet::JoinRejected { .. } => "join-rejected",
            Packet::Reconnected { .. } => "reconnected",
            Packet::ReconnectRejected { .. } => "reconnect-rejected",
            Packet::Snapshot(_) => "snapshot",
            Packet::Event(_) => "event",
            Packet::RoomList { .. } => "room-list",
            Packet::Disconnected { .. } => "disconnected",
            Packet::Ping { .. } => "ping",
            Packet::Pong { .. } => "pong",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Waiting,
    Countdown,
    Running,
    Ending,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Waiting => "waiting",
            Phase::Countdown => "countdown",
            Phase::Running => "running",
            Phase::Ending => "ending",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomAction {
    AddBot,
    RemoveBot,
}

/// Authoritative world state at one frame.
///
/// Incremental snapshots carry only the tile changes since the previous broadcast.
/// Full snapshots (first send, reconnects, round restarts) carry every change since
/// the map was generated from `seed`, so a client can rebuild the grid from scratch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub frame: u32,
    pub phase: Phase,
    pub seed: u64,
    pub server_time_ms: u64,
    pub players: Vec<Player>,
    pub bombs: Vec<Bomb>,
    pub explosions: Vec<Explosion>,
    pub tile_changes: Vec<TileChange>,
    pub last_processed_input: HashMap<u32, u32>,
    pub full: bool,
}

impl Snapshot {
    pub fn player(&self, id: u32) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GameEvent {
    PlayerJoined {
        player_id: u32,
        name: String,
    },
    PlayerLeft {
        player_id: u32,
    },
    PlayerDied {
        player_id: u32,
        /// Owner of the blast, if it could be attributed
        killer: Option<u32>,
        frame: u32,
    },
    PhaseChanged {
        phase: Phase,
        frame: u32,
    },
    RoundOver {
        winner: Option<u32>,
        frame: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub players: usize,
    pub capacity: usize,
    pub phase: Phase,
}
