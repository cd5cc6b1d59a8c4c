//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Control messages are JSON; keystrokes may also arrive as compact binary
//! (bincode) [`KeyInput`] frames.

use serde::{Deserialize, Serialize};

use crate::race::{ManagerError, PlayerId, PlayerView, PracticeSnapshot, RaceEvent};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Identify and enter matchmaking. Must be the first message.
    Hello {
        /// Requested player id.
        player_id: String,
        /// Display name.
        name: String,
    },

    /// One keystroke.
    Key(KeyInput),

    /// Whole typed buffer, replacing the server's copy.
    Typed {
        /// Everything typed so far.
        text: String,
    },

    /// Leave the current race and matchmake again.
    Requeue,

    /// Leave matchmaking and type a prompt alone. Sent while practicing,
    /// restarts on a new prompt.
    Practice,

    /// Request a fresh snapshot.
    SyncRequest,

    /// Ping for latency measurement.
    Ping {
        /// Client clock, echoed back.
        timestamp: u64,
    },

    /// Player is disconnecting.
    Leave,
}

/// A single keystroke.
///
/// Kept flat so it round-trips through bincode; tagged enums do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInput {
    /// Client sequence number.
    pub seq: u32,
    /// Unicode scalar value of the typed character.
    pub code: u32,
    /// Flag bits.
    pub flags: u8,
}

impl KeyInput {
    /// Delete the last typed character.
    pub const FLAG_BACKSPACE: u8 = 0x01;

    /// A printable character.
    pub fn char(seq: u32, ch: char) -> Self {
        Self {
            seq,
            code: ch as u32,
            flags: 0,
        }
    }

    /// A backspace.
    pub fn backspace(seq: u32) -> Self {
        Self {
            seq,
            code: 0,
            flags: Self::FLAG_BACKSPACE,
        }
    }

    /// Is this a backspace.
    pub fn is_backspace(&self) -> bool {
        self.flags & Self::FLAG_BACKSPACE != 0
    }

    /// Apply to a typed buffer. Returns false for an invalid code point.
    pub fn apply(&self, buffer: &mut String) -> bool {
        if self.is_backspace() {
            buffer.pop();
            return true;
        }

        match char::from_u32(self.code) {
            Some(ch) if !ch.is_control() => {
                buffer.push(ch);
                true
            }
            _ => false,
        }
    }

    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Registration accepted.
    Welcome {
        /// Registered player id.
        player_id: PlayerId,
        /// Server version.
        server_version: String,
    },

    /// Full view of the player's lobby or race.
    Snapshot(PlayerView),

    /// Incremental lobby or race event.
    Event(RaceEvent),

    /// Solo practice stats, sent after every accepted update.
    Practice(PracticeSnapshot),

    /// Pong response.
    Pong {
        /// Echoed client clock.
        timestamp: u64,
        /// Server clock in milliseconds.
        server_time: u64,
    },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Why.
        reason: String,
    },
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Create an error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&ManagerError> for ServerError {
    fn from(err: &ManagerError) -> Self {
        let code = match err {
            ManagerError::AlreadyExists => ErrorCode::AlreadyRegistered,
            ManagerError::PlayerNotFound => ErrorCode::NotRegistered,
            ManagerError::PlayerNotInSession | ManagerError::Unassigned => ErrorCode::NotInRace,
            ManagerError::RaceNotActive => ErrorCode::RaceNotActive,
            ManagerError::LobbyFull
            | ManagerError::LobbyNotFound
            | ManagerError::AlreadyInSession => ErrorCode::MatchmakingFailed,
            _ => ErrorCode::InternalError,
        };
        Self::new(code, err.to_string())
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed message.
    InvalidInput,
    /// Message requires a prior hello.
    NotRegistered,
    /// Player id already connected.
    AlreadyRegistered,
    /// No race to type into.
    NotInRace,
    /// Race is counting down or over.
    RaceNotActive,
    /// Could not seat the player.
    MatchmakingFailed,
    /// No hello within the timeout.
    Timeout,
    /// Internal error.
    InternalError,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Milliseconds since the Unix epoch.
pub fn server_time_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
