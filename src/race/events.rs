//! Race Events
//!
//! Push notifications for connected clients. Each lobby owns a broadcast
//! channel of [`RaceEvent`]s; the channel moves into the session created from
//! that lobby, so a subscriber follows its group from waiting room to results
//! without resubscribing.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::race::player::{PlayerId, PlayerSnapshot};
use crate::race::session::SessionId;

/// Capacity of each group's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Sender half of a group's event channel.
pub type EventSender = broadcast::Sender<RaceEvent>;

/// Receiver half of a group's event channel.
pub type EventReceiver = broadcast::Receiver<RaceEvent>;

/// Create a new group event channel.
pub fn event_channel() -> EventSender {
    let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}

/// One place in the final ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standing {
    /// 1-based place.
    pub place: usize,
    /// Player state at ranking time.
    pub player: PlayerSnapshot,
}

/// Something observable happened to a lobby or session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RaceEvent {
    /// Group membership changed.
    RosterChanged {
        /// Current members.
        members: Vec<PlayerSnapshot>,
    },

    /// Lobby was promoted to a session.
    Promoted {
        /// New session identifier.
        session_id: SessionId,
        /// Prompt text to type.
        prompt: String,
        /// Prompt author.
        author: String,
    },

    /// Countdown value changed.
    Countdown {
        /// Seconds remaining.
        remaining: u8,
    },

    /// Countdown reached zero, typing is open.
    Started,

    /// A racer's progress changed.
    Progress(PlayerSnapshot),

    /// A racer completed the prompt.
    PlayerFinished {
        /// Who finished.
        player_id: PlayerId,
        /// Finishing place so far.
        place: usize,
        /// Final words per minute.
        wpm: f64,
        /// Final accuracy.
        accuracy: f64,
    },

    /// Every racer finished.
    Finished {
        /// Final ranking.
        leaderboard: Vec<Standing>,
    },

    /// Session was reaped before everyone finished.
    Abandoned,

    /// Finished session was reaped after its retention window.
    Closed,
}

/// Send an event, ignoring the no-subscriber case.
pub(crate) fn publish(tx: &EventSender, event: RaceEvent) {
    let _ = tx.send(event);
}
