//! Lobby
//!
//! Capacity-bounded waiting group. A lobby is ready once it holds two players;
//! the manager then consumes it into a session.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::race::events::{event_channel, publish, EventReceiver, EventSender, RaceEvent};
use crate::race::player::{Player, PlayerId, PlayerSnapshot};
use crate::MIN_PLAYERS;

/// Unique lobby identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LobbyId(uuid::Uuid);

impl LobbyId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Short hex form for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0.as_bytes()[..4])
    }
}

impl Default for LobbyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LobbyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A waiting room.
#[derive(Debug)]
pub struct Lobby {
    /// Unique lobby identifier.
    pub id: LobbyId,
    /// When the lobby was created.
    pub created_at: DateTime<Utc>,
    capacity: usize,
    members: BTreeMap<PlayerId, Player>,
    event_tx: EventSender,
}

impl Lobby {
    /// Create an empty lobby.
    pub fn new(id: LobbyId, capacity: usize) -> Result<Self, LobbyError> {
        if capacity < MIN_PLAYERS {
            return Err(LobbyError::InvalidCapacity(capacity));
        }

        Ok(Self {
            id,
            created_at: Utc::now(),
            capacity,
            members: BTreeMap::new(),
            event_tx: event_channel(),
        })
    }

    /// Add a player. Re-joining is a no-op.
    pub fn join(&mut self, player: Player) -> Result<(), LobbyError> {
        if self.members.contains_key(&player.id) {
            return Ok(());
        }

        if self.members.len() >= self.capacity {
            return Err(LobbyError::Full);
        }

        self.members.insert(player.id.clone(), player);
        self.publish_roster();
        Ok(())
    }

    /// Remove a player, returning its record if it was a member.
    pub fn leave(&mut self, player_id: &PlayerId) -> Option<Player> {
        let removed = self.members.remove(player_id);
        if removed.is_some() {
            self.publish_roster();
        }
        removed
    }

    fn publish_roster(&self) {
        publish(
            &self.event_tx,
            RaceEvent::RosterChanged {
                members: self.member_snapshots(),
            },
        );
    }

    /// Snapshot of current members.
    pub fn members(&self) -> Vec<Player> {
        self.members.values().cloned().collect()
    }

    /// Client view of current members.
    pub fn member_snapshots(&self) -> Vec<PlayerSnapshot> {
        self.members.values().map(|p| p.snapshot(0)).collect()
    }

    /// Whether a player is a member.
    pub fn contains(&self, player_id: &PlayerId) -> bool {
        self.members.contains_key(player_id)
    }

    /// Member count.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True when nobody is waiting.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Maximum members.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Room for at least one more player.
    pub fn has_capacity(&self) -> bool {
        self.members.len() < self.capacity
    }

    /// Enough players to race.
    pub fn is_ready(&self) -> bool {
        self.members.len() >= MIN_PLAYERS
    }

    /// Subscribe to this group's events.
    pub fn subscribe(&self) -> EventReceiver {
        self.event_tx.subscribe()
    }

    /// Hand the membership and event channel over to a session.
    pub(crate) fn drain(&mut self) -> (Vec<Player>, EventSender) {
        let members = std::mem::take(&mut self.members).into_values().collect();
        (members, self.event_tx.clone())
    }

    /// Serializable view.
    pub fn snapshot(&self) -> LobbySnapshot {
        LobbySnapshot {
            lobby_id: self.id,
            capacity: self.capacity,
            members: self.member_snapshots(),
            ready: self.is_ready(),
        }
    }
}

/// Lobby state as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbySnapshot {
    /// Lobby identifier.
    pub lobby_id: LobbyId,
    /// Maximum members.
    pub capacity: usize,
    /// Waiting players.
    pub members: Vec<PlayerSnapshot>,
    /// Enough players to start.
    pub ready: bool,
}

/// Lobby errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    /// Lobby is at capacity.
    #[error("Lobby is full")]
    Full,

    /// Capacity below the two-player minimum.
    #[error("Invalid lobby capacity {0}")]
    InvalidCapacity(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(id: &str) -> Player {
        Player::new(PlayerId::new(id), id)
    }

    #[test]
    fn test_capacity_must_allow_a_race() {
        assert!(matches!(
            Lobby::new(LobbyId::new(), 1),
            Err(LobbyError::InvalidCapacity(1))
        ));
        assert!(Lobby::new(LobbyId::new(), 2).is_ok());
    }

    #[test]
    fn test_join_until_full() {
        let mut lobby = Lobby::new(LobbyId::new(), 2).unwrap();

        lobby.join(player("a")).unwrap();
        assert!(!lobby.is_ready());
        lobby.join(player("b")).unwrap();
        assert!(lobby.is_ready());
        assert!(!lobby.has_capacity());

        assert_eq!(lobby.join(player("c")), Err(LobbyError::Full));
        assert_eq!(lobby.len(), 2);
    }

    #[test]
    fn test_rejoin_is_noop() {
        let mut lobby = Lobby::new(LobbyId::new(), 2).unwrap();
        lobby.join(player("a")).unwrap();
        lobby.join(player("a")).unwrap();
        assert_eq!(lobby.len(), 1);
    }

    #[test]
    fn test_leave_absent_is_silent() {
        let mut lobby = Lobby::new(LobbyId::new(), 4).unwrap();
        lobby.join(player("a")).unwrap();

        assert!(lobby.leave(&PlayerId::new("zzz")).is_none());
        assert!(lobby.leave(&PlayerId::new("a")).is_some());
        assert!(lobby.is_empty());
    }

    #[tokio::test]
    async fn test_roster_events() {
        let mut lobby = Lobby::new(LobbyId::new(), 4).unwrap();
        let mut rx = lobby.subscribe();

        lobby.join(player("a")).unwrap();
        match rx.recv().await.unwrap() {
            RaceEvent::RosterChanged { members } => assert_eq!(members.len(), 1),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_drain_empties_lobby() {
        let mut lobby = Lobby::new(LobbyId::new(), 4).unwrap();
        lobby.join(player("a")).unwrap();
        lobby.join(player("b")).unwrap();

        let (members, _tx) = lobby.drain();
        assert_eq!(members.len(), 2);
        assert!(lobby.is_empty());
    }
}
