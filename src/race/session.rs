//! Race Session
//!
//! An active or finished race: a prompt, a fixed roster, the countdown and the
//! completion/ranking logic.
//!
//! ```text
//! Pending ──start()──▶ CountingDown ──3 ticks──▶ Active ──all finished──▶ Finished
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::race::events::{event_channel, publish, EventReceiver, EventSender, RaceEvent, Standing};
use crate::race::lobby::Lobby;
use crate::race::player::{Player, PlayerId, PlayerSnapshot};
use crate::race::prompt::Prompt;
use crate::{COUNTDOWN_SECONDS, MIN_PLAYERS};

/// Unique session identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Short hex form for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0.as_bytes()[..4])
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Roster copied in, waiting for `start()`.
    Pending,
    /// 3-2-1 countdown running.
    CountingDown,
    /// Race in progress.
    Active,
    /// Every racer finished.
    Finished,
}

/// Result of routing one progress update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    /// Player not in the roster, or already finished.
    Ignored,
    /// Stats recomputed.
    Updated,
    /// Player completed the prompt.
    PlayerFinished {
        /// Finishing place.
        place: usize,
    },
    /// Player completed the prompt and was the last one racing.
    RaceFinished {
        /// Finishing place.
        place: usize,
    },
}

/// A race.
#[derive(Debug)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    prompt: Prompt,
    capacity: usize,
    roster: BTreeMap<PlayerId, Player>,
    state: SessionState,
    countdown: u8,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    race_started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    event_tx: EventSender,
}

impl Session {
    /// Create an empty pending session.
    pub fn new(id: SessionId, prompt: Prompt, capacity: usize) -> Self {
        Self {
            id,
            prompt,
            capacity,
            roster: BTreeMap::new(),
            state: SessionState::Pending,
            countdown: 0,
            created_at: Utc::now(),
            started_at: None,
            race_started_at: None,
            ended_at: None,
            event_tx: event_channel(),
        }
    }

    /// Consume a lobby's members and event channel into a pending session.
    pub fn from_lobby(id: SessionId, lobby: &mut Lobby, prompt: Prompt) -> Self {
        let capacity = lobby.capacity();
        let (members, event_tx) = lobby.drain();

        let mut session = Self::new(id, prompt, capacity);
        session.event_tx = event_tx;
        session.roster = members.into_iter().map(|p| (p.id.clone(), p)).collect();
        publish(
            &session.event_tx,
            RaceEvent::Promoted {
                session_id: id,
                prompt: session.prompt.text.clone(),
                author: session.prompt.author.clone(),
            },
        );
        session
    }

    /// Add a player while still pending.
    pub fn add_player(&mut self, player: Player) -> Result<(), SessionError> {
        if self.state != SessionState::Pending {
            return Err(SessionError::SessionStarted);
        }

        if self.roster.len() >= self.capacity {
            return Err(SessionError::SessionFull);
        }

        self.roster.insert(player.id.clone(), player);
        self.publish_roster();
        Ok(())
    }

    /// Remove a player. A departure can complete an active race.
    pub fn remove_player(&mut self, player_id: &PlayerId) -> Option<Player> {
        let removed = self.roster.remove(player_id)?;
        self.publish_roster();
        self.check_completion();
        Some(removed)
    }

    fn publish_roster(&self) {
        publish(
            &self.event_tx,
            RaceEvent::RosterChanged {
                members: self.player_snapshots(),
            },
        );
    }

    /// Begin the countdown.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), SessionError> {
        if self.state != SessionState::Pending {
            return Err(SessionError::AlreadyStarted);
        }

        if self.roster.len() < MIN_PLAYERS {
            return Err(SessionError::NotEnoughPlayers);
        }

        self.state = SessionState::CountingDown;
        self.countdown = COUNTDOWN_SECONDS;
        self.started_at = Some(now);
        publish(
            &self.event_tx,
            RaceEvent::Countdown {
                remaining: self.countdown,
            },
        );
        Ok(())
    }

    /// Advance the countdown one step. Returns the remaining count, or `None`
    /// when the session is not counting down.
    pub fn tick_countdown(&mut self, now: DateTime<Utc>) -> Option<u8> {
        if self.state != SessionState::CountingDown {
            return None;
        }

        self.countdown = self.countdown.saturating_sub(1);
        publish(
            &self.event_tx,
            RaceEvent::Countdown {
                remaining: self.countdown,
            },
        );

        if self.countdown == 0 {
            self.begin_race(now);
        }

        Some(self.countdown)
    }

    fn begin_race(&mut self, now: DateTime<Utc>) {
        self.state = SessionState::Active;
        self.race_started_at = Some(now);
        for player in self.roster.values_mut() {
            player.begin(now);
        }
        publish(&self.event_tx, RaceEvent::Started);
    }

    /// Apply a player's typed text.
    pub fn route_progress(
        &mut self,
        player_id: &PlayerId,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<ProgressOutcome, SessionError> {
        if !self.roster.contains_key(player_id) {
            return Ok(ProgressOutcome::Ignored);
        }

        if self.state != SessionState::Active {
            return Err(SessionError::NotActive);
        }

        let prompt_len = self.prompt.len();
        let Some(player) = self.roster.get_mut(player_id) else {
            return Ok(ProgressOutcome::Ignored);
        };

        if player.is_finished() {
            return Ok(ProgressOutcome::Ignored);
        }

        player.apply_typed(text, &self.prompt.text, now);
        let just_finished = player.is_complete(prompt_len) && player.finish(now);
        let snapshot = player.snapshot(prompt_len);
        let (wpm, accuracy) = (snapshot.wpm, snapshot.accuracy);

        publish(&self.event_tx, RaceEvent::Progress(snapshot));

        if !just_finished {
            return Ok(ProgressOutcome::Updated);
        }

        let place = self.finished_count();
        publish(
            &self.event_tx,
            RaceEvent::PlayerFinished {
                player_id: player_id.clone(),
                place,
                wpm,
                accuracy,
            },
        );

        if self.check_completion() {
            Ok(ProgressOutcome::RaceFinished { place })
        } else {
            Ok(ProgressOutcome::PlayerFinished { place })
        }
    }

    /// Transition to Finished once every member is done.
    fn check_completion(&mut self) -> bool {
        if self.state != SessionState::Active
            || self.roster.is_empty()
            || !self.roster.values().all(Player::is_finished)
        {
            return false;
        }

        let last_finish = self.roster.values().filter_map(Player::ended_at).max();
        self.ended_at = [last_finish, self.started_at].into_iter().flatten().max();
        self.state = SessionState::Finished;

        info!(
            "Session {} finished with {} players",
            self.id.short(),
            self.roster.len()
        );
        publish(
            &self.event_tx,
            RaceEvent::Finished {
                leaderboard: self.standings(),
            },
        );
        true
    }

    /// Roster in finishing order: finished players first by end time, then
    /// unfinished players in roster order.
    pub fn leaderboard(&self) -> Vec<&Player> {
        let mut players: Vec<&Player> = self.roster.values().collect();
        players.sort_by(|a, b| finish_order(a, b));
        players
    }

    /// Leaderboard with 1-based places.
    pub fn standings(&self) -> Vec<Standing> {
        let prompt_len = self.prompt.len();
        self.leaderboard()
            .into_iter()
            .enumerate()
            .map(|(i, p)| Standing {
                place: i + 1,
                player: p.snapshot(prompt_len),
            })
            .collect()
    }

    fn finished_count(&self) -> usize {
        self.roster.values().filter(|p| p.is_finished()).count()
    }

    fn player_snapshots(&self) -> Vec<PlayerSnapshot> {
        let prompt_len = self.prompt.len();
        self.roster.values().map(|p| p.snapshot(prompt_len)).collect()
    }

    /// Racing (or counting down) for longer than `max_race`.
    pub fn is_stalled(&self, now: DateTime<Utc>, max_race: Duration) -> bool {
        if !matches!(self.state, SessionState::CountingDown | SessionState::Active) {
            return false;
        }
        self.started_at
            .is_some_and(|started| elapsed(started, now) >= max_race)
    }

    /// Finished for longer than `retention`.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        self.state == SessionState::Finished
            && self
                .ended_at
                .is_some_and(|ended| elapsed(ended, now) >= retention)
    }

    /// Tell subscribers the race is being dropped.
    pub(crate) fn abandon(&self) {
        publish(&self.event_tx, RaceEvent::Abandoned);
    }

    /// Tell subscribers a finished race is being dropped.
    pub(crate) fn close(&self) {
        publish(&self.event_tx, RaceEvent::Closed);
    }

    /// Subscribe to race events.
    pub fn subscribe(&self) -> EventReceiver {
        self.event_tx.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Countdown value.
    pub fn countdown(&self) -> u8 {
        self.countdown
    }

    /// Prompt being raced.
    pub fn prompt(&self) -> &Prompt {
        &self.prompt
    }

    /// Maximum roster size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Roster size.
    pub fn player_count(&self) -> usize {
        self.roster.len()
    }

    /// True once the last member left.
    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    /// Look up a racer.
    pub fn player(&self, player_id: &PlayerId) -> Option<&Player> {
        self.roster.get(player_id)
    }

    /// Racer ids in roster order.
    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.roster.keys().cloned().collect()
    }

    /// When the session was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the countdown began.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When typing opened.
    pub fn race_started_at(&self) -> Option<DateTime<Utc>> {
        self.race_started_at
    }

    /// When the last racer finished.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Serializable view.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            prompt: self.prompt.text.clone(),
            author: self.prompt.author.clone(),
            state: self.state,
            countdown: self.countdown,
            capacity: self.capacity,
            players: self.player_snapshots(),
            leaderboard: (self.state == SessionState::Finished).then(|| self.standings()),
        }
    }
}

/// Finished before unfinished; finished ordered by end time; unfinished equal.
fn finish_order(a: &Player, b: &Player) -> Ordering {
    match (a.is_finished(), b.is_finished()) {
        (true, true) => a.ended_at().cmp(&b.ended_at()),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => Ordering::Equal,
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// Run the countdown on a detached task.
///
/// The task cannot be cancelled. It only takes this session's lock and stops
/// as soon as the session is no longer counting down.
pub fn spawn_countdown(session: Arc<RwLock<Session>>, tick: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(tick).await;

            let mut s = session.write().await;
            match s.tick_countdown(Utc::now()) {
                Some(0) => {
                    info!("Session {} race started", s.id.short());
                    break;
                }
                Some(remaining) => {
                    debug!("Session {} countdown {}", s.id.short(), remaining);
                }
                None => break,
            }
        }
    })
}

/// Session state as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session identifier.
    pub session_id: SessionId,
    /// Prompt text.
    pub prompt: String,
    /// Prompt author.
    pub author: String,
    /// Race state.
    pub state: SessionState,
    /// Countdown value.
    pub countdown: u8,
    /// Maximum roster size.
    pub capacity: usize,
    /// Live racer stats.
    pub players: Vec<PlayerSnapshot>,
    /// Final ranking once finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaderboard: Option<Vec<Standing>>,
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Session is full.
    #[error("Session is full")]
    SessionFull,

    /// Roster closed because the race started.
    #[error("Session has already started")]
    SessionStarted,

    /// `start()` called twice.
    #[error("Session is already started")]
    AlreadyStarted,

    /// Fewer than two racers.
    #[error("Not enough players to start")]
    NotEnoughPlayers,

    /// Progress outside the active phase.
    #[error("Race is not active")]
    NotActive,
}

// =============================================================================
// TESTS
// =============================================================================
