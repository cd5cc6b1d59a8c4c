//! Race Manager
//!
//! Process-wide registry of players, lobbies and sessions. Owns matchmaking,
//! lobby-to-session promotion, progress routing and stalled-session reaping.
//!
//! ## Locking
//!
//! All registries sit behind one `RwLock`. Lobbies and sessions each carry
//! their own lock. Acquisition order is always registry, then entity; entities
//! never call back into the manager.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, trace, warn};

use crate::race::events::EventReceiver;
use crate::race::lobby::{Lobby, LobbyError, LobbyId, LobbySnapshot};
use crate::race::player::{Player, PlayerId};
use crate::race::practice::PracticeRun;
use crate::race::prompt::{Prompt, PromptSource};
use crate::race::session::{
    spawn_countdown, ProgressOutcome, Session, SessionError, SessionId, SessionSnapshot,
};
use crate::{DEFAULT_LOBBY_CAPACITY, MIN_PLAYERS};

/// Join attempts before matchmaking gives up on lobbies filling under it.
const MATCHMAKING_ATTEMPTS: usize = 8;

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Capacity of lobbies created by matchmaking.
    pub lobby_capacity: usize,
    /// Interval between countdown steps.
    pub countdown_tick: Duration,
    /// Sessions racing longer than this are abandoned by the reaper.
    pub max_race_duration: Duration,
    /// Finished sessions are kept this long for result screens.
    pub finished_retention: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            lobby_capacity: DEFAULT_LOBBY_CAPACITY,
            countdown_tick: Duration::from_secs(1),
            max_race_duration: Duration::from_secs(600),
            finished_retention: Duration::from_secs(60),
        }
    }
}

impl ManagerConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            lobby_capacity: env_or("TYPERACE_LOBBY_CAPACITY", defaults.lobby_capacity)
                .max(MIN_PLAYERS),
            countdown_tick: Duration::from_millis(env_or(
                "TYPERACE_COUNTDOWN_TICK_MS",
                defaults.countdown_tick.as_millis() as u64,
            )),
            max_race_duration: Duration::from_secs(env_or(
                "TYPERACE_MAX_RACE_SECS",
                defaults.max_race_duration.as_secs(),
            )),
            finished_retention: Duration::from_secs(env_or(
                "TYPERACE_FINISHED_RETENTION_SECS",
                defaults.finished_retention.as_secs(),
            )),
        }
    }
}

/// Read and parse an environment variable, warning on garbage.
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

/// Where a player currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Membership {
    /// Waiting in a lobby.
    Lobby(LobbyId),
    /// Racing (or looking at results) in a session.
    Session(SessionId),
}

/// What a connected client should display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum PlayerView {
    /// Registered but not matched.
    Idle,
    /// Waiting room.
    Lobby(LobbySnapshot),
    /// Race.
    Session(SessionSnapshot),
}

/// Registry counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Registered players.
    pub total_players: usize,
    /// Open lobbies.
    pub active_lobbies: usize,
    /// Sessions in any state.
    pub active_sessions: usize,
}

struct PlayerEntry {
    name: String,
    membership: Option<Membership>,
}

#[derive(Default)]
struct Registry {
    players: BTreeMap<PlayerId, PlayerEntry>,
    lobbies: BTreeMap<LobbyId, Arc<RwLock<Lobby>>>,
    sessions: BTreeMap<SessionId, Arc<RwLock<Session>>>,
}

/// The matchmaking and race registry.
pub struct Manager {
    config: ManagerConfig,
    registry: RwLock<Registry>,
    prompts: Arc<dyn PromptSource>,
}

impl Manager {
    /// Create an empty manager.
    pub fn new(config: ManagerConfig, prompts: Arc<dyn PromptSource>) -> Self {
        Self {
            config,
            registry: RwLock::new(Registry::default()),
            prompts,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // =========================================================================
    // PLAYERS
    // =========================================================================

    /// Register a player.
    ///
    /// The returned [`Player`] is a detached copy of the registration. Lobbies
    /// and sessions seat their own records, so it never sees progress; use
    /// [`Manager::player_view`] or [`Manager::subscribe`] to observe a race.
    pub async fn add_player(
        &self,
        player_id: PlayerId,
        name: impl Into<String>,
    ) -> Result<Player, ManagerError> {
        let name = name.into();
        let mut reg = self.registry.write().await;

        if reg.players.contains_key(&player_id) {
            return Err(ManagerError::AlreadyExists);
        }

        reg.players.insert(
            player_id.clone(),
            PlayerEntry {
                name: name.clone(),
                membership: None,
            },
        );

        info!("Player {} ({}) registered", name, player_id);
        Ok(Player::new(player_id, name))
    }

    /// Deregister a player, leaving any lobby or session first. No-op if absent.
    pub async fn remove_player(&self, player_id: &PlayerId) {
        let mut reg = self.registry.write().await;

        let Some(entry) = reg.players.remove(player_id) else {
            return;
        };

        if let Some(membership) = entry.membership {
            Self::release(&mut reg, player_id, membership).await;
        }

        info!("Player {} removed", player_id);
    }

    /// Leave the current lobby or session but stay registered.
    pub async fn detach_player(&self, player_id: &PlayerId) -> Result<(), ManagerError> {
        let mut reg = self.registry.write().await;

        let membership = reg
            .players
            .get_mut(player_id)
            .ok_or(ManagerError::PlayerNotFound)?
            .membership
            .take();

        if let Some(membership) = membership {
            Self::release(&mut reg, player_id, membership).await;
        }
        Ok(())
    }

    /// Drop a player from a group, deleting the group once empty.
    async fn release(reg: &mut Registry, player_id: &PlayerId, membership: Membership) {
        match membership {
            Membership::Lobby(lobby_id) => {
                let Some(lobby) = reg.lobbies.get(&lobby_id).cloned() else {
                    return;
                };
                let empty = {
                    let mut lobby = lobby.write().await;
                    lobby.leave(player_id);
                    lobby.is_empty()
                };
                if empty {
                    reg.lobbies.remove(&lobby_id);
                    debug!("Lobby {} closed", lobby_id.short());
                }
            }
            Membership::Session(session_id) => {
                let Some(session) = reg.sessions.get(&session_id).cloned() else {
                    return;
                };
                let empty = {
                    let mut session = session.write().await;
                    session.remove_player(player_id);
                    session.is_empty()
                };
                if empty {
                    reg.sessions.remove(&session_id);
                    debug!("Session {} closed", session_id.short());
                }
            }
        }
    }

    /// Current lobby or session of a player.
    pub async fn membership(
        &self,
        player_id: &PlayerId,
    ) -> Result<Option<Membership>, ManagerError> {
        let reg = self.registry.read().await;
        reg.players
            .get(player_id)
            .map(|entry| entry.membership)
            .ok_or(ManagerError::PlayerNotFound)
    }

    // =========================================================================
    // LOBBIES
    // =========================================================================

    /// Create an empty lobby.
    pub async fn create_lobby(&self, capacity: usize) -> Result<LobbyId, ManagerError> {
        let mut reg = self.registry.write().await;
        Self::insert_lobby(&mut reg, capacity)
    }

    fn insert_lobby(reg: &mut Registry, capacity: usize) -> Result<LobbyId, ManagerError> {
        let lobby = Lobby::new(LobbyId::new(), capacity)?;
        let lobby_id = lobby.id;
        reg.lobbies.insert(lobby_id, Arc::new(RwLock::new(lobby)));

        info!("Created lobby {} with max {} players", lobby_id.short(), capacity);
        Ok(lobby_id)
    }

    /// Put a player into a lobby, moving it out of any other lobby.
    pub async fn join_lobby(
        &self,
        player_id: &PlayerId,
        lobby_id: &LobbyId,
    ) -> Result<(), ManagerError> {
        let mut reg = self.registry.write().await;

        let entry = reg.players.get(player_id).ok_or(ManagerError::PlayerNotFound)?;
        let name = entry.name.clone();
        let previous = entry.membership;

        match previous {
            Some(Membership::Session(_)) => return Err(ManagerError::AlreadyInSession),
            Some(Membership::Lobby(current)) if current == *lobby_id => return Ok(()),
            _ => {}
        }

        let lobby = reg
            .lobbies
            .get(lobby_id)
            .cloned()
            .ok_or(ManagerError::LobbyNotFound)?;
        lobby
            .write()
            .await
            .join(Player::new(player_id.clone(), name))?;

        if let Some(previous) = previous {
            Self::release(&mut reg, player_id, previous).await;
        }
        if let Some(entry) = reg.players.get_mut(player_id) {
            entry.membership = Some(Membership::Lobby(*lobby_id));
        }

        info!("Player {} joined lobby {}", player_id, lobby_id.short());
        Ok(())
    }

    /// Take a player out of a lobby. Deletes the lobby once empty.
    pub async fn leave_lobby(&self, player_id: &PlayerId, lobby_id: &LobbyId) {
        let mut reg = self.registry.write().await;

        if let Some(entry) = reg.players.get_mut(player_id) {
            if entry.membership == Some(Membership::Lobby(*lobby_id)) {
                entry.membership = None;
            }
        }

        Self::release(&mut reg, player_id, Membership::Lobby(*lobby_id)).await;
    }

    /// Any lobby with a free seat, creating one when none exists.
    ///
    /// Picks the earliest-created open lobby; ties break on id.
    pub async fn find_or_create_lobby(
        &self,
        default_capacity: usize,
    ) -> Result<LobbyId, ManagerError> {
        let mut reg = self.registry.write().await;

        let mut open: Option<(DateTime<Utc>, LobbyId)> = None;
        for (id, lobby) in reg.lobbies.iter() {
            let lobby = lobby.read().await;
            if lobby.has_capacity() {
                let candidate = (lobby.created_at, *id);
                if open.map_or(true, |best| candidate < best) {
                    open = Some(candidate);
                }
            }
        }

        match open {
            Some((_, lobby_id)) => Ok(lobby_id),
            None => Self::insert_lobby(&mut reg, default_capacity),
        }
    }

    /// Lobbies that can take another player, oldest first.
    pub async fn available_lobbies(&self) -> Vec<LobbySnapshot> {
        let reg = self.registry.read().await;

        let mut open = Vec::new();
        for lobby in reg.lobbies.values() {
            let lobby = lobby.read().await;
            if lobby.has_capacity() {
                open.push((lobby.created_at, lobby.snapshot()));
            }
        }

        open.sort_by(|a, b| a.0.cmp(&b.0));
        open.into_iter().map(|(_, snapshot)| snapshot).collect()
    }

    /// Look up a lobby.
    pub async fn lobby(&self, lobby_id: &LobbyId) -> Option<Arc<RwLock<Lobby>>> {
        self.registry.read().await.lobbies.get(lobby_id).cloned()
    }

    // =========================================================================
    // SESSIONS
    // =========================================================================

    /// Promote a ready lobby into a session and start its countdown.
    ///
    /// The prompt is fetched before any lock is taken. The lobby disappears
    /// from the registry in the same write-locked step that inserts the
    /// session.
    #[instrument(skip(self), fields(lobby = %lobby_id.short()))]
    pub async fn start_session_from_lobby(
        &self,
        lobby_id: &LobbyId,
    ) -> Result<Arc<RwLock<Session>>, ManagerError> {
        let lobby = self.lobby(lobby_id).await.ok_or(ManagerError::LobbyNotFound)?;
        if !lobby.read().await.is_ready() {
            return Err(ManagerError::NotEnoughPlayers);
        }

        // Discarded if the lobby is gone or short by the time we lock.
        let prompt = self.fetch_prompt().await;

        let session = {
            let mut reg = self.registry.write().await;

            let lobby = reg
                .lobbies
                .get(lobby_id)
                .cloned()
                .ok_or(ManagerError::LobbyNotFound)?;

            let mut session = {
                let mut lobby = lobby.write().await;
                if !lobby.is_ready() {
                    return Err(ManagerError::NotEnoughPlayers);
                }
                Session::from_lobby(SessionId::new(), &mut lobby, prompt)
            };
            session.start(Utc::now())?;

            let session_id = session.id;
            reg.lobbies.remove(lobby_id);
            for player_id in session.player_ids() {
                if let Some(entry) = reg.players.get_mut(&player_id) {
                    entry.membership = Some(Membership::Session(session_id));
                }
            }

            info!(
                "Started session {} with {} players",
                session_id.short(),
                session.player_count()
            );

            let session = Arc::new(RwLock::new(session));
            reg.sessions.insert(session_id, session.clone());
            session
        };

        spawn_countdown(session.clone(), self.config.countdown_tick);
        Ok(session)
    }

    /// Next prompt from the source, run on the blocking pool since sources
    /// may do I/O.
    pub async fn fetch_prompt(&self) -> Prompt {
        let prompts = self.prompts.clone();
        match tokio::task::spawn_blocking(move || prompts.next_prompt()).await {
            Ok(prompt) if !prompt.is_empty() => prompt,
            Ok(_) => Prompt::fallback(),
            Err(e) => {
                warn!("Prompt source failed: {}", e);
                Prompt::fallback()
            }
        }
    }

    /// Look up a session.
    pub async fn session(&self, session_id: &SessionId) -> Option<Arc<RwLock<Session>>> {
        self.registry.read().await.sessions.get(session_id).cloned()
    }

    /// Snapshot of a session.
    pub async fn session_view(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionSnapshot, ManagerError> {
        let session = self
            .session(session_id)
            .await
            .ok_or(ManagerError::SessionNotFound)?;
        let snapshot = session.read().await.snapshot();
        Ok(snapshot)
    }

    /// Seat a player: find or create a lobby, join it, and promote the lobby
    /// as soon as it is ready.
    #[instrument(skip(self), fields(player = %player_id))]
    pub async fn matchmake(&self, player_id: &PlayerId) -> Result<Membership, ManagerError> {
        for attempt in 1..=MATCHMAKING_ATTEMPTS {
            let lobby_id = self.find_or_create_lobby(self.config.lobby_capacity).await?;

            match self.join_lobby(player_id, &lobby_id).await {
                Ok(()) => return self.promote_if_ready(player_id, &lobby_id).await,
                Err(ManagerError::LobbyFull) | Err(ManagerError::LobbyNotFound) => {
                    debug!(
                        "Lobby {} filled before join (attempt {})",
                        lobby_id.short(),
                        attempt
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(ManagerError::LobbyFull)
    }

    async fn promote_if_ready(
        &self,
        player_id: &PlayerId,
        lobby_id: &LobbyId,
    ) -> Result<Membership, ManagerError> {
        let ready = match self.lobby(lobby_id).await {
            Some(lobby) => lobby.read().await.is_ready(),
            None => false,
        };

        if ready {
            match self.start_session_from_lobby(lobby_id).await {
                // Another member's handler may have promoted it first.
                Ok(_) | Err(ManagerError::LobbyNotFound) | Err(ManagerError::NotEnoughPlayers) => {}
                Err(e) => return Err(e),
            }
        }

        self.membership(player_id)
            .await?
            .ok_or(ManagerError::Unassigned)
    }

    /// Route typed text to the player's session.
    pub async fn route_progress(
        &self,
        player_id: &PlayerId,
        text: &str,
    ) -> Result<ProgressOutcome, ManagerError> {
        let session = {
            let reg = self.registry.read().await;
            let membership = reg.players.get(player_id).and_then(|entry| entry.membership);
            let found = match membership {
                Some(Membership::Session(session_id)) => reg.sessions.get(&session_id).cloned(),
                _ => None,
            };
            found.ok_or(ManagerError::PlayerNotInSession)?
        };

        let mut session = session.write().await;
        let outcome = session.route_progress(player_id, text, Utc::now())?;

        match outcome {
            ProgressOutcome::PlayerFinished { place } => {
                info!(
                    "Player {} finished #{} in session {}",
                    player_id,
                    place,
                    session.id.short()
                );
            }
            ProgressOutcome::RaceFinished { place } => {
                info!(
                    "Player {} finished #{} (last) in session {}",
                    player_id,
                    place,
                    session.id.short()
                );
            }
            _ => trace!("Progress from {} ({} chars)", player_id, text.len()),
        }

        Ok(outcome)
    }

    // =========================================================================
    // OBSERVATION
    // =========================================================================

    /// Event feed of the player's current lobby or session.
    ///
    /// The feed survives promotion: a lobby subscriber keeps receiving the
    /// session's events.
    pub async fn subscribe(&self, player_id: &PlayerId) -> Result<EventReceiver, ManagerError> {
        let reg = self.registry.read().await;
        let membership = reg
            .players
            .get(player_id)
            .ok_or(ManagerError::PlayerNotFound)?
            .membership;

        match membership {
            Some(Membership::Lobby(lobby_id)) => {
                let lobby = reg.lobbies.get(&lobby_id).ok_or(ManagerError::LobbyNotFound)?;
                let rx = lobby.read().await.subscribe();
                Ok(rx)
            }
            Some(Membership::Session(session_id)) => {
                let session = reg
                    .sessions
                    .get(&session_id)
                    .ok_or(ManagerError::SessionNotFound)?;
                let rx = session.read().await.subscribe();
                Ok(rx)
            }
            None => Err(ManagerError::Unassigned),
        }
    }

    /// What the player's display should show right now.
    pub async fn player_view(&self, player_id: &PlayerId) -> Result<PlayerView, ManagerError> {
        let reg = self.registry.read().await;
        let membership = reg
            .players
            .get(player_id)
            .ok_or(ManagerError::PlayerNotFound)?
            .membership;

        let view = match membership {
            Some(Membership::Lobby(lobby_id)) => match reg.lobbies.get(&lobby_id) {
                Some(lobby) => PlayerView::Lobby(lobby.read().await.snapshot()),
                None => PlayerView::Idle,
            },
            Some(Membership::Session(session_id)) => match reg.sessions.get(&session_id) {
                Some(session) => PlayerView::Session(session.read().await.snapshot()),
                None => PlayerView::Idle,
            },
            None => PlayerView::Idle,
        };
        Ok(view)
    }

    /// Registry counts.
    pub async fn status(&self) -> SystemStatus {
        let reg = self.registry.read().await;
        SystemStatus {
            total_players: reg.players.len(),
            active_lobbies: reg.lobbies.len(),
            active_sessions: reg.sessions.len(),
        }
    }

    // =========================================================================
    // PRACTICE
    // =========================================================================

    /// Leave any lobby or race and start a solo run on a fresh prompt.
    ///
    /// The run belongs to the caller; the player shows as idle here.
    pub async fn start_practice(&self, player_id: &PlayerId) -> Result<PracticeRun, ManagerError> {
        let name = {
            let reg = self.registry.read().await;
            reg.players
                .get(player_id)
                .ok_or(ManagerError::PlayerNotFound)?
                .name
                .clone()
        };

        self.detach_player(player_id).await?;
        let prompt = self.fetch_prompt().await;

        debug!("Player {} practicing", player_id);
        Ok(PracticeRun::new(player_id.clone(), name, prompt, Utc::now()))
    }

    // =========================================================================
    // REAPING
    // =========================================================================

    /// Drop finished sessions past retention and races running past the
    /// maximum duration. Returns the number of sessions removed.
    pub async fn reap(&self, now: DateTime<Utc>) -> usize {
        let mut reg = self.registry.write().await;

        let mut doomed = Vec::new();
        for (session_id, session) in reg.sessions.iter() {
            let session = session.read().await;
            if session.is_expired(now, self.config.finished_retention) {
                session.close();
                doomed.push((*session_id, session.player_ids(), false));
            } else if session.is_stalled(now, self.config.max_race_duration) {
                session.abandon();
                doomed.push((*session_id, session.player_ids(), true));
            }
        }

        let removed = doomed.len();
        for (session_id, player_ids, abandoned) in doomed {
            reg.sessions.remove(&session_id);
            for player_id in player_ids {
                if let Some(entry) = reg.players.get_mut(&player_id) {
                    if entry.membership == Some(Membership::Session(session_id)) {
                        entry.membership = None;
                    }
                }
            }

            if abandoned {
                warn!("Abandoned stalled session {}", session_id.short());
            } else {
                debug!("Reaped finished session {}", session_id.short());
            }
        }

        removed
    }
}

/// Manager errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    /// Player id already registered.
    #[error("Player already exists")]
    AlreadyExists,

    /// Unknown player.
    #[error("Player not found")]
    PlayerNotFound,

    /// Unknown lobby.
    #[error("Lobby not found")]
    LobbyNotFound,

    /// Unknown session.
    #[error("Session not found")]
    SessionNotFound,

    /// Lobby at capacity.
    #[error("Lobby is full")]
    LobbyFull,

    /// Session at capacity.
    #[error("Session is full")]
    SessionFull,

    /// Session roster closed.
    #[error("Session has already started")]
    SessionStarted,

    /// Session started twice.
    #[error("Session is already started")]
    AlreadyStarted,

    /// Fewer than two players.
    #[error("Not enough players to start")]
    NotEnoughPlayers,

    /// Progress for a player outside any session.
    #[error("Player not in any session")]
    PlayerNotInSession,

    /// Player is racing and cannot join a lobby.
    #[error("Player is already in a session")]
    AlreadyInSession,

    /// Player is neither waiting nor racing.
    #[error("Player is not in a lobby or session")]
    Unassigned,

    /// Capacity below the two-player minimum.
    #[error("Invalid lobby capacity {0}")]
    InvalidCapacity(usize),

    /// Progress outside the active phase.
    #[error("Race is not active")]
    RaceNotActive,
}

impl From<LobbyError> for ManagerError {
    fn from(err: LobbyError) -> Self {
        match err {
            LobbyError::Full => ManagerError::LobbyFull,
            LobbyError::InvalidCapacity(capacity) => ManagerError::InvalidCapacity(capacity),
        }
    }
}

impl From<SessionError> for ManagerError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::SessionFull => ManagerError::SessionFull,
            SessionError::SessionStarted => ManagerError::SessionStarted,
            SessionError::AlreadyStarted => ManagerError::AlreadyStarted,
            SessionError::NotEnoughPlayers => ManagerError::NotEnoughPlayers,
            SessionError::NotActive => ManagerError::RaceNotActive,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::race::events::RaceEvent;
    use crate::race::prompt::Prompt;
    use crate::race::session::SessionState;

    struct FixedPrompt(&'static str);

    impl PromptSource for FixedPrompt {
        fn next_prompt(&self) -> Prompt {
            Prompt::new(self.0, "test")
        }
    }

    fn create_test_manager(prompt: &'static str) -> Manager {
        let config = ManagerConfig {
            countdown_tick: Duration::from_millis(5),
            ..Default::default()
        };
        Manager::new(config, Arc::new(FixedPrompt(prompt)))
    }

    fn pid(id: &str) -> PlayerId {
        PlayerId::new(id)
    }

    async fn register(manager: &Manager, ids: &[&str]) {
        for id in ids {
            manager.add_player(pid(id), *id).await.unwrap();
        }
    }

    async fn wait_for_state(session: &Arc<RwLock<Session>>, state: SessionState) {
        for _ in 0..400 {
            if session.read().await.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never reached {:?}", state);
    }

    #[tokio::test]
    async fn test_add_player_twice() {
        let manager = create_test_manager("cat");
        register(&manager, &["a"]).await;

        let result = manager.add_player(pid("a"), "again").await;
        assert!(matches!(result, Err(ManagerError::AlreadyExists)));
        assert_eq!(manager.status().await.total_players, 1);
    }

    #[tokio::test]
    async fn test_create_lobby_capacity() {
        let manager = create_test_manager("cat");
        assert_eq!(
            manager.create_lobby(1).await,
            Err(ManagerError::InvalidCapacity(1))
        );
        assert!(manager.create_lobby(2).await.is_ok());
    }

    #[tokio::test]
    async fn test_join_lobby_errors() {
        let manager = create_test_manager("cat");
        register(&manager, &["a", "b", "c"]).await;
        let lobby_id = manager.create_lobby(2).await.unwrap();

        assert_eq!(
            manager.join_lobby(&pid("ghost"), &lobby_id).await,
            Err(ManagerError::PlayerNotFound)
        );
        assert_eq!(
            manager.join_lobby(&pid("a"), &LobbyId::new()).await,
            Err(ManagerError::LobbyNotFound)
        );

        manager.join_lobby(&pid("a"), &lobby_id).await.unwrap();
        manager.join_lobby(&pid("b"), &lobby_id).await.unwrap();
        assert_eq!(
            manager.join_lobby(&pid("c"), &lobby_id).await,
            Err(ManagerError::LobbyFull)
        );
    }

    #[tokio::test]
    async fn test_lobby_promotion_removes_lobby() {
        let manager = create_test_manager("cat");
        register(&manager, &["a", "b"]).await;
        let lobby_id = manager.create_lobby(2).await.unwrap();

        manager.join_lobby(&pid("a"), &lobby_id).await.unwrap();
        let lobby = manager.lobby(&lobby_id).await.unwrap();
        assert!(!lobby.read().await.is_ready());

        manager.join_lobby(&pid("b"), &lobby_id).await.unwrap();
        assert!(lobby.read().await.is_ready());

        let session = manager.start_session_from_lobby(&lobby_id).await.unwrap();
        assert!(manager.lobby(&lobby_id).await.is_none());
        assert_eq!(session.read().await.capacity(), 2);

        let status = manager.status().await;
        assert_eq!(status.active_lobbies, 0);
        assert_eq!(status.active_sessions, 1);

        let session_id = session.read().await.id;
        assert_eq!(
            manager.membership(&pid("a")).await.unwrap(),
            Some(Membership::Session(session_id))
        );
    }

    #[tokio::test]
    async fn test_start_needs_two_players() {
        let manager = create_test_manager("cat");
        register(&manager, &["a"]).await;
        let lobby_id = manager.create_lobby(4).await.unwrap();
        manager.join_lobby(&pid("a"), &lobby_id).await.unwrap();

        let result = manager.start_session_from_lobby(&lobby_id).await;
        assert!(matches!(result, Err(ManagerError::NotEnoughPlayers)));
        assert!(manager.lobby(&lobby_id).await.is_some());

        let missing = manager.start_session_from_lobby(&LobbyId::new()).await;
        assert!(matches!(missing, Err(ManagerError::LobbyNotFound)));
    }

    #[tokio::test]
    async fn test_remove_player_cascades() {
        let manager = create_test_manager("cat");
        register(&manager, &["a", "b", "c"]).await;

        let lobby_id = manager.create_lobby(4).await.unwrap();
        manager.join_lobby(&pid("a"), &lobby_id).await.unwrap();
        manager.remove_player(&pid("a")).await;
        assert!(manager.lobby(&lobby_id).await.is_none());

        let lobby_id = manager.create_lobby(4).await.unwrap();
        manager.join_lobby(&pid("b"), &lobby_id).await.unwrap();
        manager.join_lobby(&pid("c"), &lobby_id).await.unwrap();
        let session = manager.start_session_from_lobby(&lobby_id).await.unwrap();
        let session_id = session.read().await.id;

        manager.remove_player(&pid("b")).await;
        assert!(manager.session(&session_id).await.is_some());
        manager.remove_player(&pid("c")).await;
        assert!(manager.session(&session_id).await.is_none());

        // Absent player is a no-op
        manager.remove_player(&pid("c")).await;
        assert_eq!(manager.status().await.total_players, 0);
    }

    #[tokio::test]
    async fn test_route_progress_through_race() {
        let manager = create_test_manager("cat");
        register(&manager, &["a", "b"]).await;

        assert_eq!(
            manager.route_progress(&pid("a"), "c").await,
            Err(ManagerError::PlayerNotInSession)
        );

        let lobby_id = manager.create_lobby(2).await.unwrap();
        manager.join_lobby(&pid("a"), &lobby_id).await.unwrap();
        assert_eq!(
            manager.route_progress(&pid("a"), "c").await,
            Err(ManagerError::PlayerNotInSession)
        );
        manager.join_lobby(&pid("b"), &lobby_id).await.unwrap();

        let session = manager.start_session_from_lobby(&lobby_id).await.unwrap();
        assert_eq!(
            manager.route_progress(&pid("a"), "c").await,
            Err(ManagerError::RaceNotActive)
        );

        wait_for_state(&session, SessionState::Active).await;

        assert_eq!(
            manager.route_progress(&pid("a"), "ca").await,
            Ok(ProgressOutcome::Updated)
        );
        assert_eq!(
            manager.route_progress(&pid("b"), "cat").await,
            Ok(ProgressOutcome::PlayerFinished { place: 1 })
        );
        assert_eq!(
            manager.route_progress(&pid("a"), "cat").await,
            Ok(ProgressOutcome::RaceFinished { place: 2 })
        );

        let s = session.read().await;
        assert_eq!(s.state(), SessionState::Finished);
        let order: Vec<&str> = s.leaderboard().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(order, vec!["b", "a"]);
        assert!(s.ended_at().unwrap() >= s.started_at().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_respect_capacity() {
        let manager = Arc::new(create_test_manager("cat"));
        let ids: Vec<String> = (0..10).map(|i| format!("p{}", i)).collect();
        for id in &ids {
            manager.add_player(pid(id), id.clone()).await.unwrap();
        }
        let lobby_id = manager.create_lobby(4).await.unwrap();

        let handles: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.join_lobby(&PlayerId::new(id), &lobby_id).await })
            })
            .collect();

        let mut joined = 0;
        let mut full = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => joined += 1,
                Err(ManagerError::LobbyFull) => full += 1,
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }

        assert_eq!(joined, 4);
        assert_eq!(full, 6);
        let lobby = manager.lobby(&lobby_id).await.unwrap();
        assert_eq!(lobby.read().await.len(), 4);
    }

    #[tokio::test]
    async fn test_find_or_create_lobby() {
        let manager = create_test_manager("cat");
        register(&manager, &["a", "b"]).await;

        let first = manager.find_or_create_lobby(2).await.unwrap();
        assert_eq!(manager.find_or_create_lobby(2).await.unwrap(), first);

        manager.join_lobby(&pid("a"), &first).await.unwrap();
        manager.join_lobby(&pid("b"), &first).await.unwrap();

        let second = manager.find_or_create_lobby(2).await.unwrap();
        assert_ne!(second, first);
        assert_eq!(manager.available_lobbies().await.len(), 1);
    }

    #[tokio::test]
    async fn test_matchmake_promotes_second_player() {
        let manager = create_test_manager("cat");
        register(&manager, &["a", "b", "c"]).await;

        let first = manager.matchmake(&pid("a")).await.unwrap();
        assert!(matches!(first, Membership::Lobby(_)));

        let second = manager.matchmake(&pid("b")).await.unwrap();
        let Membership::Session(session_id) = second else {
            panic!("expected session, got {:?}", second);
        };
        assert_eq!(
            manager.membership(&pid("a")).await.unwrap(),
            Some(Membership::Session(session_id))
        );

        // Third player starts a fresh lobby
        let third = manager.matchmake(&pid("c")).await.unwrap();
        assert!(matches!(third, Membership::Lobby(_)));
    }

    #[tokio::test]
    async fn test_join_moves_between_lobbies_but_not_out_of_session() {
        let manager = create_test_manager("cat");
        register(&manager, &["a", "b", "c"]).await;

        let one = manager.create_lobby(4).await.unwrap();
        let two = manager.create_lobby(4).await.unwrap();
        manager.join_lobby(&pid("a"), &one).await.unwrap();
        manager.join_lobby(&pid("a"), &two).await.unwrap();
        assert!(manager.lobby(&one).await.is_none());

        manager.join_lobby(&pid("b"), &two).await.unwrap();
        manager.start_session_from_lobby(&two).await.unwrap();

        let three = manager.create_lobby(4).await.unwrap();
        assert_eq!(
            manager.join_lobby(&pid("a"), &three).await,
            Err(ManagerError::AlreadyInSession)
        );
    }

    #[tokio::test]
    async fn test_leave_lobby() {
        let manager = create_test_manager("cat");
        register(&manager, &["a"]).await;
        let lobby_id = manager.create_lobby(4).await.unwrap();
        manager.join_lobby(&pid("a"), &lobby_id).await.unwrap();

        manager.leave_lobby(&pid("a"), &lobby_id).await;
        assert!(manager.lobby(&lobby_id).await.is_none());
        assert_eq!(manager.membership(&pid("a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_subscription_follows_promotion() {
        let manager = create_test_manager("go");
        register(&manager, &["a", "b"]).await;
        manager.matchmake(&pid("a")).await.unwrap();
        let mut rx = manager.subscribe(&pid("a")).await.unwrap();

        manager.matchmake(&pid("b")).await.unwrap();

        let mut saw_promoted = false;
        loop {
            match rx.recv().await.unwrap() {
                RaceEvent::Promoted { prompt, .. } => {
                    assert_eq!(prompt, "go");
                    saw_promoted = true;
                }
                RaceEvent::Started => break,
                _ => {}
            }
        }
        assert!(saw_promoted);
    }

    #[tokio::test]
    async fn test_player_view() {
        let manager = create_test_manager("cat");
        register(&manager, &["a", "b"]).await;
        assert_eq!(manager.player_view(&pid("a")).await, Ok(PlayerView::Idle));

        manager.matchmake(&pid("a")).await.unwrap();
        assert!(matches!(
            manager.player_view(&pid("a")).await,
            Ok(PlayerView::Lobby(_))
        ));

        manager.matchmake(&pid("b")).await.unwrap();
        match manager.player_view(&pid("b")).await.unwrap() {
            PlayerView::Session(snapshot) => {
                assert_eq!(snapshot.prompt, "cat");
                assert_eq!(snapshot.players.len(), 2);
            }
            other => panic!("unexpected view {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_detach_keeps_registration() {
        let manager = create_test_manager("cat");
        register(&manager, &["a", "b"]).await;
        manager.matchmake(&pid("a")).await.unwrap();
        manager.matchmake(&pid("b")).await.unwrap();

        manager.detach_player(&pid("a")).await.unwrap();
        assert_eq!(manager.membership(&pid("a")).await.unwrap(), None);
        assert_eq!(manager.status().await.total_players, 2);

        assert_eq!(
            manager.detach_player(&pid("ghost")).await,
            Err(ManagerError::PlayerNotFound)
        );
    }

    #[tokio::test]
    async fn test_reap_abandons_stalled_race() {
        let manager = create_test_manager("cat");
        register(&manager, &["a", "b"]).await;
        manager.matchmake(&pid("a")).await.unwrap();
        manager.matchmake(&pid("b")).await.unwrap();
        let mut rx = manager.subscribe(&pid("a")).await.unwrap();

        assert_eq!(manager.reap(Utc::now()).await, 0);

        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(manager.reap(later).await, 1);
        assert_eq!(manager.status().await.active_sessions, 0);
        assert_eq!(manager.membership(&pid("a")).await.unwrap(), None);

        let mut abandoned = false;
        while let Ok(event) = rx.try_recv() {
            abandoned |= event == RaceEvent::Abandoned;
        }
        assert!(abandoned);
    }

    #[tokio::test]
    async fn test_reap_expires_finished_race() {
        let manager = create_test_manager("a");
        register(&manager, &["x", "y"]).await;
        manager.matchmake(&pid("x")).await.unwrap();
        manager.matchmake(&pid("y")).await.unwrap();

        let Some(Membership::Session(session_id)) = manager.membership(&pid("x")).await.unwrap()
        else {
            panic!("expected a session");
        };
        let session = manager.session(&session_id).await.unwrap();
        wait_for_state(&session, SessionState::Active).await;

        manager.route_progress(&pid("x"), "a").await.unwrap();
        manager.route_progress(&pid("y"), "a").await.unwrap();
        let mut events = manager.subscribe(&pid("x")).await.unwrap();

        // Still inside the retention window
        assert_eq!(manager.reap(Utc::now()).await, 0);

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(manager.reap(later).await, 1);
        assert!(manager.session(&session_id).await.is_none());

        assert_eq!(events.recv().await.unwrap(), RaceEvent::Closed);
        assert_eq!(manager.player_view(&pid("x")).await.unwrap(), PlayerView::Idle);
    }

    #[tokio::test]
    async fn test_add_player_returns_detached_copy() {
        let manager = create_test_manager("a");
        let record = manager.add_player(pid("x"), "x").await.unwrap();
        manager.add_player(pid("y"), "y").await.unwrap();
        manager.matchmake(&pid("x")).await.unwrap();
        manager.matchmake(&pid("y")).await.unwrap();

        let Some(Membership::Session(session_id)) = manager.membership(&pid("x")).await.unwrap()
        else {
            panic!("expected a session");
        };
        let session = manager.session(&session_id).await.unwrap();
        wait_for_state(&session, SessionState::Active).await;
        manager.route_progress(&pid("x"), "a").await.unwrap();

        // The registry copy never moves; the race view does
        assert_eq!(record.cursor(), 0);
        assert!(!record.is_finished());
        let PlayerView::Session(view) = manager.player_view(&pid("x")).await.unwrap() else {
            panic!("expected a race view");
        };
        let tracked = view.players.iter().find(|p| p.player_id == pid("x")).unwrap();
        assert_eq!(tracked.cursor, 1);
        assert!(tracked.finished);
    }

    struct SlowPrompt;

    impl PromptSource for SlowPrompt {
        fn next_prompt(&self) -> Prompt {
            std::thread::sleep(Duration::from_millis(300));
            Prompt::new("slow", "test")
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_prompt_source_does_not_block_registry() {
        let config = ManagerConfig {
            countdown_tick: Duration::from_millis(5),
            ..Default::default()
        };
        let manager = Arc::new(Manager::new(config, Arc::new(SlowPrompt)));
        register(&manager, &["a", "b"]).await;
        let lobby_id = manager.create_lobby(2).await.unwrap();
        manager.join_lobby(&pid("a"), &lobby_id).await.unwrap();
        manager.join_lobby(&pid("b"), &lobby_id).await.unwrap();

        let promoting = manager.clone();
        let promotion =
            tokio::spawn(async move { promoting.start_session_from_lobby(&lobby_id).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let before = std::time::Instant::now();
        let status = manager.status().await;
        assert!(before.elapsed() < Duration::from_millis(100));
        assert_eq!(status.active_lobbies, 1);
        assert_eq!(status.active_sessions, 0);

        let session = promotion.await.unwrap().unwrap();
        assert_eq!(session.read().await.prompt().text, "slow");
        assert_eq!(manager.status().await.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_promotion_discards_prompt_when_lobby_leaves() {
        let config = ManagerConfig {
            countdown_tick: Duration::from_millis(5),
            ..Default::default()
        };
        let manager = Arc::new(Manager::new(config, Arc::new(SlowPrompt)));
        register(&manager, &["a", "b"]).await;
        let lobby_id = manager.create_lobby(2).await.unwrap();
        manager.join_lobby(&pid("a"), &lobby_id).await.unwrap();
        manager.join_lobby(&pid("b"), &lobby_id).await.unwrap();

        let promoting = manager.clone();
        let promotion =
            tokio::spawn(async move { promoting.start_session_from_lobby(&lobby_id).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Lobby drops below two while the prompt is being fetched
        manager.leave_lobby(&pid("b"), &lobby_id).await;

        let result = promotion.await.unwrap();
        assert!(matches!(result, Err(ManagerError::NotEnoughPlayers)));
        assert_eq!(manager.status().await.active_sessions, 0);
        assert_eq!(manager.membership(&pid("a")).await.unwrap(), Some(Membership::Lobby(lobby_id)));
    }

    #[tokio::test]
    async fn test_start_practice_leaves_lobby() {
        let manager = create_test_manager("cat");
        register(&manager, &["solo"]).await;
        manager.matchmake(&pid("solo")).await.unwrap();
        assert_eq!(manager.status().await.active_lobbies, 1);

        let mut run = manager.start_practice(&pid("solo")).await.unwrap();
        assert_eq!(run.prompt().text, "cat");
        assert_eq!(run.player().name, "solo");
        assert_eq!(manager.status().await.active_lobbies, 0);
        assert_eq!(manager.player_view(&pid("solo")).await.unwrap(), PlayerView::Idle);

        let outcome = run.apply_typed("cat", Utc::now());
        assert_eq!(outcome, ProgressOutcome::RaceFinished { place: 1 });

        let missing = manager.start_practice(&pid("ghost")).await;
        assert!(matches!(missing, Err(ManagerError::PlayerNotFound)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_removals_race_routing_and_countdown() {
        const PROMPT: &str = "the quick brown fox";
        let manager = Arc::new(create_test_manager(PROMPT));
        let ids = ["p0", "p1", "p2", "p3"];
        register(&manager, &ids).await;
        for id in ids {
            manager.matchmake(&pid(id)).await.unwrap();
        }
        assert_eq!(manager.status().await.active_sessions, 2);

        let mut handles = Vec::new();
        for id in ids {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let player = pid(id);
                for i in 0..200 {
                    // Rejected during the countdown and once the player is gone
                    let _ = manager.route_progress(&player, &PROMPT[..i % 10]).await;
                    tokio::task::yield_now().await;
                }
            }));
        }
        // Two removals per player, landing mid-countdown
        for id in ids.into_iter().chain(ids) {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(7)).await;
                manager.remove_player(&pid(id)).await;
            }));
        }

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("task deadlocked")
                .unwrap();
        }

        let status = manager.status().await;
        assert_eq!(
            status,
            SystemStatus {
                total_players: 0,
                active_lobbies: 0,
                active_sessions: 0,
            }
        );
    }
}
