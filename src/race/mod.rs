//! Race Engine
//!
//! Matchmaking and race state. Transport-agnostic: everything here is driven
//! through [`Manager`] and observed through [`RaceEvent`] feeds.

pub mod events;
pub mod lobby;
pub mod manager;
pub mod player;
pub mod practice;
pub mod prompt;
pub mod session;

pub use events::{EventReceiver, RaceEvent, Standing};
pub use lobby::{Lobby, LobbyError, LobbyId, LobbySnapshot};
pub use manager::{Manager, ManagerConfig, ManagerError, Membership, PlayerView, SystemStatus};
pub use player::{Player, PlayerId, PlayerSnapshot};
pub use practice::{PracticeRun, PracticeSnapshot};
pub use prompt::{Prompt, PromptSource, StaticPrompts};
pub use session::{ProgressOutcome, Session, SessionError, SessionId, SessionSnapshot, SessionState};
