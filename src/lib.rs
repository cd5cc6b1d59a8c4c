//! # Typerace Server
//!
//! Concurrent matchmaking and race engine for a multiplayer typing game.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TYPERACE SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  race/           - Matchmaking and race state                │
//! │  ├── player.rs   - Typing progress, WPM and accuracy         │
//! │  ├── lobby.rs    - Capacity-bounded waiting rooms            │
//! │  ├── session.rs  - Countdown, completion and ranking         │
//! │  ├── manager.rs  - Registry, promotion and routing           │
//! │  ├── prompt.rs   - Quote sources                             │
//! │  ├── practice.rs - Solo runs against the clock               │
//! │  └── events.rs   - Per-group broadcast feeds                 │
//! │                                                              │
//! │  network/        - Client transport                          │
//! │  ├── server.rs   - WebSocket server                          │
//! │  └── protocol.rs - Message types                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! The [`race::Manager`] guards its registries with a single async lock;
//! every lobby and session has its own. Locks are always taken manager
//! first, then entity. Countdowns run on detached tasks that only touch
//! their own session.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod network;
pub mod race;

// Re-export commonly used types
pub use race::{
    Manager, ManagerConfig, ManagerError, Player, PlayerId, Prompt, PromptSource, RaceEvent,
    StaticPrompts,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Players needed before a lobby can be promoted
pub const MIN_PLAYERS: usize = 2;

/// Lobby capacity used by matchmaking unless configured otherwise
pub const DEFAULT_LOBBY_CAPACITY: usize = 4;

/// Countdown length in ticks
pub const COUNTDOWN_SECONDS: u8 = 3;

/// Characters counted as one word for WPM
pub const CHARS_PER_WORD: f64 = 5.0;
