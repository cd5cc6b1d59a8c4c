//! Network Layer
//!
//! WebSocket server for real-time race clients.
//! All race state lives in `race/`; this layer only translates messages.

pub mod protocol;
pub mod server;

pub use protocol::{ClientMessage, ErrorCode, KeyInput, ServerError, ServerMessage};
pub use server::{RaceServer, RaceServerError, ServerConfig};
