//! Shared protocol definitions for Huddle
//!
//! Everything that travels over the signaling WebSocket lives here so the
//! server and any Rust client agree on the wire format.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
