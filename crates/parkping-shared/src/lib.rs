//! # parkping-shared
//!
//! Wire protocol shared by the parkping relay hub and its clients: the
//! identifier newtypes, the JSON event envelopes exchanged over the
//! WebSocket, and the fixed protocol constants.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use types::{AccountId, ChannelId};
