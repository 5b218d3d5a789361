//! Wire types shared by the teleprompter relay and its clients.

pub mod message;
pub mod role;

pub use message::{now_millis, ErrorCode, InboundMessage, LinkState, MessageError, ServerMessage};
pub use role::Role;
