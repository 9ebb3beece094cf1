//! Core data types: connection state, output channels, and classified
//! inbound messages.

pub mod enums;
pub mod message;

pub use enums::*;
pub use message::*;
