//! # vl-client
//!
//! Persistent TCP client for a trading venue speaking line-delimited JSON.
//!
//! ## Architecture
//!
//! ```text
//! socket bytes ─► FrameReader ─► decoder ─┬─► PendingTable  (responses, by extID)
//!                                         └─► NotifyDedup ─► Dispatcher ─► listeners
//! ```
//!
//! - [`client`]: `VenueClient`, the connect/reconnect state machine, request API
//! - [`frame`]: CRLF line splitting over a growing buffer
//! - [`decoder`]: lenient JSON parse + frame classification
//! - [`pending`]: request/response correlation with timeouts
//! - [`dispatcher`]: fan-out of push events to named channels
//! - [`json_util`]: string-or-number field helpers

pub mod client;
pub mod decoder;
pub mod dispatcher;
pub mod frame;
pub mod json_util;
pub mod pending;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use client::VenueClient;
pub use vl_core::config::{ClientConfig, ReconnectPolicy};
pub use vl_core::{Channel, ClientError, ConnState, Message};

/// Lock a std mutex, recovering the data if a listener panicked while it
/// was held.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
