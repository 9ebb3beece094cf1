//! Classified inbound messages.
//!
//! Every frame read from the venue decodes into exactly one [`Message`].
//! Push events (`Quote`, `Notify`, reindex notices, `UserEvent`) go to the
//! dispatcher; `Response` goes to the correlation table; `Unknown` is only
//! logged.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Quote
// ---------------------------------------------------------------------------

/// Top-of-book quote from a `["t", symbol, bid, ask, ts?]` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    /// Venue timestamp (Unix seconds on the wire), when present.
    pub timestamp: Option<DateTime<Utc>>,
}

impl Quote {
    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }
}

// ---------------------------------------------------------------------------
// Notify
// ---------------------------------------------------------------------------

/// Trailing payload of a notification frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum NotifyPayload {
    /// The frame stopped after `createTime`.
    #[default]
    None,
    /// Structured payload; the status code, if any, follows it on the wire.
    Object(Map<String, Value>),
    /// Bare integer payload, which is itself the status code.
    Code(i64),
}

/// Push notification from a `["n", ...]` frame.
///
/// `token` identifies the notification for deduplication within one
/// connection epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct Notify {
    pub message: String,
    pub description: String,
    pub token: String,
    pub status: String,
    pub level: String,
    pub user_id: String,
    pub create_time: Option<i64>,
    pub payload: NotifyPayload,
    pub code: Option<i64>,
}

// ---------------------------------------------------------------------------
// UserEvent
// ---------------------------------------------------------------------------

/// Object frame carrying an `event` field.
#[derive(Debug, Clone, PartialEq)]
pub struct UserEvent {
    /// Value of the `event` field.
    pub event: String,
    /// The whole frame object, `event` field included.
    pub body: Value,
}

// ---------------------------------------------------------------------------
// Message: tagged union
// ---------------------------------------------------------------------------

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Quote(Quote),
    Notify(Notify),
    SymbolsReindex(Value),
    SecurityReindex(Value),
    UserEvent(UserEvent),
    Response { ext_id: String, payload: Value },
    Unknown(Value),
}

impl Message {
    /// Short variant label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Quote(_) => "quote",
            Self::Notify(_) => "notify",
            Self::SymbolsReindex(_) => "symbols_reindex",
            Self::SecurityReindex(_) => "security_reindex",
            Self::UserEvent(_) => "user_event",
            Self::Response { .. } => "response",
            Self::Unknown(_) => "unknown",
        }
    }
}
