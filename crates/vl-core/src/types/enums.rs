//! Enumerations shared between the client and its consumers.

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Lifecycle state of the venue connection.
///
/// ```text
/// Idle → Connecting → Connected → Disconnected → Connecting → ...
///   \________________________________________________→ Disposed
/// ```
///
/// `Disposed` is terminal and reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Disposed,
}

impl ConnState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Disposed => write!(f, "disposed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Output channels
// ---------------------------------------------------------------------------

/// Named output channels exposed to the embedding application.
///
/// `Trade`, `Balance` and `User` are sub-channels of `UserEvent`: a user event
/// whose `event` field matches one of them is delivered there first, and then
/// always on the catch-all `UserEvent` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Quote,
    Notify,
    Trade,
    Balance,
    User,
    UserEvent,
    SymbolsReindex,
    SecurityReindex,
}

impl Channel {
    pub const ALL: [Channel; 8] = [
        Channel::Quote,
        Channel::Notify,
        Channel::Trade,
        Channel::Balance,
        Channel::User,
        Channel::UserEvent,
        Channel::SymbolsReindex,
        Channel::SecurityReindex,
    ];

    /// Unprefixed channel name.
    pub fn base_name(self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::Notify => "notify",
            Self::Trade => "trade",
            Self::Balance => "balance",
            Self::User => "user",
            Self::UserEvent => "userEvent",
            Self::SymbolsReindex => "symbolsReindex",
            Self::SecurityReindex => "securityReindex",
        }
    }

    /// Channel name with the configured prefix applied.
    pub fn name(self, prefix: &str) -> String {
        format!("{prefix}{}", self.base_name())
    }

    /// Sub-channel selected by a user event's `event` field, if any.
    pub fn for_user_event(event: &str) -> Option<Channel> {
        match event {
            "trade" => Some(Self::Trade),
            "balance" => Some(Self::Balance),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.base_name())
    }
}
