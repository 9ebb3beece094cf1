//! Fan-out of classified push events to named output channels.
//!
//! Listeners run synchronously on the read task, in registration order, so
//! the order in which they observe events equals frame-arrival order. A slow
//! listener therefore stalls the read path; hand heavy work off to a channel.

use std::sync::{Arc, PoisonError, RwLock};

use ahash::AHashMap;
use vl_core::{Channel, Message};

/// Callback invoked for each event delivered on a channel.
pub type Listener = Arc<dyn Fn(&Message) + Send + Sync>;

pub struct Dispatcher {
    prefix: String,
    ignore_events: bool,
    listeners: RwLock<AHashMap<Channel, Vec<Listener>>>,
}

impl Dispatcher {
    pub fn new(prefix: impl Into<String>, ignore_events: bool) -> Self {
        Self {
            prefix: prefix.into(),
            ignore_events,
            listeners: RwLock::new(AHashMap::new()),
        }
    }

    /// Append a listener to `channel`.
    pub fn subscribe(&self, channel: Channel, listener: Listener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel)
            .or_default()
            .push(listener);
    }

    /// Prefixed name of `channel`.
    pub fn channel_name(&self, channel: Channel) -> String {
        channel.name(&self.prefix)
    }

    /// Deliver `msg` to every listener of every channel it routes to.
    ///
    /// Returns the number of listener invocations. Nothing is invoked when
    /// events are ignored.
    pub fn dispatch(&self, msg: &Message) -> usize {
        if self.ignore_events {
            return 0;
        }
        let mut invoked = 0;
        for channel in route(msg) {
            // Snapshot so listeners may register further listeners.
            let targets: Vec<Listener> = self
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&channel)
                .cloned()
                .unwrap_or_default();
            for listener in &targets {
                listener(msg);
            }
            invoked += targets.len();
        }
        invoked
    }
}

/// Channels a message is delivered on, in delivery order.
///
/// Responses and unknown frames are never dispatched.
pub fn route(msg: &Message) -> Vec<Channel> {
    match msg {
        Message::Quote(_) => vec![Channel::Quote],
        Message::Notify(_) => vec![Channel::Notify],
        Message::SymbolsReindex(_) => vec![Channel::SymbolsReindex],
        Message::SecurityReindex(_) => vec![Channel::SecurityReindex],
        Message::UserEvent(ev) => match Channel::for_user_event(&ev.event) {
            Some(sub) => vec![sub, Channel::UserEvent],
            None => vec![Channel::UserEvent],
        },
        Message::Response { .. } | Message::Unknown(_) => Vec::new(),
    }
}
