//! Notification deduplication.
//!
//! The venue may deliver the same notification more than once (resends after
//! a slow ack, duplicate fan-out on its side). [`NotifyDedup`] remembers every
//! notification token seen during the current connection epoch so that each
//! one reaches listeners at most once. Tokens are not assumed unique across
//! epochs, so the owner clears the set on every transition into Connected.
//!
//! By default the set is unbounded for the lifetime of one epoch; watch
//! [`NotifyDedup::len`] if epochs are long and token churn is high. An
//! optional capacity evicts the oldest token first.

use std::collections::VecDeque;

use ahash::AHashSet;

/// Epoch-scoped set of seen notification tokens.
///
/// Not thread-safe. The client wraps it in a mutex shared between the read
/// path and the connect path.
pub struct NotifyDedup {
    seen: AHashSet<String>,
    /// Insertion order, only tracked when a capacity is set.
    order: VecDeque<String>,
    capacity: Option<usize>,
}

impl NotifyDedup {
    /// Unbounded deduplicator.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Deduplicator that forgets the oldest token once `capacity` is reached.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            seen: AHashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Record `token`.
    ///
    /// Returns `true` the first time a token is seen in this epoch, `false`
    /// for repeats.
    #[inline]
    pub fn check_and_insert(&mut self, token: &str) -> bool {
        if self.seen.contains(token) {
            return false;
        }
        if let Some(cap) = self.capacity {
            while self.seen.len() >= cap {
                match self.order.pop_front() {
                    Some(oldest) => {
                        self.seen.remove(&oldest);
                    }
                    None => break,
                }
            }
            self.order.push_back(token.to_string());
        }
        self.seen.insert(token.to_string());
        true
    }

    /// Number of tokens remembered in this epoch.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Forget every token (start of a new epoch).
    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

impl Default for NotifyDedup {
    fn default() -> Self {
        Self::new()
    }
}
