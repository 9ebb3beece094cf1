//! Request/response correlation.
//!
//! Every outbound request carries an `extID`; the venue echoes it on the
//! response. [`PendingTable`] maps each outstanding `extID` to a oneshot
//! sender. The caller holds the matching [`Ticket`] and awaits it with a
//! timeout.
//!
//! Each registration gets a sequence number. Removal on timeout or drop only
//! happens while the entry still carries that number, so a late timeout can
//! never evict a newer waiter that reused the same identifier.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;
use vl_core::ClientError;

use crate::lock;

/// Outcome delivered to a waiter.
pub type Reply = Result<Value, ClientError>;

/// Length of generated identifiers (hex chars).
const GENERATED_ID_LEN: usize = 12;

struct Waiter {
    seq: u64,
    tx: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct TableState {
    waiters: AHashMap<String, Waiter>,
    /// Set on disposal; no further registrations are accepted.
    closed: bool,
}

/// Outstanding requests keyed by identifier.
///
/// The lock is never held across an await point.
#[derive(Default)]
pub struct PendingTable {
    state: Mutex<TableState>,
    next_seq: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter.
    ///
    /// With `ext_id = None` a short unique identifier is generated. A
    /// caller-supplied identifier that is already pending is rejected.
    pub fn register(&self, ext_id: Option<String>) -> Result<Ticket<'_>, ClientError> {
        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let mut state = lock(&self.state);
        if state.closed {
            return Err(ClientError::Disposed);
        }
        let ext_id = match ext_id {
            Some(id) if state.waiters.contains_key(&id) => return Err(ClientError::DuplicateId(id)),
            Some(id) => id,
            None => loop {
                let candidate = generate_id();
                if !state.waiters.contains_key(&candidate) {
                    break candidate;
                }
            },
        };
        state.waiters.insert(ext_id.clone(), Waiter { seq, tx });
        drop(state);

        Ok(Ticket { table: self, ext_id, seq, rx })
    }

    /// Deliver a response to its waiter.
    ///
    /// Returns `false` if no request is pending under `ext_id` (already timed
    /// out, or never sent by this client).
    pub fn complete(&self, ext_id: &str, payload: Value) -> bool {
        let waiter = lock(&self.state).waiters.remove(ext_id);
        match waiter {
            Some(w) => {
                // The receiver may have just been dropped by a timed-out caller.
                let _ = w.tx.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Remove the waiter under `ext_id` only if it is registration `seq`.
    fn remove(&self, ext_id: &str, seq: u64) -> bool {
        let mut state = lock(&self.state);
        if state.waiters.get(ext_id).is_some_and(|w| w.seq == seq) {
            state.waiters.remove(ext_id);
            true
        } else {
            false
        }
    }

    /// Fail every waiter with [`ClientError::Cancelled`] and refuse new ones.
    ///
    /// Returns the number of waiters cancelled.
    pub fn close(&self) -> usize {
        let drained: Vec<(String, Waiter)> = {
            let mut state = lock(&self.state);
            state.closed = true;
            state.waiters.drain().collect()
        };
        let count = drained.len();
        for (ext_id, waiter) in drained {
            let _ = waiter.tx.send(Err(ClientError::Cancelled { ext_id }));
        }
        count
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        lock(&self.state).waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, ext_id: &str) -> bool {
        lock(&self.state).waiters.contains_key(ext_id)
    }
}

/// Caller-side handle for one registered request.
///
/// Dropping a ticket unregisters its waiter, so a caller that gives up (or a
/// send that fails) never leaves a stale entry behind.
pub struct Ticket<'a> {
    table: &'a PendingTable,
    ext_id: String,
    seq: u64,
    rx: oneshot::Receiver<Reply>,
}

impl Ticket<'_> {
    pub fn ext_id(&self) -> &str {
        &self.ext_id
    }

    /// Wait for the response, failing with [`ClientError::Timeout`] after
    /// `timeout`.
    pub async fn wait(self, timeout: Duration) -> Reply {
        self.wait_until(Instant::now() + timeout).await
    }

    /// Like [`wait`](Self::wait) with an absolute deadline.
    pub async fn wait_until(mut self, deadline: Instant) -> Reply {
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ClientError::Cancelled { ext_id: self.ext_id.clone() }),
            Err(_) => {
                if !self.table.remove(&self.ext_id, self.seq) {
                    // Completed or cancelled between the deadline and the removal.
                    if let Ok(reply) = self.rx.try_recv() {
                        return reply;
                    }
                }
                Err(ClientError::Timeout { ext_id: self.ext_id.clone() })
            }
        }
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.ext_id, self.seq);
    }
}

fn generate_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(GENERATED_ID_LEN);
    id
}
