//! Persistent venue connection with auto-reconnect and request correlation.
//!
//! A started [`VenueClient`] owns one supervisor task that:
//! 1. Connects to the venue over TCP.
//! 2. Resets the read buffer and notification dedup set, then schedules the
//!    auto-subscribe request.
//! 3. Reads CRLF-delimited frames, decoding and routing each in arrival order.
//! 4. On EOF or I/O error, closes the socket and re-arms the reconnect timer.
//!
//! The supervisor is the only code that connects, so at most one connect
//! sequence is ever active. Requests are written by the calling task through
//! a mutex around the socket's write half; responses are matched back through
//! the [`PendingTable`]. The request timeout covers the wait for the write
//! section, the write and the response. A write cut short leaves a partial
//! frame on the wire, so its socket is dropped and the epoch ends.
//!
//! A disconnect does not fail outstanding requests: they keep waiting for a
//! response on the next epoch or run into their own timeout. Only
//! [`VenueClient::dispose`] cancels them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use vl_core::config::ClientConfig;
use vl_core::dedup::NotifyDedup;
use vl_core::{Channel, ClientError, ConnState, DecodeError, Message, Notify};

use crate::decoder::{self, EXT_ID_FIELD, TOKEN_FIELD};
use crate::dispatcher::{Dispatcher, Listener};
use crate::frame::FrameReader;
use crate::lock;
use crate::pending::PendingTable;

/// Size of a single socket read.
const READ_CHUNK: usize = 8 * 1024;

/// Command name used for the auto-subscribe request.
const SUBSCRIBE_COMMAND: &str = "subscribe";

/// Client for one venue endpoint.
///
/// All methods take `&self`; share the client between tasks with `Arc`.
/// Dropping the client has the same effect as [`dispose`](Self::dispose)
/// except that it cannot wait for the supervisor task to exit.
pub struct VenueClient {
    inner: Arc<Shared>,
}

/// State shared between the client handle, the supervisor task and
/// auto-subscribe tasks.
struct Shared {
    config: ClientConfig,
    /// Log label, e.g. `venue-desk1`.
    label: String,
    state_tx: watch::Sender<ConnState>,
    shutdown_tx: watch::Sender<bool>,
    /// Write half of the current socket. Holding the lock is the serialized
    /// write section.
    writer: tokio::sync::Mutex<Option<Link>>,
    /// Epoch whose socket was dropped after a stalled write.
    stalled_tx: watch::Sender<u64>,
    pending: PendingTable,
    dedup: Mutex<NotifyDedup>,
    dispatcher: Dispatcher,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Incremented on every transition into Connected.
    epoch: AtomicU64,
}

/// Write half of one connection epoch.
struct Link {
    epoch: u64,
    half: OwnedWriteHalf,
}

/// Why a connection epoch ended.
#[derive(Debug)]
enum ReadEnd {
    Eof,
    Error(std::io::Error),
    Stalled,
    Shutdown,
}

impl VenueClient {
    /// Create an idle client. Nothing is connected until [`start`](Self::start).
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let (state_tx, _) = watch::channel(ConnState::Idle);
        let (shutdown_tx, _) = watch::channel(false);
        let (stalled_tx, _) = watch::channel(0);
        let shared = Shared {
            label: format!("venue-{}", config.name),
            dispatcher: Dispatcher::new(config.channel_prefix.clone(), config.ignore_events),
            dedup: Mutex::new(NotifyDedup::with_capacity(config.dedup_capacity)),
            config,
            state_tx,
            shutdown_tx,
            writer: tokio::sync::Mutex::new(None),
            stalled_tx,
            pending: PendingTable::new(),
            supervisor: Mutex::new(None),
            epoch: AtomicU64::new(0),
        };
        Ok(Self { inner: Arc::new(shared) })
    }

    /// Create a client and start connecting immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let client = Self::new(config)?;
        client.start()?;
        Ok(client)
    }

    /// Spawn the supervisor task.
    ///
    /// Fails with [`ClientError::AlreadyStarted`] while a supervisor is
    /// running and with [`ClientError::Disposed`] after disposal. A client
    /// whose supervisor gave up after the retry limit can be started again.
    pub fn start(&self) -> Result<(), ClientError> {
        let mut slot = lock(&self.inner.supervisor);
        if self.state() == ConnState::Disposed {
            return Err(ClientError::Disposed);
        }
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(ClientError::AlreadyStarted);
        }
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        *slot = Some(tokio::spawn(supervise(Arc::clone(&self.inner), shutdown_rx)));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Send `{"command", "data"}` and wait for the matching response.
    pub async fn call(&self, command: &str, data: Value) -> Result<Value, ClientError> {
        self.inner.call(command, data, None).await
    }

    /// Like [`call`](Self::call) but with a caller-chosen identifier.
    pub async fn call_with_id(&self, command: &str, data: Value, ext_id: &str) -> Result<Value, ClientError> {
        self.inner.call(command, data, Some(ext_id.to_string())).await
    }

    /// Send an arbitrary JSON object and wait for the matching response.
    ///
    /// `extID` and `__token` are injected. A string `extID` already present
    /// on the object is kept as the identifier.
    pub async fn request(&self, payload: Value) -> Result<Value, ClientError> {
        let Value::Object(mut obj) = payload else {
            return Err(ClientError::InvalidPayload("raw request must be a JSON object".into()));
        };
        let ext_id = match obj.remove(EXT_ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => Some(id),
            _ => None,
        };
        self.inner.request(obj, ext_id).await
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Register a listener on an output channel.
    pub fn on<F>(&self, channel: Channel, listener: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.inner.dispatcher.subscribe(channel, listener);
    }

    /// Prefixed name of an output channel.
    pub fn channel_name(&self, channel: Channel) -> String {
        self.inner.dispatcher.channel_name(channel)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnState {
        *self.inner.state_tx.borrow()
    }

    /// Liveness flag.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnState> {
        self.inner.state_tx.subscribe()
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Notification tokens remembered in the current epoch.
    pub fn dedup_len(&self) -> usize {
        lock(&self.inner.dedup).len()
    }

    /// Number of connection epochs so far.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Tear the client down.
    ///
    /// Cancels the reconnect timer, fails every outstanding request with
    /// [`ClientError::Cancelled`], closes the socket and waits for the
    /// supervisor to exit. Later calls fail with [`ClientError::Disposed`].
    pub async fn dispose(&self) {
        let cancelled = self.inner.shutdown();
        let task = lock(&self.inner.supervisor).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.close_writer();
        info!("[{}] disposed, {cancelled} pending request(s) cancelled", self.inner.label);
    }
}

impl Drop for VenueClient {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl Shared {
    /// Apply a state transition. `Disposed` is never left.
    ///
    /// Returns `false` if the client has been disposed.
    fn set_state(&self, next: ConnState) -> bool {
        let mut applied = false;
        self.state_tx.send_if_modified(|cur| {
            if *cur == ConnState::Disposed {
                return false;
            }
            applied = true;
            if *cur == next {
                return false;
            }
            *cur = next;
            true
        });
        applied
    }

    fn is_disposed(&self) -> bool {
        *self.state_tx.borrow() == ConnState::Disposed
    }

    /// Synchronous part of disposal; idempotent.
    fn shutdown(&self) -> usize {
        self.state_tx.send_replace(ConnState::Disposed);
        self.shutdown_tx.send_replace(true);
        self.pending.close()
    }

    async fn call(&self, command: &str, data: Value, ext_id: Option<String>) -> Result<Value, ClientError> {
        let mut envelope = Map::new();
        envelope.insert("command".into(), Value::String(command.to_string()));
        envelope.insert("data".into(), if data.is_null() { json!({}) } else { data });
        self.request(envelope, ext_id).await
    }

    async fn request(&self, mut payload: Map<String, Value>, ext_id: Option<String>) -> Result<Value, ClientError> {
        if self.is_disposed() {
            return Err(ClientError::Disposed);
        }
        let deadline = Instant::now() + self.config.request_timeout();
        let ticket = self.pending.register(ext_id)?;
        payload.insert(EXT_ID_FIELD.into(), Value::String(ticket.ext_id().to_string()));
        payload.insert(TOKEN_FIELD.into(), Value::String(self.config.token.clone()));

        let mut line = Value::Object(payload).to_string();
        line.push_str("\r\n");

        // On failure the ticket is dropped here, which unregisters it.
        self.write_frame(&line, ticket.ext_id(), deadline).await?;
        debug!("[{}] request {} sent", self.label, ticket.ext_id());

        ticket.wait_until(deadline).await
    }

    /// Write one line inside the serialized write section.
    ///
    /// Waiting for the section and the write itself both end at `deadline`
    /// or on disposal, whichever comes first.
    async fn write_frame(&self, line: &str, ext_id: &str, deadline: Instant) -> Result<(), ClientError> {
        let timed_out = || ClientError::Timeout { ext_id: ext_id.to_string() };
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let mut guard = tokio::select! {
            res = tokio::time::timeout_at(deadline, self.writer.lock()) => res.map_err(|_| timed_out())?,
            _ = disposed(&mut shutdown_rx) => return Err(ClientError::Disposed),
        };
        if self.is_disposed() {
            return Err(ClientError::Disposed);
        }
        let epoch = self.epoch.load(Ordering::Acquire);
        if guard.as_ref().is_none_or(|link| link.epoch != epoch) || !self.state_tx.borrow().is_connected() {
            // Socket of an epoch that already ended.
            guard.take();
            return Err(ClientError::NotConnected);
        }
        let Some(link) = guard.as_mut() else {
            return Err(ClientError::NotConnected);
        };

        let written = tokio::select! {
            res = tokio::time::timeout_at(deadline, link.half.write_all(line.as_bytes())) => res.ok(),
            _ = disposed(&mut shutdown_rx) => None,
        };
        match written {
            Some(res) => res.map_err(|e| ClientError::Write(e.to_string())),
            None => {
                // A partial frame may be on the wire; the socket is unusable.
                if let Some(link) = guard.take() {
                    self.stalled_tx.send_replace(link.epoch);
                }
                Err(if self.is_disposed() { ClientError::Disposed } else { timed_out() })
            }
        }
    }

    /// Drop the current socket unless a write is in progress.
    ///
    /// A write in progress either completes, or drops the socket itself on
    /// its deadline or on disposal. Later writes discard a socket left over
    /// from an ended epoch.
    fn close_writer(&self) {
        if let Ok(mut guard) = self.writer.try_lock() {
            guard.take();
        }
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    /// Decode one frame and route it.
    fn handle_frame(&self, frame: &str) {
        let msg = match decoder::decode(frame) {
            Ok(msg) => msg,
            Err(DecodeError::Parse(e)) => {
                warn!("[{}] dropping unparseable frame ({e}): {frame}", self.label);
                return;
            }
            Err(DecodeError::Shape(e)) => {
                trace!("[{}] dropping malformed frame ({e}): {frame}", self.label);
                return;
            }
        };

        match msg {
            Message::Response { ext_id, payload } => {
                if !self.pending.complete(&ext_id, payload) {
                    debug!("[{}] response for unknown extID {ext_id}", self.label);
                }
            }
            Message::Unknown(value) => {
                debug!("[{}] unclassified frame: {value}", self.label);
            }
            Message::Notify(ref notify) if !self.accept_notify(notify) => {
                trace!("[{}] duplicate notify token {}", self.label, notify.token);
            }
            msg => {
                self.dispatcher.dispatch(&msg);
            }
        }
    }

    /// First sighting of this notification in the current epoch?
    ///
    /// Notifications without a token are always delivered.
    fn accept_notify(&self, notify: &Notify) -> bool {
        notify.token.is_empty() || lock(&self.dedup).check_and_insert(&notify.token)
    }

    /// Start a new epoch: empty the read buffer and the dedup set.
    fn reset_epoch(&self, frames: &mut FrameReader) -> u64 {
        frames.clear();
        lock(&self.dedup).clear();
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Install the new socket and enter Connected.
    ///
    /// Returns the new epoch, or `None` if the client was disposed while
    /// connecting.
    async fn on_connected(self: &Arc<Self>, half: OwnedWriteHalf, frames: &mut FrameReader) -> Option<u64> {
        let epoch = self.reset_epoch(frames);
        let mut guard = self.writer.lock().await;
        *guard = Some(Link { epoch, half });
        if !self.set_state(ConnState::Connected) {
            guard.take();
            return None;
        }
        drop(guard);
        info!("[{}] connected to {} (epoch {epoch})", self.label, self.config.address);

        if !self.config.subscribe.is_empty() {
            tokio::spawn(auto_subscribe(Arc::clone(self), epoch));
        }
        Some(epoch)
    }

    /// Close the socket after an epoch ends and enter Disconnected.
    fn on_disconnected(&self, reason: &ReadEnd) {
        self.close_writer();
        match reason {
            ReadEnd::Eof => warn!("[{}] connection closed by peer", self.label),
            ReadEnd::Error(e) => error!("[{}] read error: {e}", self.label),
            ReadEnd::Stalled => warn!("[{}] write stalled, dropping connection", self.label),
            ReadEnd::Shutdown => return,
        }
        self.set_state(ConnState::Disconnected);
    }
}

/// Supervisor loop: connect, read, reconnect; exits on disposal.
async fn supervise(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let label = shared.label.clone();
    let policy = shared.config.reconnect.clone();
    let mut frames = FrameReader::new();
    let mut stalled_rx = shared.stalled_tx.subscribe();
    let mut failures: u32 = 0;

    loop {
        if *shutdown_rx.borrow() || !shared.set_state(ConnState::Connecting) {
            info!("[{label}] supervisor stopped");
            return;
        }
        info!("[{label}] connecting to {}", shared.config.address);

        let connected = tokio::select! {
            res = TcpStream::connect(shared.config.address.as_str()) => res,
            _ = shutdown_rx.changed() => return,
        };

        let delay = match connected {
            Ok(stream) => {
                failures = 0;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("[{label}] set_nodelay failed: {e}");
                }
                let (read_half, write_half) = stream.into_split();
                let Some(epoch) = shared.on_connected(write_half, &mut frames).await else {
                    return;
                };
                let end = read_loop(&shared, read_half, &mut frames, &mut shutdown_rx, &mut stalled_rx, epoch).await;
                shared.on_disconnected(&end);
                if matches!(end, ReadEnd::Shutdown) {
                    return;
                }
                policy.delay_for(0)
            }
            Err(e) => {
                let delay = policy.delay_for(failures);
                failures += 1;
                warn!("[{label}] connect failed ({failures} in a row): {e}");
                shared.set_state(ConnState::Disconnected);
                if !policy.allows(failures) {
                    error!("[{label}] giving up after {failures} failed attempt(s)");
                    return;
                }
                delay
            }
        };

        info!("[{label}] reconnecting in {delay:?}");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = shutdown_rx.changed() => return,
        }
    }
}

/// Read until the epoch ends, routing every complete frame.
async fn read_loop(
    shared: &Shared,
    mut reader: OwnedReadHalf,
    frames: &mut FrameReader,
    shutdown_rx: &mut watch::Receiver<bool>,
    stalled_rx: &mut watch::Receiver<u64>,
    epoch: u64,
) -> ReadEnd {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = tokio::select! {
            res = reader.read(&mut chunk) => match res {
                Ok(0) => return ReadEnd::Eof,
                Ok(n) => n,
                Err(e) => return ReadEnd::Error(e),
            },
            _ = shutdown_rx.changed() => return ReadEnd::Shutdown,
            Ok(()) = stalled_rx.changed() => {
                if *stalled_rx.borrow_and_update() == epoch {
                    return ReadEnd::Stalled;
                }
                continue;
            }
        };
        frames.extend(&chunk[..n]);
        while let Some(frame) = frames.next_frame() {
            shared.handle_frame(&frame);
        }
    }
}

/// Resolves once the client is disposed.
async fn disposed(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Send the configured subscribe request once the connection has settled.
///
/// Skipped if the epoch ended during the settle delay.
async fn auto_subscribe(shared: Arc<Shared>, epoch: u64) {
    tokio::time::sleep(shared.config.subscribe_settle()).await;
    if shared.epoch.load(Ordering::Acquire) != epoch || !shared.state_tx.borrow().is_connected() {
        debug!("[{}] epoch {epoch} ended before auto-subscribe", shared.label);
        return;
    }
    let data = json!({ "channels": shared.config.subscribe });
    match shared.call(SUBSCRIBE_COMMAND, data, None).await {
        Ok(_) => info!("[{}] subscribed to {:?}", shared.label, shared.config.subscribe),
        Err(e) => warn!("[{}] auto-subscribe failed: {e}", shared.label),
    }
}
