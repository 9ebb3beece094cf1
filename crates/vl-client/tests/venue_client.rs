//! End-to-end tests against an in-process fake venue on a loopback socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use vl_client::{Channel, ClientConfig, ClientError, ConnState, Message, ReconnectPolicy, VenueClient};
use vl_core::NotifyPayload;

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Fake venue
// ---------------------------------------------------------------------------

struct FakeVenue {
    listener: TcpListener,
}

impl FakeVenue {
    async fn bind() -> Self {
        Self { listener: TcpListener::bind("127.0.0.1:0").await.unwrap() }
    }

    fn address(&self) -> String {
        self.listener.local_addr().unwrap().to_string()
    }

    async fn accept(&self) -> Peer {
        let (stream, _) = tokio::time::timeout(WAIT, self.listener.accept()).await.expect("no connection").unwrap();
        let (read, write) = stream.into_split();
        Peer { lines: BufReader::new(read).lines(), write }
    }
}

/// Venue side of one client connection.
struct Peer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl Peer {
    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .expect("no request")
            .unwrap()
            .expect("client closed");
        serde_json::from_str(&line).unwrap()
    }

    async fn send(&mut self, line: &str) {
        self.write.write_all(line.as_bytes()).await.unwrap();
        self.write.write_all(b"\r\n").await.unwrap();
    }

    async fn reply(&mut self, request: &Value, body: Value) {
        let mut obj = body.as_object().cloned().unwrap_or_default();
        obj.insert("extID".into(), request["extID"].clone());
        self.send(&Value::Object(obj).to_string()).await;
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(address: String) -> ClientConfig {
    let mut cfg = ClientConfig::new(address);
    cfg.name = "test".into();
    cfg.token = "sess-42".into();
    cfg.reconnect = ReconnectPolicy::fixed(Duration::from_millis(300));
    cfg
}

async fn wait_for_state(client: &VenueClient, target: ConnState) {
    let mut rx = client.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("state never became {target}"))
        .map(|_| ())
        .unwrap();
}

async fn wait_for_pending(client: &VenueClient, count: usize) {
    let deadline = Instant::now() + WAIT;
    while client.pending_count() != count {
        assert!(Instant::now() < deadline, "pending count stuck at {}", client.pending_count());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn forward(client: &VenueClient, channel: Channel) -> mpsc::UnboundedReceiver<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on(channel, move |m| {
        let _ = tx.send(m.clone());
    });
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(WAIT, rx.recv()).await.expect("no event").expect("channel closed")
}

const NOTIFY: &str = r#"["n","Order filled","BUY 1","tok-1","ok","info","u7",1700000000,{"orderId":9},200]"#;

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[tokio::test]
async fn response_completes_matching_request() {
    let venue = FakeVenue::bind().await;
    let client = Arc::new(VenueClient::connect(config(venue.address())).unwrap());
    let mut peer = venue.accept().await;
    wait_for_state(&client, ConnState::Connected).await;

    let c = Arc::clone(&client);
    let call = tokio::spawn(async move { c.call("getBalance", json!({"account": 1})).await });

    let req = peer.recv().await;
    assert_eq!(req["command"], "getBalance");
    assert_eq!(req["data"], json!({"account": 1}));
    assert_eq!(req["__token"], "sess-42");
    let ext_id = req["extID"].as_str().unwrap().to_string();
    assert!(!ext_id.is_empty());

    peer.reply(&req, json!({"balance": 100.5})).await;
    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply, json!({"extID": ext_id, "balance": 100.5}));
    assert_eq!(client.pending_count(), 0);

    client.dispose().await;
}

#[tokio::test]
async fn concurrent_requests_get_distinct_ids() {
    let venue = FakeVenue::bind().await;
    let client = Arc::new(VenueClient::connect(config(venue.address())).unwrap());
    let mut peer = venue.accept().await;
    wait_for_state(&client, ConnState::Connected).await;

    let c1 = Arc::clone(&client);
    let first = tokio::spawn(async move { c1.call("a", json!({})).await });
    let c2 = Arc::clone(&client);
    let second = tokio::spawn(async move { c2.call("b", json!({})).await });

    let r1 = peer.recv().await;
    let r2 = peer.recv().await;
    assert_ne!(r1["extID"], r2["extID"]);

    // Answer only the "b" request; the other must stay pending.
    let (b_req, a_req) = if r1["command"] == "b" { (r1, r2) } else { (r2, r1) };
    peer.reply(&b_req, json!({"which": "b"})).await;
    assert_eq!(second.await.unwrap().unwrap()["which"], "b");
    assert_eq!(client.pending_count(), 1);
    assert!(!first.is_finished());

    peer.reply(&a_req, json!({"which": "a"})).await;
    assert_eq!(first.await.unwrap().unwrap()["which"], "a");

    client.dispose().await;
}

#[tokio::test]
async fn caller_supplied_id_and_raw_request() {
    let venue = FakeVenue::bind().await;
    let client = Arc::new(VenueClient::connect(config(venue.address())).unwrap());
    let mut peer = venue.accept().await;
    wait_for_state(&client, ConnState::Connected).await;

    let c = Arc::clone(&client);
    let raw = tokio::spawn(async move { c.request(json!({"op": "ping", "extID": "my-id"})).await });
    let req = peer.recv().await;
    assert_eq!(req, json!({"op": "ping", "extID": "my-id", "__token": "sess-42"}));
    peer.reply(&req, json!({"pong": true})).await;
    assert_eq!(raw.await.unwrap().unwrap()["pong"], true);

    client.dispose().await;
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let venue = FakeVenue::bind().await;
    let mut cfg = config(venue.address());
    cfg.request_timeout_ms = 200;
    let client = VenueClient::connect(cfg).unwrap();
    let mut peer = venue.accept().await;
    wait_for_state(&client, ConnState::Connected).await;

    let err = client.call_with_id("slow", json!({}), "req-7").await.unwrap_err();
    assert_eq!(err, ClientError::Timeout { ext_id: "req-7".into() });
    assert_eq!(client.pending_count(), 0);

    // The venue did see it; a late reply is ignored.
    let req = peer.recv().await;
    peer.reply(&req, json!({})).await;
    assert_eq!(client.pending_count(), 0);

    client.dispose().await;
}

#[tokio::test]
async fn malformed_frames_are_repaired_or_skipped() {
    let venue = FakeVenue::bind().await;
    let client = Arc::new(VenueClient::connect(config(venue.address())).unwrap());
    let mut peer = venue.accept().await;
    wait_for_state(&client, ConnState::Connected).await;

    let c = Arc::clone(&client);
    let call = tokio::spawn(async move { c.call_with_id("x", json!({}), "r1").await });
    peer.recv().await;

    peer.send("this is not json {").await;
    peer.send("{'extID':'r1','ok':true,}").await;
    assert_eq!(call.await.unwrap().unwrap(), json!({"extID": "r1", "ok": true}));

    client.dispose().await;
}

// ---------------------------------------------------------------------------
// Push events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn quote_frame_is_dispatched() {
    let venue = FakeVenue::bind().await;
    let client = VenueClient::new(config(venue.address())).unwrap();
    let mut quotes = forward(&client, Channel::Quote);
    client.start().unwrap();
    let mut peer = venue.accept().await;

    peer.send(r#"["t","EURUSD","1.0850","1.0852",1700000000]"#).await;
    match next_event(&mut quotes).await {
        Message::Quote(q) => {
            assert_eq!(q.symbol, "EURUSD");
            assert!((q.bid - 1.0850).abs() < 1e-12);
            assert!((q.ask - 1.0852).abs() < 1e-12);
            assert_eq!(q.timestamp.unwrap().to_rfc3339(), "2023-11-14T22:13:20+00:00");
        }
        other => panic!("expected Quote, got {other:?}"),
    }

    client.dispose().await;
}

#[tokio::test]
async fn user_events_fan_out_in_arrival_order() {
    let venue = FakeVenue::bind().await;
    let client = VenueClient::new(config(venue.address())).unwrap();
    let mut trades = forward(&client, Channel::Trade);
    let mut all = forward(&client, Channel::UserEvent);
    let mut reindex = forward(&client, Channel::SymbolsReindex);
    client.start().unwrap();
    let mut peer = venue.accept().await;

    peer.send(r#"{"event":"trade","id":1}"#).await;
    peer.send(r#"{"event":"session","id":2}"#).await;
    peer.send(r#"["sr",{"version":4}]"#).await;

    match next_event(&mut trades).await {
        Message::UserEvent(e) => assert_eq!(e.body["id"], 1),
        other => panic!("expected UserEvent, got {other:?}"),
    }
    for expected in [1, 2] {
        match next_event(&mut all).await {
            Message::UserEvent(e) => assert_eq!(e.body["id"], expected),
            other => panic!("expected UserEvent, got {other:?}"),
        }
    }
    assert_eq!(next_event(&mut reindex).await, Message::SymbolsReindex(json!({"version": 4})));
    assert!(trades.try_recv().is_err());

    client.dispose().await;
}

#[tokio::test]
async fn notify_token_is_delivered_once_per_epoch() {
    let venue = FakeVenue::bind().await;
    let client = VenueClient::new(config(venue.address())).unwrap();
    let mut notifies = forward(&client, Channel::Notify);
    let mut quotes = forward(&client, Channel::Quote);
    client.start().unwrap();

    let mut peer = venue.accept().await;
    peer.send(NOTIFY).await;
    peer.send(NOTIFY).await;
    peer.send(r#"["t","SYNC",1,1]"#).await;
    next_event(&mut quotes).await;

    match next_event(&mut notifies).await {
        Message::Notify(n) => {
            assert_eq!(n.token, "tok-1");
            assert_eq!(n.code, Some(200));
            assert!(matches!(n.payload, NotifyPayload::Object(_)));
        }
        other => panic!("expected Notify, got {other:?}"),
    }
    assert!(notifies.try_recv().is_err());
    assert_eq!(client.dedup_len(), 1);

    // New epoch: the same token is fresh again.
    drop(peer);
    let mut peer = venue.accept().await;
    wait_for_state(&client, ConnState::Connected).await;
    peer.send(NOTIFY).await;
    assert!(matches!(next_event(&mut notifies).await, Message::Notify(_)));
    assert_eq!(client.epoch(), 2);

    client.dispose().await;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn eof_schedules_reconnect_and_keeps_pending_requests() {
    let venue = FakeVenue::bind().await;
    let client = Arc::new(VenueClient::connect(config(venue.address())).unwrap());
    let mut peer = venue.accept().await;
    wait_for_state(&client, ConnState::Connected).await;

    let c = Arc::clone(&client);
    let call = tokio::spawn(async move { c.call_with_id("long", json!({}), "keep-me").await });
    let req = peer.recv().await;

    let closed_at = Instant::now();
    drop(peer);
    wait_for_state(&client, ConnState::Disconnected).await;
    assert!(!client.is_connected());
    assert_eq!(client.pending_count(), 1);

    let mut peer = venue.accept().await;
    assert!(closed_at.elapsed() >= Duration::from_millis(250), "reconnected too early");
    wait_for_state(&client, ConnState::Connected).await;
    assert_eq!(client.pending_count(), 1);
    assert!(!call.is_finished());

    // A response on the new epoch still completes the waiter.
    peer.reply(&req, json!({"done": true})).await;
    assert_eq!(call.await.unwrap().unwrap()["done"], true);

    client.dispose().await;
}

#[tokio::test]
async fn dispose_cancels_pending_and_rejects_later_calls() {
    let venue = FakeVenue::bind().await;
    let client = Arc::new(VenueClient::connect(config(venue.address())).unwrap());
    let mut peer = venue.accept().await;
    wait_for_state(&client, ConnState::Connected).await;

    let c1 = Arc::clone(&client);
    let first = tokio::spawn(async move { c1.call_with_id("a", json!({}), "p1").await });
    let c2 = Arc::clone(&client);
    let second = tokio::spawn(async move { c2.call_with_id("b", json!({}), "p2").await });
    peer.recv().await;
    peer.recv().await;
    wait_for_pending(&client, 2).await;

    client.dispose().await;
    assert_eq!(client.state(), ConnState::Disposed);
    assert_eq!(first.await.unwrap(), Err(ClientError::Cancelled { ext_id: "p1".into() }));
    assert_eq!(second.await.unwrap(), Err(ClientError::Cancelled { ext_id: "p2".into() }));

    assert_eq!(client.call("late", json!({})).await, Err(ClientError::Disposed));
    assert!(matches!(client.start(), Err(ClientError::Disposed)));
}

#[tokio::test]
async fn auto_subscribe_after_connect() {
    let venue = FakeVenue::bind().await;
    let mut cfg = config(venue.address());
    cfg.subscribe = vec!["quotes".into(), "notify".into()];
    cfg.subscribe_settle_ms = 50;
    let client = VenueClient::connect(cfg).unwrap();
    let mut peer = venue.accept().await;

    let req = peer.recv().await;
    assert_eq!(req["command"], "subscribe");
    assert_eq!(req["data"], json!({"channels": ["quotes", "notify"]}));
    assert_eq!(req["__token"], "sess-42");
    peer.reply(&req, json!({"ok": true})).await;

    // Resubscribes on every new epoch.
    drop(peer);
    let mut peer = venue.accept().await;
    assert_eq!(peer.recv().await["command"], "subscribe");

    client.dispose().await;
}

/// Large enough to fill both loopback socket buffers.
const FLOOD_LEN: usize = 16 * 1024 * 1024;

#[tokio::test]
async fn write_to_a_peer_that_never_reads_times_out() {
    let venue = FakeVenue::bind().await;
    let mut cfg = config(venue.address());
    cfg.request_timeout_ms = 200;
    let client = Arc::new(VenueClient::connect(cfg).unwrap());
    let _silent = venue.accept().await;
    wait_for_state(&client, ConnState::Connected).await;

    let data = json!({"blob": "x".repeat(FLOOD_LEN)});
    let err = tokio::time::timeout(Duration::from_secs(3), client.call_with_id("flood", data, "big"))
        .await
        .expect("write was not bounded by the request timeout")
        .unwrap_err();
    assert_eq!(err, ClientError::Timeout { ext_id: "big".into() });
    assert_eq!(client.pending_count(), 0);

    // The half-written socket is abandoned and a fresh epoch starts.
    let mut peer = venue.accept().await;
    wait_for_state(&client, ConnState::Connected).await;
    assert_eq!(client.epoch(), 2);

    let c = Arc::clone(&client);
    let call = tokio::spawn(async move { c.call("ping", json!({})).await });
    let req = peer.recv().await;
    assert_eq!(req["command"], "ping");
    peer.reply(&req, json!({"pong": true})).await;
    assert_eq!(call.await.unwrap().unwrap()["pong"], true);

    tokio::time::timeout(Duration::from_secs(3), client.dispose()).await.expect("dispose hung");
}

#[tokio::test]
async fn dispose_interrupts_a_stalled_write() {
    let venue = FakeVenue::bind().await;
    let mut cfg = config(venue.address());
    cfg.request_timeout_ms = 60_000;
    let client = Arc::new(VenueClient::connect(cfg).unwrap());
    let _silent = venue.accept().await;
    wait_for_state(&client, ConnState::Connected).await;

    let c = Arc::clone(&client);
    let call = tokio::spawn(async move { c.call_with_id("flood", json!({"blob": "x".repeat(FLOOD_LEN)}), "big").await });
    wait_for_pending(&client, 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A second caller queues behind the stalled write.
    let c = Arc::clone(&client);
    let queued = tokio::spawn(async move { c.call_with_id("small", json!({}), "q").await });
    wait_for_pending(&client, 2).await;

    tokio::time::timeout(Duration::from_secs(3), client.dispose()).await.expect("dispose hung");
    let first = tokio::time::timeout(Duration::from_secs(3), call).await.expect("caller stuck").unwrap();
    assert!(matches!(first, Err(ClientError::Disposed | ClientError::Cancelled { .. })), "{first:?}");
    let second = tokio::time::timeout(Duration::from_secs(3), queued).await.expect("caller stuck").unwrap();
    assert!(matches!(second, Err(ClientError::Disposed | ClientError::Cancelled { .. })), "{second:?}");
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn second_start_is_rejected() {
    let venue = FakeVenue::bind().await;
    let client = VenueClient::connect(config(venue.address())).unwrap();
    assert!(matches!(client.start(), Err(ClientError::AlreadyStarted)));
    client.dispose().await;
}

#[tokio::test]
async fn connect_failures_respect_retry_limit() {
    // Grab a free port, then close it so nothing is listening.
    let address = FakeVenue::bind().await.address();
    let mut cfg = config(address);
    cfg.reconnect = ReconnectPolicy { delay_ms: 20, backoff_factor: 2.0, max_delay_ms: 100, max_attempts: Some(3) };
    let client = VenueClient::connect(cfg).unwrap();

    wait_for_state(&client, ConnState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(client.state(), ConnState::Disconnected);
    assert_eq!(client.epoch(), 0);
    assert_eq!(client.call("x", json!({})).await, Err(ClientError::NotConnected));

    client.dispose().await;
}

#[tokio::test]
async fn client_that_gave_up_can_be_started_again() {
    let venue = FakeVenue::bind().await;
    let address = venue.address();
    drop(venue);

    let mut cfg = config(address.clone());
    cfg.reconnect = ReconnectPolicy { delay_ms: 20, backoff_factor: 1.0, max_delay_ms: 20, max_attempts: Some(1) };
    let client = VenueClient::connect(cfg).unwrap();
    wait_for_state(&client, ConnState::Disconnected).await;

    let venue = FakeVenue { listener: TcpListener::bind(&address).await.unwrap() };
    let deadline = Instant::now() + WAIT;
    loop {
        match client.start() {
            Ok(()) => break,
            Err(ClientError::AlreadyStarted) => {
                assert!(Instant::now() < deadline, "supervisor never exited");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => panic!("unexpected start error: {e}"),
        }
    }

    let _peer = venue.accept().await;
    wait_for_state(&client, ConnState::Connected).await;
    assert_eq!(client.epoch(), 1);
    assert!(matches!(client.start(), Err(ClientError::AlreadyStarted)));

    client.dispose().await;
}
