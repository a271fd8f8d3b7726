//! Subscription engine tests over an in-memory transport.
//!
//! Every test runs with a paused clock so backoff and keepalive timing are
//! deterministic.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use horizon_lattice_graphql::ws::{DialRequest, Dialer, Transport};
use horizon_lattice_graphql::{
    ConnectionState, Error, GraphQLRequest, HandlerError, ReconnectConfig, SubscriptionClient,
    SubscriptionConfig, SubscriptionEvent,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

const WAIT: Duration = Duration::from_secs(120);

/// Server end of one in-memory connection.
struct ServerConn {
    from_client: mpsc::UnboundedReceiver<Message>,
    to_client: mpsc::UnboundedSender<Result<Message, WsError>>,
}

impl ServerConn {
    async fn recv(&mut self) -> Value {
        timeout(WAIT, async {
            loop {
                match self.from_client.recv().await {
                    Some(Message::Text(text)) => return serde_json::from_str(text.as_str()).unwrap(),
                    Some(_) => continue,
                    None => panic!("client hung up"),
                }
            }
        })
        .await
        .expect("no frame from client")
    }

    /// Wait until the client drops its end of the connection.
    async fn closed(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        timeout(WAIT, async {
            while let Some(message) = self.from_client.recv().await {
                if let Message::Text(text) = message {
                    frames.push(serde_json::from_str(text.as_str()).unwrap());
                }
            }
        })
        .await
        .expect("client kept the connection open");
        frames
    }

    fn send(&self, frame: Value) {
        let _ = self.to_client.send(Ok(Message::Text(frame.to_string().into())));
    }

    fn fail(&self) {
        let _ = self.to_client.send(Err(WsError::ConnectionClosed));
    }
}

#[derive(Default)]
struct MockState {
    dials: AtomicUsize,
    fail_next: AtomicUsize,
    fail_always: AtomicBool,
    delay: Mutex<Duration>,
}

/// Dialer handing the server end of every connection to the test.
#[derive(Clone)]
struct MockDialer {
    state: Arc<MockState>,
    accepted: mpsc::UnboundedSender<ServerConn>,
}

struct MockServer {
    accepted: mpsc::UnboundedReceiver<ServerConn>,
}

impl MockServer {
    async fn accept(&mut self) -> ServerConn {
        timeout(WAIT, self.accepted.recv())
            .await
            .expect("client did not connect")
            .expect("dialer dropped")
    }

    /// Whether no connection is waiting to be accepted.
    fn is_idle(&mut self) -> bool {
        self.accepted.try_recv().is_err()
    }

    /// Accept a connection and consume its `connection_init`.
    async fn accept_initialized(&mut self) -> ServerConn {
        let mut conn = self.accept().await;
        assert_eq!(conn.recv().await["type"], "connection_init");
        conn
    }
}

impl MockDialer {
    fn new() -> (Self, MockServer) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(MockState::default()),
                accepted,
            },
            MockServer { accepted: rx },
        )
    }

    fn dials(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    fn fail_next(&self, count: usize) {
        self.state.fail_next.store(count, Ordering::SeqCst);
    }

    fn fail_always(&self) {
        self.state.fail_always.store(true, Ordering::SeqCst);
    }

    fn delay(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    async fn open(&self) -> horizon_lattice_graphql::Result<Transport> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let refuse = self.state.fail_always.load(Ordering::SeqCst)
            || self
                .state
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if refuse {
            return Err(Error::WebSocket("connection refused".into()));
        }

        let (client_tx, from_client) = mpsc::unbounded_channel::<Message>();
        let (to_client, client_rx) = mpsc::unbounded_channel::<Result<Message, WsError>>();

        let sink = futures_util::sink::unfold(client_tx, |tx, message: Message| async move {
            tx.send(message).map_err(|_| WsError::ConnectionClosed)?;
            Ok::<_, WsError>(tx)
        });
        let stream = futures_util::stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        let _ = self.accepted.send(ServerConn {
            from_client,
            to_client,
        });
        Ok(Transport::new(sink, stream))
    }
}

impl Dialer for MockDialer {
    fn dial<'a>(
        &'a self,
        _request: &'a DialRequest,
    ) -> BoxFuture<'a, horizon_lattice_graphql::Result<Transport>> {
        Box::pin(self.open())
    }
}

/// Forwards every event to the test.
struct Recorder {
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
}

impl Recorder {
    fn handler() -> (
        impl Fn(SubscriptionEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
        Self,
    ) {
        let (tx, events) = mpsc::unbounded_channel();
        let handler = move |event: SubscriptionEvent| -> Result<(), HandlerError> {
            let _ = tx.send(event);
            Ok(())
        };
        (handler, Self { events })
    }

    async fn next(&mut self) -> SubscriptionEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("no event delivered")
            .expect("handler dropped")
    }

    fn is_idle(&mut self) -> bool {
        self.events.try_recv().is_err()
    }
}

fn ignore(_event: SubscriptionEvent) -> Result<(), HandlerError> {
    Ok(())
}

fn request(field: &str) -> GraphQLRequest {
    GraphQLRequest::new(format!("subscription {{ {field} }}"))
}

fn client_with(dialer: &MockDialer, configure: impl FnOnce(SubscriptionConfig) -> SubscriptionConfig) -> SubscriptionClient {
    let config = SubscriptionConfig::new("ws://mock/graphql").dialer(dialer.clone());
    SubscriptionClient::new(configure(config))
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition was never met");
}

#[tokio::test(start_paused = true)]
async fn test_first_subscription_connects_and_sends_start() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);
    assert_eq!(client.state(), ConnectionState::Initial);

    let id = client.subscribe(request("tick"), ignore).await.unwrap();
    assert_eq!(id, "1");
    assert_eq!(client.state(), ConnectionState::Open);

    let mut conn = server.accept().await;
    assert_eq!(
        conn.recv().await,
        json!({"type": "connection_init", "payload": {"headers": {"content-type": "application/json"}}})
    );
    assert_eq!(
        conn.recv().await,
        json!({"type": "start", "id": "1", "payload": {"query": "subscription { tick }"}})
    );

    conn.send(json!({"type": "connection_ack"}));
    let info = client.info().await;
    assert_eq!(info.epoch, 1);
    eventually(|| async { client.info().await.acknowledged }).await;
}

#[tokio::test(start_paused = true)]
async fn test_starts_sent_while_connecting_are_flushed_in_order() {
    let (dialer, mut server) = MockDialer::new();
    dialer.delay(Duration::from_secs(1));
    let client = Arc::new(client_with(&dialer, |config| config));
    let mut states = client.state_changes();

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe(request("a"), ignore).await }
    });
    states
        .wait_for(|state| *state == ConnectionState::Connecting)
        .await
        .unwrap();

    assert_eq!(client.subscribe(request("b"), ignore).await.unwrap(), "2");
    assert_eq!(client.subscribe(request("c"), ignore).await.unwrap(), "3");
    assert_eq!(client.info().await.queued, 3);

    let mut conn = server.accept_initialized().await;
    for (id, field) in [("1", "a"), ("2", "b"), ("3", "c")] {
        let frame = conn.recv().await;
        assert_eq!(frame["type"], "start");
        assert_eq!(frame["id"], id);
        assert_eq!(frame["payload"]["query"], format!("subscription {{ {field} }}"));
    }

    assert_eq!(first.await.unwrap().unwrap(), "1");
    assert_eq!(client.info().await.queued, 0);
    assert_eq!(client.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_before_connect_sends_nothing() {
    let (dialer, mut server) = MockDialer::new();
    dialer.delay(Duration::from_secs(1));
    let client = Arc::new(client_with(&dialer, |config| config));
    let mut states = client.state_changes();

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe(request("a"), ignore).await }
    });
    states
        .wait_for(|state| *state == ConnectionState::Connecting)
        .await
        .unwrap();

    let second = client.subscribe(request("b"), ignore).await.unwrap();
    client.unsubscribe(&second).await.unwrap();
    assert_eq!(client.subscription_count(), 1);
    assert_eq!(client.info().await.queued, 1);

    let mut conn = server.accept_initialized().await;
    assert_eq!(conn.recv().await["id"], "1");
    first.await.unwrap().unwrap();

    // Closing stops only the live subscription
    client.close().await.unwrap();
    let frames = conn.closed().await;
    assert_eq!(
        frames,
        vec![
            json!({"type": "stop", "id": "1"}),
            json!({"type": "connection_terminate"}),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_data_is_delivered_to_handler() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);
    let (handler, mut recorder) = Recorder::handler();

    let id = client.subscribe(request("counter"), handler).await.unwrap();
    let mut conn = server.accept_initialized().await;
    conn.recv().await;

    conn.send(json!({"type": "data", "id": id, "payload": {"data": {"counter": 1}}}));
    let event = recorder.next().await;
    assert!(!event.completed);
    assert!(event.errors.is_empty());
    let data: Value = event.data().unwrap();
    assert_eq!(data, json!({"counter": 1}));

    conn.send(json!({
        "type": "data",
        "id": id,
        "payload": {"data": null, "errors": [{"message": "partial failure"}]}
    }));
    let event = recorder.next().await;
    assert_eq!(event.errors[0].message, "partial failure");
    assert_eq!(client.subscription_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_are_skipped() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);
    let (handler, mut recorder) = Recorder::handler();

    let id = client.subscribe(request("counter"), handler).await.unwrap();
    let mut conn = server.accept_initialized().await;
    conn.recv().await;

    let _ = conn.to_client.send(Ok(Message::Text("not json".to_string().into())));
    conn.send(json!({"type": "data", "id": id, "payload": "not an object"}));
    conn.send(json!({"type": "next", "id": id}));
    conn.send(json!({"type": "data", "id": id, "payload": {"data": {"counter": 2}}}));

    let event = recorder.next().await;
    assert_eq!(event.data::<Value>().unwrap(), json!({"counter": 2}));
    assert_eq!(client.info().await.epoch, 1);
    assert_eq!(dialer.dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_error_frame_ends_subscription() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);
    let (handler, mut recorder) = Recorder::handler();

    let id = client.subscribe(request("a"), handler).await.unwrap();
    let mut conn = server.accept_initialized().await;
    conn.recv().await;

    conn.send(json!({"type": "error", "id": id, "payload": "boom"}));
    let event = recorder.next().await;
    assert_eq!(event.errors.len(), 1);
    assert_eq!(event.errors[0].message, "boom");
    assert!(event.data.is_none());
    assert!(!event.completed);

    eventually(|| async { client.subscription_count() == 0 }).await;

    // A repeated error for the same id is answered with stop
    conn.send(json!({"type": "error", "id": id, "payload": {"message": "again"}}));
    assert_eq!(conn.recv().await, json!({"type": "stop", "id": "1"}));
    assert!(recorder.is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_complete_invokes_handler_once_then_stops_unknown_id() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);
    let (handler, mut recorder) = Recorder::handler();

    let id = client.subscribe(request("a"), handler).await.unwrap();
    let mut conn = server.accept_initialized().await;
    conn.recv().await;

    conn.send(json!({"type": "complete", "id": id}));
    let event = recorder.next().await;
    assert!(event.completed);
    assert!(event.data.is_none());

    conn.send(json!({"type": "complete", "id": id}));
    assert_eq!(conn.recv().await, json!({"type": "stop", "id": "1"}));
    assert!(recorder.is_idle());
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_data_for_unknown_id_is_stopped() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);

    client.subscribe(request("a"), ignore).await.unwrap();
    let mut conn = server.accept_initialized().await;
    conn.recv().await;

    conn.send(json!({"type": "data", "id": "99", "payload": {"data": {}}}));
    assert_eq!(conn.recv().await, json!({"type": "stop", "id": "99"}));
    assert_eq!(client.subscription_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_handler_error_unsubscribes() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let id = client
        .subscribe(request("a"), move |_event: SubscriptionEvent| -> Result<(), HandlerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("enough".into())
        })
        .await
        .unwrap();
    let mut conn = server.accept_initialized().await;
    conn.recv().await;

    conn.send(json!({"type": "data", "id": id, "payload": {"data": {"a": 1}}}));
    assert_eq!(conn.recv().await, json!({"type": "stop", "id": "1"}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_drops_subscriptions_and_restarts_ids() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);
    let (handler, mut recorder) = Recorder::handler();

    client.subscribe(request("a"), handler).await.unwrap();
    client.subscribe(request("b"), ignore).await.unwrap();
    let mut conn = server.accept_initialized().await;
    conn.recv().await;
    conn.recv().await;

    conn.fail();
    let _conn = server.accept_initialized().await;
    eventually(|| async { client.info().await.epoch == 2 }).await;

    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(client.subscription_count(), 0);
    assert!(recorder.is_idle());

    let id = client.subscribe(request("c"), ignore).await.unwrap();
    assert_eq!(id, "1");
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_after_reconnect() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);

    client.subscribe(request("a"), ignore).await.unwrap();
    let conn = server.accept_initialized().await;
    conn.fail();

    let mut conn = server.accept_initialized().await;
    eventually(|| async { client.state() == ConnectionState::Open && client.info().await.epoch == 2 })
        .await;

    let (handler, mut recorder) = Recorder::handler();
    let id = client.subscribe(request("a"), handler).await.unwrap();
    assert_eq!(conn.recv().await["id"], id.as_str());
    conn.send(json!({"type": "data", "id": id, "payload": {"data": {"a": true}}}));
    assert_eq!(recorder.next().await.data::<Value>().unwrap(), json!({"a": true}));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_waits_according_to_backoff() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);

    client.subscribe(request("a"), ignore).await.unwrap();
    let conn = server.accept_initialized().await;

    dialer.fail_next(2);
    let started = Instant::now();
    conn.fail();
    let _conn = server.accept_initialized().await;

    // Immediate attempt, then 1s and 1.5s waits
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(2500), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    assert_eq!(dialer.dials(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_expiry_forces_reconnect() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);
    let (handler, mut recorder) = Recorder::handler();

    let id = client.subscribe(request("a"), handler).await.unwrap();
    let mut conn = server.accept_initialized().await;
    conn.recv().await;

    conn.send(json!({"type": "ka"}));
    tokio::time::sleep(Duration::from_secs(31)).await;

    // Arrives after the timeout: triggers reconnection instead of delivery
    conn.send(json!({"type": "data", "id": id, "payload": {"data": {"late": true}}}));
    let _conn = server.accept_initialized().await;

    assert_eq!(dialer.dials(), 2);
    assert_eq!(client.subscription_count(), 0);
    assert!(recorder.is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_frames_refresh_keepalive() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);
    let (handler, mut recorder) = Recorder::handler();

    let id = client.subscribe(request("a"), handler).await.unwrap();
    let mut conn = server.accept_initialized().await;
    conn.recv().await;

    conn.send(json!({"type": "ka"}));
    for n in 0..3 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        conn.send(json!({"type": "data", "id": id, "payload": {"data": {"n": n}}}));
        assert_eq!(recorder.next().await.data::<Value>().unwrap(), json!({"n": n}));
    }
    assert_eq!(dialer.dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_check_disabled_for_short_timeouts() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config.keepalive_timeout(Duration::from_secs(10)));
    let (handler, mut recorder) = Recorder::handler();

    let id = client.subscribe(request("a"), handler).await.unwrap();
    let mut conn = server.accept_initialized().await;
    conn.recv().await;

    conn.send(json!({"type": "ka"}));
    tokio::time::sleep(Duration::from_secs(300)).await;
    conn.send(json!({"type": "data", "id": id, "payload": {"data": {}}}));
    recorder.next().await;
    assert_eq!(dialer.dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_receive_timeout_detects_silent_server() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config.receive_timeout(Duration::from_secs(5)));

    client.subscribe(request("a"), ignore).await.unwrap();
    let conn = server.accept_initialized().await;
    conn.send(json!({"type": "ka"}));

    let started = Instant::now();
    let _conn = server.accept_initialized().await;
    assert!(started.elapsed() > Duration::from_secs(30));
    assert_eq!(dialer.dials(), 2);
    drop(conn);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_reconnect_closes_client() {
    let (dialer, _server) = MockDialer::new();
    dialer.fail_always();
    let client = client_with(&dialer, |config| {
        config.reconnect_config(ReconnectConfig::new().max_attempts(3))
    });
    let mut states = client.state_changes();

    // The first failure is retried in the background
    client.subscribe(request("a"), ignore).await.unwrap();
    timeout(WAIT, states.wait_for(|state| *state == ConnectionState::Closed))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(dialer.dials(), 3);
    assert_eq!(client.subscription_count(), 0);
    assert_eq!(client.info().await.queued, 0);
    assert!(matches!(
        client.subscribe(request("b"), ignore).await,
        Err(Error::Closed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_initial_failure_is_retried() {
    let (dialer, mut server) = MockDialer::new();
    dialer.fail_next(1);
    let client = client_with(&dialer, |config| config);

    client.subscribe(request("a"), ignore).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connecting);

    let mut conn = server.accept_initialized().await;
    assert_eq!(conn.recv().await["id"], "1");
    assert_eq!(dialer.dials(), 2);
    assert_eq!(client.subscription_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_initial_failure_without_reconnect_fails_subscribe() {
    let (dialer, _server) = MockDialer::new();
    dialer.fail_always();
    let client = client_with(&dialer, |config| config.auto_reconnect(false));

    let result = client.subscribe(request("a"), ignore).await;
    assert!(matches!(result, Err(Error::WebSocket(_))));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_loss_without_reconnect_closes_client() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config.auto_reconnect(false));
    let mut states = client.state_changes();

    client.subscribe(request("a"), ignore).await.unwrap();
    let conn = server.accept_initialized().await;
    conn.fail();

    timeout(WAIT, states.wait_for(|state| *state == ConnectionState::Closed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dialer.dials(), 1);
    assert!(matches!(
        client.subscribe(request("b"), ignore).await,
        Err(Error::Closed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_loss_with_zero_attempts_closes_without_dialing() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| {
        config.reconnect_config(ReconnectConfig::new().max_attempts(0))
    });
    let mut states = client.state_changes();

    client.subscribe(request("a"), ignore).await.unwrap();
    let conn = server.accept_initialized().await;
    conn.fail();

    timeout(WAIT, states.wait_for(|state| *state == ConnectionState::Closed))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(dialer.dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_first_subscribe_still_connects() {
    let (dialer, mut server) = MockDialer::new();
    dialer.delay(Duration::from_secs(5));
    let client = client_with(&dialer, |config| config);

    let first = timeout(Duration::from_secs(1), client.subscribe(request("a"), ignore)).await;
    assert!(first.is_err());
    assert_eq!(client.state(), ConnectionState::Connecting);

    let second = client.subscribe(request("b"), ignore).await.unwrap();
    assert_eq!(second, "2");

    let mut conn = server.accept_initialized().await;
    assert_eq!(conn.recv().await["id"], "1");
    assert_eq!(conn.recv().await["id"], "2");
    eventually(|| async { client.state() == ConnectionState::Open }).await;

    let info = client.info().await;
    assert_eq!(info.queued, 0);
    assert_eq!(info.subscriptions, 2);
    assert_eq!(dialer.dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_while_connecting_stops_dialing() {
    let (dialer, mut server) = MockDialer::new();
    dialer.delay(Duration::from_secs(5));
    let client = Arc::new(client_with(&dialer, |config| config));
    let mut states = client.state_changes();

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe(request("a"), ignore).await }
    });
    states
        .wait_for(|state| *state == ConnectionState::Connecting)
        .await
        .unwrap();
    client.subscribe(request("b"), ignore).await.unwrap();
    assert_eq!(client.info().await.queued, 2);

    client.close().await.unwrap();
    assert!(matches!(first.await.unwrap(), Err(Error::Closed)));

    tokio::time::sleep(Duration::from_secs(600)).await;
    let info = client.info().await;
    assert_eq!(info.state, ConnectionState::Closed);
    assert_eq!(info.queued, 0);
    assert_eq!(info.subscriptions, 0);
    assert_eq!(dialer.dials(), 1);
    assert!(server.is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_close_while_waiting_to_reconnect() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);

    client.subscribe(request("a"), ignore).await.unwrap();
    let mut conn = server.accept_initialized().await;
    assert_eq!(conn.recv().await["id"], "1");

    dialer.fail_always();
    conn.fail();
    eventually(|| async {
        client.state() == ConnectionState::Reconnecting && dialer.dials() == 2
    })
    .await;

    // Queued until the next connection, which never comes
    client.subscribe(request("b"), ignore).await.unwrap();
    assert_eq!(client.info().await.queued, 1);

    client.close().await.unwrap();
    tokio::time::sleep(Duration::from_secs(600)).await;

    let info = client.info().await;
    assert_eq!(info.state, ConnectionState::Closed);
    assert_eq!(info.queued, 0);
    assert_eq!(dialer.dials(), 2);
    assert!(conn.closed().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_close_while_reconnect_dial_in_flight() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);

    client.subscribe(request("a"), ignore).await.unwrap();
    let mut conn = server.accept_initialized().await;
    conn.recv().await;

    dialer.delay(Duration::from_secs(5));
    conn.fail();
    eventually(|| async { dialer.dials() == 2 }).await;
    assert_eq!(client.state(), ConnectionState::Reconnecting);

    client.subscribe(request("b"), ignore).await.unwrap();
    client.close().await.unwrap();
    tokio::time::sleep(Duration::from_secs(600)).await;

    let info = client.info().await;
    assert_eq!(info.state, ConnectionState::Closed);
    assert_eq!(info.queued, 0);
    assert_eq!(dialer.dials(), 2);
    assert!(server.is_idle());
    assert!(conn.closed().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_all_stops_every_subscription() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);

    for field in ["a", "b", "c"] {
        client.subscribe(request(field), ignore).await.unwrap();
    }
    let mut conn = server.accept_initialized().await;
    for _ in 0..3 {
        conn.recv().await;
    }

    client.unsubscribe_all().await.unwrap();
    let mut stopped = Vec::new();
    for _ in 0..3 {
        let frame = conn.recv().await;
        assert_eq!(frame["type"], "stop");
        stopped.push(frame["id"].as_str().unwrap().to_string());
    }
    stopped.sort();
    assert_eq!(stopped, vec!["1", "2", "3"]);
    assert_eq!(client.subscription_count(), 0);

    // Unknown ids are ignored
    client.unsubscribe("42").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);

    client.subscribe(request("a"), ignore).await.unwrap();
    let mut conn = server.accept_initialized().await;
    conn.recv().await;

    client.close().await.unwrap();
    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);

    let frames = conn.closed().await;
    assert_eq!(
        frames,
        vec![
            json!({"type": "stop", "id": "1"}),
            json!({"type": "connection_terminate"}),
        ]
    );
    assert!(matches!(
        client.subscribe(request("b"), ignore).await,
        Err(Error::Closed)
    ));
    assert_eq!(dialer.dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_before_first_subscription() {
    let (dialer, _server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);

    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(dialer.dials(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_client_releases_connection() {
    let (dialer, mut server) = MockDialer::new();
    let client = client_with(&dialer, |config| config);

    client.subscribe(request("a"), ignore).await.unwrap();
    let mut conn = server.accept_initialized().await;
    conn.recv().await;

    drop(client);
    assert!(conn.closed().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_trace_hook_sees_traffic() {
    let (dialer, mut server) = MockDialer::new();
    let lines = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = lines.clone();
    let client = client_with(&dialer, move |config| {
        config
            .init_payload(json!({"token": "secret"}))
            .log(move |line| sink.lock().push(line.to_string()))
    });

    client.subscribe(request("a"), ignore).await.unwrap();
    let mut conn = server.accept().await;
    assert_eq!(
        conn.recv().await,
        json!({"type": "connection_init", "payload": {"token": "secret"}})
    );
    conn.send(json!({"type": "connection_ack"}));
    eventually(|| async { client.info().await.acknowledged }).await;
    client.close().await.unwrap();

    let lines = lines.lock();
    assert!(lines.iter().any(|line| line.starts_with("send ") && line.contains("connection_init")));
    assert!(lines.iter().any(|line| line.starts_with("send ") && line.contains(r#""type":"start""#)));
    assert!(lines.iter().any(|line| line == r#"recv {"type":"connection_ack"}"#));
    assert!(lines.iter().any(|line| line == "closing"));
}
