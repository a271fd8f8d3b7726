//! The single physical connection behind a subscription client.
//!
//! Every outbound frame goes through one async lock guarding the connection
//! state, the write half of the socket, the outbound queue, the id counter
//! and the epoch. The read half is owned by the per-epoch read task.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::SinkExt;
use parking_lot::Mutex;
use tokio::sync::{MutexGuard, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::backoff::Backoff;
use super::client::SubscriptionConfig;
use super::dialer::{DialRequest, FrameSink, Transport};
use super::dispatch;
use super::message::{MessageType, OutboundMessage};
use super::queue::{OutboundQueue, QueuedFrame};
use super::registry::{SubscriptionHandler, SubscriptionRegistry};
use crate::error::{Error, Result};
use crate::request::GraphQLRequest;

const TARGET: &str = "horizon_lattice_graphql::ws";

/// Lifecycle of the connection behind a subscription client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Nothing has been sent yet.
    #[default]
    Initial,
    /// The first connection is being established.
    Connecting,
    /// Connected; frames are written immediately.
    Open,
    /// The connection was lost and is being re-established.
    Reconnecting,
    /// Closed for good. Sends fail with [`Error::Closed`].
    Closed,
}

impl ConnectionState {
    /// Whether frames are written immediately.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Whether frames are held in the outbound queue.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Read-only snapshot of the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// The WebSocket URL.
    pub url: String,
    /// Current state.
    pub state: ConnectionState,
    /// Number of physical connections opened so far.
    pub epoch: u64,
    /// Whether the server acknowledged the current connection.
    pub acknowledged: bool,
    /// Live subscriptions.
    pub subscriptions: usize,
    /// Frames waiting for the connection to open.
    pub queued: usize,
}

/// How an outbound frame was handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Submitted {
    Written,
    Queued,
    DialRequired,
}

/// State mutated only under the write lock.
struct Core {
    state: ConnectionState,
    sink: Option<FrameSink>,
    queue: OutboundQueue,
    next_id: u64,
    epoch: u64,
    state_tx: watch::Sender<ConnectionState>,
}

impl Core {
    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(target: TARGET, "Connection state {} -> {}", self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }
}

#[derive(Default)]
struct Tasks {
    connector: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    reconnector: Option<JoinHandle<()>>,
}

/// Owns the socket and drives the connection state machine.
pub(crate) struct Connection {
    config: SubscriptionConfig,
    dial_request: DialRequest,
    core: tokio::sync::Mutex<Core>,
    state_rx: watch::Receiver<ConnectionState>,
    registry: SubscriptionRegistry,
    acknowledged_epoch: AtomicU64,
    tasks: Mutex<Tasks>,
}

impl Connection {
    pub(crate) fn new(config: SubscriptionConfig) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Initial);
        let dial_request = DialRequest {
            url: config.url.clone(),
            headers: config.headers.clone(),
            connect_timeout: config.connect_timeout,
        };
        Arc::new(Self {
            config,
            dial_request,
            core: tokio::sync::Mutex::new(Core {
                state: ConnectionState::Initial,
                sink: None,
                queue: OutboundQueue::new(),
                next_id: 0,
                epoch: 0,
                state_tx,
            }),
            state_rx,
            registry: SubscriptionRegistry::new(),
            acknowledged_epoch: AtomicU64::new(0),
            tasks: Mutex::new(Tasks::default()),
        })
    }

    pub(crate) fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub(crate) fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub(crate) async fn info(&self) -> ConnectionInfo {
        let core = self.core.lock().await;
        ConnectionInfo {
            url: self.config.url.clone(),
            state: core.state,
            epoch: core.epoch,
            acknowledged: core.epoch > 0
                && self.acknowledged_epoch.load(Ordering::Acquire) == core.epoch,
            subscriptions: self.registry.len(),
            queued: core.queue.len(),
        }
    }

    pub(crate) fn mark_acknowledged(&self, epoch: u64) {
        self.acknowledged_epoch.store(epoch, Ordering::Release);
    }

    /// Pass a line to the configured trace hook.
    pub(crate) fn trace(&self, line: impl FnOnce() -> String) {
        if let Some(log) = &self.config.log {
            log(&line());
        }
    }

    /// Register a handler and send its `start` frame.
    pub(crate) async fn subscribe(
        self: &Arc<Self>,
        request: &GraphQLRequest,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<String> {
        let mut core = self.core.lock().await;
        if core.state == ConnectionState::Closed {
            return Err(Error::Closed);
        }

        let id = core.allocate_id();
        let frame = OutboundMessage::start(id.clone(), request)?;
        let queued = QueuedFrame {
            kind: MessageType::Start,
            id: Some(id.clone()),
            text: frame.encode()?,
        };

        // Registered before the frame leaves so an immediate reply finds it
        self.registry.put(id.clone(), handler);
        match self.submit(&mut core, queued).await {
            Ok(outcome) => {
                drop(core);
                if outcome == Submitted::DialRequired {
                    self.connect_initial().await?;
                }
                Ok(id)
            }
            Err(e) => {
                self.registry.remove(&id);
                Err(e)
            }
        }
    }

    /// Stop one subscription. Unknown ids are ignored.
    pub(crate) async fn unsubscribe(self: &Arc<Self>, id: &str) -> Result<()> {
        let core = self.core.lock().await;
        if self.registry.remove(id).is_none() {
            return Ok(());
        }
        self.stop_locked(core, id).await
    }

    /// Stop every subscription, returning the first failure.
    pub(crate) async fn unsubscribe_all(self: &Arc<Self>) -> Result<()> {
        self.registry
            .remove_all(|id| async move {
                let core = self.core.lock().await;
                self.stop_locked(core, &id).await
            })
            .await
    }

    /// Send `stop` for an id the registry no longer holds.
    async fn stop_locked(self: &Arc<Self>, mut core: MutexGuard<'_, Core>, id: &str) -> Result<()> {
        if core.queue.remove_start(id) {
            tracing::debug!(target: TARGET, "Dropped queued start for subscription {}", id);
            return Ok(());
        }
        let frame = QueuedFrame {
            kind: MessageType::Stop,
            id: Some(id.to_string()),
            text: OutboundMessage::stop(id).encode()?,
        };
        let outcome = self.submit(&mut core, frame).await?;
        drop(core);
        if outcome == Submitted::DialRequired {
            self.connect_initial().await?;
        }
        Ok(())
    }

    /// Answer a frame for an unknown subscription with `stop`, if the
    /// connection that received it is still current.
    pub(crate) async fn send_stop(&self, epoch: u64, id: &str) -> Result<()> {
        let mut core = self.core.lock().await;
        if core.epoch != epoch || core.state != ConnectionState::Open {
            return Ok(());
        }
        let frame = QueuedFrame {
            kind: MessageType::Stop,
            id: Some(id.to_string()),
            text: OutboundMessage::stop(id).encode()?,
        };
        self.submit(&mut core, frame).await.map(|_| ())
    }

    /// Route one frame according to the connection state.
    async fn submit(&self, core: &mut Core, frame: QueuedFrame) -> Result<Submitted> {
        match core.state {
            ConnectionState::Closed => Err(Error::Closed),
            ConnectionState::Initial => {
                core.queue.push(frame);
                core.set_state(ConnectionState::Connecting);
                Ok(Submitted::DialRequired)
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                core.queue.push(frame);
                Ok(Submitted::Queued)
            }
            ConnectionState::Open => {
                let sink = core
                    .sink
                    .as_mut()
                    .ok_or_else(|| Error::WebSocket("connection has no socket".into()))?;
                self.trace(|| format!("send {}", frame.text));
                sink.send(Message::Text(frame.text.into())).await?;
                Ok(Submitted::Written)
            }
        }
    }

    /// Dial for the first time. Called by the sender that left `Initial`.
    ///
    /// The dial runs on its own task; the caller only waits for the outcome,
    /// so dropping the caller leaves the connection attempt running.
    async fn connect_initial(self: &Arc<Self>) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let handle = tokio::spawn({
            let connection = self.clone();
            async move {
                let _ = done_tx.send(connection.initial_dial().await);
            }
        });
        self.tasks.lock().connector = Some(handle);
        done_rx.await.unwrap_or(Err(Error::Closed))
    }

    async fn initial_dial(self: Arc<Self>) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(Error::Closed);
        }
        let Err(e) = self.try_connect().await else {
            return Ok(());
        };

        if self.config.auto_reconnect {
            tracing::warn!(target: TARGET, "Initial connection to {} failed: {}", self.config.url, e);
            self.spawn_reconnect(true);
            Ok(())
        } else {
            tracing::warn!(target: TARGET, "Connection to {} failed: {}", self.config.url, e);
            self.shut_down("initial connection failed").await;
            Err(e)
        }
    }

    async fn try_connect(self: &Arc<Self>) -> Result<()> {
        let transport = self.config.dialer.dial(&self.dial_request).await?;
        self.establish(transport).await
    }

    /// Install a freshly dialed transport: send `connection_init`, flush the
    /// queue in order, then start the read task for the new epoch.
    async fn establish(self: &Arc<Self>, transport: Transport) -> Result<()> {
        let Transport { mut sink, stream } = transport;
        let mut core = self.core.lock().await;
        if core.state == ConnectionState::Closed {
            drop(core);
            let _ = sink.close().await;
            return Ok(());
        }

        let init = OutboundMessage::connection_init(self.config.init_payload.clone()).encode()?;
        self.trace(|| format!("send {init}"));
        sink.send(Message::Text(init.into())).await?;

        let mut pending = core.queue.drain().into_iter();
        while let Some(frame) = pending.next() {
            self.trace(|| format!("send {}", frame.text));
            if let Err(e) = sink.send(Message::Text(frame.text.clone().into())).await {
                core.queue.requeue_front(std::iter::once(frame).chain(pending));
                return Err(e.into());
            }
        }

        core.epoch += 1;
        let epoch = core.epoch;
        core.sink = Some(sink);
        core.set_state(ConnectionState::Open);
        tracing::info!(target: TARGET, "Connected to {} (epoch {})", self.config.url, epoch);

        let reader = dispatch::spawn_reader(self.clone(), stream, epoch);
        self.tasks.lock().reader = Some(reader);
        Ok(())
    }

    /// The read task for `epoch` ended. Drop every subscription without
    /// notifying it, then reconnect or close.
    pub(crate) async fn handle_loss(self: &Arc<Self>, epoch: u64, reason: &str) {
        let sink = {
            let mut core = self.core.lock().await;
            if core.epoch != epoch || core.state != ConnectionState::Open {
                return;
            }

            let dropped = self.registry.clear();
            core.next_id = 0;
            tracing::warn!(
                target: TARGET,
                "Connection lost ({}), dropped {} subscription(s)",
                reason,
                dropped
            );

            if self.config.auto_reconnect {
                core.set_state(ConnectionState::Reconnecting);
            } else {
                core.queue.clear();
                core.set_state(ConnectionState::Closed);
            }
            core.sink.take()
        };

        if let Some(mut sink) = sink {
            let _ = sink.close().await;
        }
        if self.config.auto_reconnect {
            self.spawn_reconnect(false);
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, after_failure: bool) {
        let handle = tokio::spawn(self.clone().reconnect_loop(after_failure));
        if let Some(previous) = self.tasks.lock().reconnector.replace(handle) {
            previous.abort();
        }
    }

    /// Dial until a connection is established, the policy is exhausted or
    /// the client is closed.
    async fn reconnect_loop(self: Arc<Self>, after_failure: bool) {
        let policy = &self.config.reconnect;
        let mut backoff = Backoff::new();
        let mut dial_now = !after_failure;

        if dial_now && policy.is_exhausted(backoff.attempt()) {
            self.give_up(backoff.attempt()).await;
            return;
        }

        loop {
            if dial_now {
                if self.state() == ConnectionState::Closed {
                    return;
                }
                self.trace(|| "reconnecting".to_string());
                match self.try_connect().await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::debug!(target: TARGET, "Reconnect attempt failed: {}", e);
                    }
                }
            }
            dial_now = true;

            let delay = backoff.next_delay(policy);
            if policy.is_exhausted(backoff.attempt()) {
                self.give_up(backoff.attempt()).await;
                return;
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn give_up(&self, attempts: u32) {
        tracing::warn!(
            target: TARGET,
            "Giving up on {} after {} failed attempt(s)",
            self.config.url,
            attempts
        );
        self.shut_down("reconnect attempts exhausted").await;
    }

    /// Move to `Closed` after a failure, dropping queued frames and handlers.
    async fn shut_down(&self, reason: &str) {
        let mut core = self.core.lock().await;
        if core.state == ConnectionState::Closed {
            return;
        }
        core.queue.clear();
        self.registry.clear();
        core.sink = None;
        core.set_state(ConnectionState::Closed);
        tracing::info!(target: TARGET, "Connection closed: {}", reason);
    }

    /// Close the client. Idempotent.
    pub(crate) async fn close(self: &Arc<Self>) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Ok(());
        }
        self.trace(|| "closing".to_string());

        if let Err(e) = self.unsubscribe_all().await {
            tracing::debug!(target: TARGET, "Stop during close failed: {}", e);
        }

        let sink = {
            let mut core = self.core.lock().await;
            if core.state == ConnectionState::Closed {
                return Ok(());
            }
            if let Some(sink) = core.sink.as_mut() {
                let terminate = OutboundMessage::connection_terminate().encode()?;
                self.trace(|| format!("send {terminate}"));
                if let Err(e) = sink.send(Message::Text(terminate.into())).await {
                    tracing::debug!(target: TARGET, "connection_terminate failed: {}", e);
                }
            }
            core.queue.clear();
            self.registry.clear();
            core.set_state(ConnectionState::Closed);
            core.sink.take()
        };

        if let Some(mut sink) = sink
            && let Err(e) = sink.close().await
        {
            tracing::debug!(target: TARGET, "Socket close failed: {}", e);
        }
        self.abort_tasks();
        tracing::info!(target: TARGET, "Subscription client for {} closed", self.config.url);
        Ok(())
    }

    pub(crate) fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock();
        if let Some(connector) = tasks.connector.take() {
            connector.abort();
        }
        if let Some(reader) = tasks.reader.take() {
            reader.abort();
        }
        if let Some(reconnector) = tasks.reconnector.take() {
            reconnector.abort();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.config.url)
            .field("state", &self.state())
            .field("subscriptions", &self.registry.len())
            .finish()
    }
}
