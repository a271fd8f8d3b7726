//! Subscription client and its configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use super::backoff::ReconnectConfig;
use super::connection::{Connection, ConnectionInfo, ConnectionState};
use super::dialer::{Dialer, TungsteniteDialer};
use super::registry::{HandlerError, SubscriptionEvent, SubscriptionHandler};
use crate::error::Result;
use crate::request::GraphQLRequest;

/// Hook receiving a human-readable line for every frame sent and received.
pub type LogHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Configuration for a [`SubscriptionClient`].
#[derive(Clone)]
pub struct SubscriptionConfig {
    /// The WebSocket URL (ws:// or wss://).
    pub url: String,
    /// Custom headers to send during the handshake.
    pub headers: HashMap<String, String>,
    /// Reconnect after the connection is lost. When disabled, a lost
    /// connection closes the client.
    pub auto_reconnect: bool,
    /// Delay policy and attempt cap for reconnection.
    pub reconnect: ReconnectConfig,
    /// Silence after the last keepalive that counts as a dead connection.
    /// Values of ten seconds or less disable the check.
    pub keepalive_timeout: Duration,
    /// Upper bound for a single receive, so keepalive expiry is noticed even
    /// when the server goes completely silent. Disabled by default.
    pub receive_timeout: Option<Duration>,
    /// Payload of the `connection_init` frame.
    pub init_payload: Option<Value>,
    /// Upper bound for establishing one connection.
    pub connect_timeout: Duration,
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) log: Option<LogHook>,
}

impl SubscriptionConfig {
    /// Create a configuration for the given WebSocket URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            auto_reconnect: true,
            reconnect: ReconnectConfig::default(),
            keepalive_timeout: Duration::from_secs(30),
            receive_timeout: None,
            init_payload: Some(serde_json::json!({
                "headers": {"content-type": "application/json"}
            })),
            connect_timeout: Duration::from_secs(30),
            dialer: Arc::new(TungsteniteDialer::new()),
            log: None,
        }
    }

    /// Add a custom header for the WebSocket handshake.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add multiple headers.
    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Enable or disable reconnection after a lost connection.
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the reconnection policy.
    pub fn reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    /// Set the keepalive timeout.
    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = timeout;
        self
    }

    /// Bound every receive so keepalive expiry is re-evaluated.
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    /// Set the `connection_init` payload.
    pub fn init_payload(mut self, payload: impl Serialize) -> Self {
        self.init_payload = serde_json::to_value(payload).ok();
        self
    }

    /// Send `connection_init` without a payload.
    pub fn no_init_payload(mut self) -> Self {
        self.init_payload = None;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Use a custom rustls configuration for `wss://` endpoints.
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.dialer = Arc::new(TungsteniteDialer::new().tls_config(config));
        self
    }

    /// Replace the component that opens connections.
    pub fn dialer(mut self, dialer: impl Dialer) -> Self {
        self.dialer = Arc::new(dialer);
        self
    }

    /// Receive a line for every frame sent and received, and for
    /// `closing`/`reconnecting` transitions.
    pub fn log(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.log = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("url", &self.url)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("auto_reconnect", &self.auto_reconnect)
            .field("reconnect", &self.reconnect)
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field("receive_timeout", &self.receive_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("log", &self.log.is_some())
            .finish()
    }
}

/// A GraphQL subscription client multiplexing operations over one WebSocket.
///
/// Nothing is dialed until the first subscription. Subscriptions made while
/// the connection is being established are queued and sent in order once it
/// opens. When the connection is lost, live subscriptions are dropped without
/// notification and the client reconnects in the background; subscribe again
/// to resume.
///
/// # Example
///
/// ```ignore
/// use horizon_lattice_graphql::{GraphQLRequest, SubscriptionClient, SubscriptionConfig, SubscriptionEvent};
///
/// let client = SubscriptionClient::new(
///     SubscriptionConfig::new("wss://api.example.com/graphql")
///         .header("Authorization", "Bearer token"),
/// );
///
/// let id = client
///     .subscribe(
///         GraphQLRequest::new("subscription { messageAdded { body } }"),
///         |event: SubscriptionEvent| {
///             println!("{:?}", event.data);
///             Ok(())
///         },
///     )
///     .await?;
///
/// client.unsubscribe(&id).await?;
/// client.close().await?;
/// ```
pub struct SubscriptionClient {
    connection: Arc<Connection>,
}

impl SubscriptionClient {
    /// Create a client. No connection is opened yet.
    pub fn new(config: SubscriptionConfig) -> Self {
        Self {
            connection: Connection::new(config),
        }
    }

    /// Start a subscription and return its id.
    ///
    /// Fails only when the request cannot be encoded or the frame cannot be
    /// sent locally, for example after [`close`](Self::close). Errors reported
    /// by the server are delivered to the handler.
    pub async fn subscribe<F>(&self, request: GraphQLRequest, handler: F) -> Result<String>
    where
        F: Fn(SubscriptionEvent) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.connection.subscribe(&request, Arc::new(handler)).await
    }

    /// Start a subscription delivering to a [`SubscriptionHandler`] implementation.
    pub async fn subscribe_with(
        &self,
        request: GraphQLRequest,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<String> {
        self.connection.subscribe(&request, handler).await
    }

    /// Stop a subscription. Unknown ids are ignored.
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        self.connection.unsubscribe(id).await
    }

    /// Stop every subscription, returning the first failure.
    pub async fn unsubscribe_all(&self) -> Result<()> {
        self.connection.unsubscribe_all().await
    }

    /// Stop every subscription, end the protocol session and close the socket.
    ///
    /// Calling this again does nothing.
    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_changes()
    }

    /// Snapshot the connection.
    pub async fn info(&self) -> ConnectionInfo {
        self.connection.info().await
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.connection.registry().len()
    }

    /// Get the URL this client is configured to connect to.
    pub fn url(&self) -> &str {
        &self.connection.config().url
    }
}

impl Drop for SubscriptionClient {
    fn drop(&mut self) {
        self.connection.abort_tasks();
    }
}

impl std::fmt::Debug for SubscriptionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionClient")
            .field("url", &self.url())
            .field("state", &self.state())
            .finish()
    }
}
