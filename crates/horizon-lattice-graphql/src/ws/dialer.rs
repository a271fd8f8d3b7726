//! Establishing the physical WebSocket connection.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream, StreamExt};
use tokio_tungstenite::Connector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::error::{Error, Result};

/// Subprotocol announced during the handshake.
pub const GRAPHQL_WS_PROTOCOL: &str = "graphql-ws";

/// Write half of a connection.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Read half of a connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = std::result::Result<Message, WsError>> + Send>>;

/// An open connection, split into its two halves.
pub struct Transport {
    /// Frames written to the server.
    pub sink: FrameSink,
    /// Frames read from the server.
    pub stream: FrameStream,
}

impl Transport {
    /// Build a transport from any split sink/stream pair.
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<Message, Error = WsError> + Send + 'static,
        R: Stream<Item = std::result::Result<Message, WsError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// What a dialer needs to open a connection.
#[derive(Clone, Debug)]
pub struct DialRequest {
    /// The WebSocket URL (ws:// or wss://).
    pub url: String,
    /// Extra handshake headers.
    pub headers: HashMap<String, String>,
    /// Upper bound for the whole handshake.
    pub connect_timeout: Duration,
}

impl DialRequest {
    /// Build the handshake request, announcing the `graphql-ws` subprotocol.
    pub fn handshake(&self) -> Result<Request> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::InvalidUrl(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(
            http::header::SEC_WEBSOCKET_PROTOCOL,
            http::header::HeaderValue::from_static(GRAPHQL_WS_PROTOCOL),
        );
        for (name, value) in &self.headers {
            let header_name = http::header::HeaderName::try_from(name.as_str())?;
            let header_value = http::header::HeaderValue::try_from(value.as_str())?;
            headers.insert(header_name, header_value);
        }

        Ok(request)
    }
}

/// Opens connections for the subscription client.
///
/// Replace the default to route the protocol over a custom transport.
pub trait Dialer: Send + Sync + 'static {
    /// Open one connection.
    fn dial<'a>(&'a self, request: &'a DialRequest) -> BoxFuture<'a, Result<Transport>>;
}

/// The default dialer, backed by `tokio-tungstenite`.
#[derive(Clone, Default)]
pub struct TungsteniteDialer {
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl TungsteniteDialer {
    /// Create a dialer using the platform's native root certificates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom rustls configuration for `wss://` endpoints.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let dialer = TungsteniteDialer::new().tls_config(Arc::new(client_config));
    /// ```
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    async fn connect(&self, request: &DialRequest) -> Result<Transport> {
        let handshake = request.handshake()?;

        let connect = async {
            match &self.tls {
                Some(config) => {
                    tokio_tungstenite::connect_async_tls_with_config(
                        handshake,
                        None,
                        false,
                        Some(Connector::Rustls(config.clone())),
                    )
                    .await
                }
                None => tokio_tungstenite::connect_async(handshake).await,
            }
        };

        let (stream, response) = tokio::time::timeout(request.connect_timeout, connect)
            .await
            .map_err(|_| Error::Timeout)??;

        tracing::debug!(
            target: "horizon_lattice_graphql::ws",
            "WebSocket handshake completed with status {}",
            response.status()
        );

        let (sink, stream) = stream.split();
        Ok(Transport::new(sink, stream))
    }
}

impl Dialer for TungsteniteDialer {
    fn dial<'a>(&'a self, request: &'a DialRequest) -> BoxFuture<'a, Result<Transport>> {
        Box::pin(self.connect(request))
    }
}

impl std::fmt::Debug for TungsteniteDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TungsteniteDialer")
            .field("custom_tls", &self.tls.is_some())
            .finish()
    }
}
