//! GraphQL client implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use http::header::{ACCEPT, AUTHORIZATION, CONNECTION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::request::{GraphQLRequest, collect_uploads};
use crate::response::{GraphQLErrors, GraphQLResponse};
use crate::ws::{LogHook, SubscriptionClient, SubscriptionConfig};

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Builder for creating a GraphQL client.
pub struct GraphQLClientBuilder {
    http_url: String,
    websocket_url: Option<String>,
    http_client: Option<reqwest::Client>,
    default_headers: HashMap<String, String>,
    bearer_token: Option<String>,
    request_timeout: Option<Duration>,
    close_connection: bool,
    check_status: bool,
    log: Option<LogHook>,
    subscription_config: Option<SubscriptionConfig>,
}

impl GraphQLClientBuilder {
    /// Create a new builder with the specified GraphQL endpoint URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http_url: url.into(),
            websocket_url: None,
            http_client: None,
            default_headers: HashMap::new(),
            bearer_token: None,
            request_timeout: None,
            close_connection: false,
            check_status: true,
            log: None,
            subscription_config: None,
        }
    }

    /// Set a separate WebSocket URL for subscriptions.
    ///
    /// If not set, the HTTP URL will be converted to WebSocket protocol
    /// (http:// -> ws://, https:// -> wss://).
    pub fn websocket_url(mut self, url: impl Into<String>) -> Self {
        self.websocket_url = Some(url.into());
        self
    }

    /// Use an existing reqwest client.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Add a default header to all requests.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Add multiple headers.
    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.default_headers.extend(headers);
        self
    }

    /// Set bearer token authentication.
    ///
    /// The token is sent as an `Authorization` header with every HTTP request
    /// and with the WebSocket handshake of [`GraphQLClient::subscription_client`].
    pub fn bearer_auth(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Set the request timeout for HTTP operations.
    ///
    /// Ignored when a custom client is supplied with [`http_client`](Self::http_client).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Ask the server to close the HTTP connection after each response.
    pub fn close_connection(mut self, close: bool) -> Self {
        self.close_connection = close;
        self
    }

    /// Enable or disable rejecting non-2xx responses.
    ///
    /// When disabled, the body of any response is decoded as a GraphQL result.
    pub fn check_http_status(mut self, check: bool) -> Self {
        self.check_status = check;
        self
    }

    /// Receive a summary line for every request and response.
    pub fn log(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.log = Some(Arc::new(hook));
        self
    }

    /// Base configuration for [`GraphQLClient::subscription_client`].
    ///
    /// Its URL is replaced by the client's WebSocket URL and the client's
    /// headers are added to its handshake headers.
    pub fn subscription_config(mut self, config: SubscriptionConfig) -> Self {
        self.subscription_config = Some(config);
        self
    }

    /// Build the GraphQL client.
    pub fn build(self) -> Result<GraphQLClient> {
        url::Url::parse(&self.http_url)?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.default_headers {
            headers.insert(
                HeaderName::try_from(name.as_str())?,
                HeaderValue::try_from(value.as_str())?,
            );
        }
        if let Some(ref token) = self.bearer_token {
            let mut value = HeaderValue::try_from(format!("Bearer {token}"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http_client = match self.http_client {
            Some(client) => client,
            None => {
                let mut builder = reqwest::Client::builder();
                if let Some(timeout) = self.request_timeout {
                    builder = builder.timeout(timeout);
                }
                builder.build()?
            }
        };

        // Derive WebSocket URL if not provided
        let websocket_url = self
            .websocket_url
            .unwrap_or_else(|| http_to_ws_url(&self.http_url));

        let mut handshake_headers = self.default_headers;
        if let Some(ref token) = self.bearer_token {
            handshake_headers.insert("Authorization".into(), format!("Bearer {token}"));
        }

        Ok(GraphQLClient {
            inner: Arc::new(GraphQLClientInner {
                http_client,
                http_url: self.http_url,
                websocket_url,
                headers,
                handshake_headers,
                close_connection: self.close_connection,
                check_status: self.check_status,
                log: self.log,
                subscription_config: self.subscription_config,
            }),
        })
    }
}

/// Convert an HTTP endpoint to its WebSocket counterpart.
fn http_to_ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

struct GraphQLClientInner {
    http_client: reqwest::Client,
    http_url: String,
    websocket_url: String,
    headers: HeaderMap,
    handshake_headers: HashMap<String, String>,
    close_connection: bool,
    check_status: bool,
    log: Option<LogHook>,
    subscription_config: Option<SubscriptionConfig>,
}

/// A GraphQL client for queries, mutations, and subscriptions.
///
/// # Example
///
/// ```ignore
/// use horizon_lattice_graphql::{GraphQLClient, GraphQLRequest};
///
/// let client = GraphQLClient::builder("https://api.example.com/graphql")
///     .bearer_auth("my-token")
///     .build()?;
///
/// // Execute a query
/// let request = GraphQLRequest::new("{ users { id name } }");
/// let response = client.execute(request).await?;
///
/// // Subscribe to events
/// let subscriptions = client.subscription_client();
/// ```
#[derive(Clone)]
pub struct GraphQLClient {
    inner: Arc<GraphQLClientInner>,
}

impl GraphQLClient {
    /// Create a client for the endpoint with default settings.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        GraphQLClientBuilder::new(url).build()
    }

    /// Create a new builder for configuring a GraphQL client.
    pub fn builder(url: impl Into<String>) -> GraphQLClientBuilder {
        GraphQLClientBuilder::new(url)
    }

    /// Get the HTTP endpoint URL.
    pub fn url(&self) -> &str {
        &self.inner.http_url
    }

    /// Get the WebSocket URL for subscriptions.
    pub fn websocket_url(&self) -> &str {
        &self.inner.websocket_url
    }

    /// Execute one operation.
    ///
    /// Errors reported by the server are returned inside the response; use
    /// [`run`](Self::run) to turn them into [`Error::GraphQL`].
    pub async fn execute(&self, request: GraphQLRequest) -> Result<GraphQLResponse> {
        let body = self.send(std::slice::from_ref(&request), false).await?;
        serde_json::from_str(&body).map_err(|e| Error::json_with_body(e, body))
    }

    /// Execute several operations in one HTTP request.
    ///
    /// Responses are returned in request order.
    pub async fn execute_batch(&self, requests: Vec<GraphQLRequest>) -> Result<Vec<GraphQLResponse>> {
        if requests.is_empty() {
            return Err(Error::InvalidRequest("batch contains no requests".into()));
        }

        let body = self.send(&requests, true).await?;
        let responses: Vec<GraphQLResponse> =
            serde_json::from_str(&body).map_err(|e| Error::json_with_body(e, body.as_str()))?;
        if responses.len() != requests.len() {
            return Err(Error::Json {
                message: format!(
                    "expected {} responses in batch, got {}",
                    requests.len(),
                    responses.len()
                ),
                body: Some(body),
            });
        }
        Ok(responses)
    }

    /// Execute one operation and decode its data.
    pub async fn run<T: DeserializeOwned>(&self, request: GraphQLRequest) -> Result<T> {
        self.execute(request).await?.into_data()
    }

    /// Execute a batch and return the data of every response.
    ///
    /// Errors from all responses are collected into one [`Error::GraphQL`].
    pub async fn run_batch(&self, requests: Vec<GraphQLRequest>) -> Result<Vec<Value>> {
        let responses = self.execute_batch(requests).await?;

        let mut errors = GraphQLErrors::new();
        let mut data = Vec::with_capacity(responses.len());
        for response in responses {
            errors.extend(response.errors);
            data.push(response.data.unwrap_or(Value::Null));
        }

        if errors.is_empty() {
            Ok(data)
        } else {
            Err(Error::GraphQL(errors))
        }
    }

    /// Create a subscription client for this endpoint.
    ///
    /// The client connects lazily on its first subscription.
    pub fn subscription_client(&self) -> SubscriptionClient {
        let mut config = match &self.inner.subscription_config {
            Some(config) => config.clone(),
            None => SubscriptionConfig::new(self.inner.websocket_url.clone()),
        };
        config.url = self.inner.websocket_url.clone();
        config.headers.extend(self.inner.handshake_headers.clone());
        if config.log.is_none() {
            config.log = self.inner.log.clone();
        }
        SubscriptionClient::new(config)
    }

    /// POST one or more requests and return the response body.
    async fn send(&self, requests: &[GraphQLRequest], batch: bool) -> Result<String> {
        let operations = if batch {
            serde_json::to_string(requests)?
        } else {
            serde_json::to_string(&requests[0])?
        };

        let mut builder = self
            .inner
            .http_client
            .post(&self.inner.http_url)
            .headers(self.inner.headers.clone())
            .header(ACCEPT, JSON_CONTENT_TYPE);
        if self.inner.close_connection {
            builder = builder.header(CONNECTION, "close");
        }

        let uploads = collect_uploads(requests, batch);
        builder = if uploads.is_empty() {
            builder
                .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
                .body(operations.clone())
        } else {
            let mut map = BTreeMap::new();
            let mut form = reqwest::multipart::Form::new().text("operations", operations.clone());
            let mut parts = Vec::with_capacity(uploads.len());
            for (index, entry) in uploads.into_iter().enumerate() {
                map.insert(index.to_string(), entry.paths);
                let file = entry.file;
                let mut part = reqwest::multipart::Part::stream_with_length(
                    file.content().clone(),
                    file.content().len() as u64,
                )
                .file_name(file.file_name().to_string());
                if let Some(mime) = file.mime() {
                    part = part.mime_str(mime).map_err(|e| {
                        Error::InvalidRequest(format!("invalid MIME type '{mime}': {e}"))
                    })?;
                }
                parts.push((index.to_string(), part));
            }
            form = form.text("map", serde_json::to_string(&map)?);
            for (name, part) in parts {
                form = form.part(name, part);
            }
            builder.multipart(form)
        };

        // Per-request headers win over client defaults
        let mut overrides = HeaderMap::new();
        for request in requests {
            for (name, value) in &request.headers {
                overrides.insert(
                    HeaderName::try_from(name.as_str())?,
                    HeaderValue::try_from(value.as_str())?,
                );
            }
        }
        if !overrides.is_empty() {
            builder = builder.headers(overrides);
        }

        let http_request = builder.build()?;
        if let Some(log) = &self.inner.log {
            log(&format!(
                "{} {} {:?}, headers: {:?}, body: {}",
                http_request.method(),
                http_request.url(),
                http_request.version(),
                http_request.headers(),
                operations
            ));
        }
        tracing::debug!(
            target: "horizon_lattice_graphql::http",
            "Sending {} operation(s) to {}",
            requests.len(),
            self.inner.http_url
        );

        let response = self.inner.http_client.execute(http_request).await?;
        let status = response.status();
        let version = response.version();
        let response_headers = response.headers().clone();
        let body = response.text().await?;

        if let Some(log) = &self.inner.log {
            log(&format!(
                "POST {} {:?} <Response {}>, headers: {:?}, body: {}",
                self.inner.http_url, version, status, response_headers, body
            ));
        }

        if self.inner.check_status && !status.is_success() {
            tracing::warn!(
                target: "horizon_lattice_graphql::http",
                "GraphQL endpoint answered {}",
                status
            );
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(body)
    }
}

impl std::fmt::Debug for GraphQLClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphQLClient")
            .field("http_url", &self.inner.http_url)
            .field("websocket_url", &self.inner.websocket_url)
            .finish()
    }
}
