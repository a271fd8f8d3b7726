//! Error types for the GraphQL client.

use crate::response::GraphQLErrors;

/// A specialized Result type for GraphQL client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the HTTP transport and the subscription engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The HTTP request could not be sent or its body could not be read.
    #[error("HTTP request error: {0}")]
    Http(String),

    /// The server answered with an unexpected HTTP status.
    #[error("unexpected HTTP response code: {status}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// The response body, saved for diagnostics.
        body: String,
    },

    /// The server reported one or more GraphQL errors.
    #[error("GraphQL error: {0}")]
    GraphQL(GraphQLErrors),

    /// A payload could not be encoded or a response could not be decoded.
    #[error("JSON error: {message}")]
    Json {
        /// The underlying serde message.
        message: String,
        /// The offending document, when one was received.
        body: Option<String>,
    },

    /// Dialing, reading from or writing to the WebSocket failed.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The subscription client has been closed and accepts no more messages.
    #[error("a message was not sent because the subscription client is closed")]
    Closed,

    /// Invalid URL provided.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Invalid header name or value.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// The request cannot be executed as built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a decode error that keeps the received document.
    pub fn json_with_body(err: serde_json::Error, body: impl Into<String>) -> Self {
        Self::Json {
            message: err.to_string(),
            body: Some(body.into()),
        }
    }

    /// Whether this error was reported by the GraphQL server rather than the transport.
    pub fn is_graphql(&self) -> bool {
        matches!(self, Self::GraphQL(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(err.to_string())
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
            body: None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}

impl From<GraphQLErrors> for Error {
    fn from(errors: GraphQLErrors) -> Self {
        Self::GraphQL(errors)
    }
}
