//! Protocol envelopes exchanged over the subscription socket.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use serde_json::value::RawValue;

use crate::error::Result;

/// Envelope type of a subscription protocol frame.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client -> Server: open the protocol session.
    ConnectionInit,
    /// Client -> Server: end the protocol session.
    ConnectionTerminate,
    /// Client -> Server: start an operation.
    Start,
    /// Client -> Server: stop an operation.
    Stop,
    /// Server -> Client: the session was accepted.
    ConnectionAck,
    /// Server -> Client: the session was rejected.
    ConnectionError,
    /// Server -> Client: keepalive.
    KeepAlive,
    /// Server -> Client: operation result.
    Data,
    /// Server -> Client: operation failed.
    Error,
    /// Server -> Client: operation finished.
    Complete,
    /// A type string this client does not understand.
    Unknown(String),
}

impl MessageType {
    /// The wire name of this type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::ConnectionInit => "connection_init",
            Self::ConnectionTerminate => "connection_terminate",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::ConnectionAck => "connection_ack",
            Self::ConnectionError => "connection_error",
            Self::KeepAlive => "ka",
            Self::Data => "data",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::Unknown(other) => other,
        }
    }

    fn from_wire(name: &str) -> Self {
        match name {
            "connection_init" => Self::ConnectionInit,
            "connection_terminate" => Self::ConnectionTerminate,
            "start" => Self::Start,
            "stop" => Self::Stop,
            "connection_ack" => Self::ConnectionAck,
            "connection_error" => Self::ConnectionError,
            "ka" => Self::KeepAlive,
            "data" => Self::Data,
            "error" => Self::Error,
            "complete" => Self::Complete,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        Ok(Self::from_wire(&name))
    }
}

/// A frame written by the client.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutboundMessage {
    /// Envelope type.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Operation id, absent for session-level frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Frame payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl OutboundMessage {
    /// `connection_init` with the given payload.
    pub fn connection_init(payload: Option<Value>) -> Self {
        Self {
            kind: MessageType::ConnectionInit,
            id: None,
            payload,
        }
    }

    /// `connection_terminate`.
    pub fn connection_terminate() -> Self {
        Self {
            kind: MessageType::ConnectionTerminate,
            id: None,
            payload: None,
        }
    }

    /// `start` for an operation.
    pub fn start(id: impl Into<String>, payload: impl Serialize) -> Result<Self> {
        Ok(Self {
            kind: MessageType::Start,
            id: Some(id.into()),
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    /// `stop` for an operation.
    pub fn stop(id: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Stop,
            id: Some(id.into()),
            payload: None,
        }
    }

    /// Encode as the JSON text sent on the socket.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A frame read from the server.
///
/// The payload is kept as raw JSON so each consumer decodes its own shape.
#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    /// Envelope type.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Operation id, when the frame belongs to an operation.
    #[serde(default)]
    pub id: Option<String>,
    /// Undecoded payload.
    #[serde(default)]
    pub payload: Option<Box<RawValue>>,
}

impl InboundMessage {
    /// Decode a frame from socket text.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| crate::Error::json_with_body(e, text))
    }

    /// Decode the payload into a concrete type.
    pub fn payload_as<T: de::DeserializeOwned>(&self) -> Result<T> {
        let raw = self.payload.as_deref().map(RawValue::get).unwrap_or("null");
        serde_json::from_str(raw).map_err(|e| crate::Error::json_with_body(e, raw))
    }

    /// The id, or the empty string for session-level frames.
    pub fn id_str(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }
}

/// Payload of a `data` frame.
#[derive(Debug, Deserialize)]
pub(crate) struct DataPayload {
    #[serde(default)]
    pub(crate) data: Option<Box<RawValue>>,
    #[serde(default)]
    pub(crate) errors: crate::response::GraphQLErrors,
}
