//! The per-connection read task.
//!
//! Receives frames, checks keepalive liveness, and routes operation results
//! to their handlers. Handlers run one at a time on this task, so deliveries
//! for a subscription are never concurrent.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use serde_json::value::RawValue;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::connection::Connection;
use super::keepalive::KeepaliveMonitor;
use super::message::{DataPayload, InboundMessage, MessageType};
use super::registry::{SubscriptionEvent, SubscriptionHandler};
use crate::response::{GraphQLError, GraphQLErrors};

const TARGET: &str = "horizon_lattice_graphql::ws";

/// Start the read task for one connection epoch.
pub(crate) fn spawn_reader<S>(connection: Arc<Connection>, stream: S, epoch: u64) -> JoinHandle<()>
where
    S: Stream<Item = Result<Message, WsError>> + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let reason = run_read_loop(&connection, stream, epoch).await;
        connection.handle_loss(epoch, &reason).await;
    })
}

/// Read until the connection fails, returning why it stopped.
async fn run_read_loop<S>(connection: &Arc<Connection>, mut stream: S, epoch: u64) -> String
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut keepalive = KeepaliveMonitor::new(connection.config().keepalive_timeout);
    let receive_timeout = connection.config().receive_timeout;
    if !keepalive.is_enabled() {
        tracing::debug!(target: TARGET, "Keepalive check disabled for epoch {}", epoch);
    }

    loop {
        let received = match receive_timeout {
            Some(limit) => tokio::time::timeout(limit, stream.next()).await.ok(),
            None => Some(stream.next().await),
        };

        // Checked before the frame is looked at: a frame that arrives after
        // the timeout does not revive the connection.
        let now = Instant::now();
        if keepalive.is_expired_at(now) {
            return "keepalive timeout".to_string();
        }

        let Some(received) = received else {
            continue;
        };

        match received {
            None => return "stream ended".to_string(),
            Some(Err(e)) => return format!("read error: {e}"),
            Some(Ok(Message::Text(text))) => {
                keepalive.touch(now);
                dispatch_text(connection, epoch, text.as_str(), &mut keepalive, now).await;
            }
            Some(Ok(Message::Binary(bytes))) => {
                keepalive.touch(now);
                match std::str::from_utf8(&bytes) {
                    Ok(text) => dispatch_text(connection, epoch, text, &mut keepalive, now).await,
                    Err(_) => tracing::debug!(
                        target: TARGET,
                        "Ignoring non-UTF-8 binary frame of {} bytes",
                        bytes.len()
                    ),
                }
            }
            Some(Ok(Message::Close(frame))) => {
                return match frame {
                    Some(frame) => format!(
                        "closed by server: {} {}",
                        u16::from(frame.code),
                        frame.reason.as_str()
                    ),
                    None => "closed by server".to_string(),
                };
            }
            Some(Ok(_)) => {
                // Ping/pong are answered by tungstenite
                keepalive.touch(now);
            }
        }
    }
}

async fn dispatch_text(
    connection: &Arc<Connection>,
    epoch: u64,
    text: &str,
    keepalive: &mut KeepaliveMonitor,
    now: Instant,
) {
    let frame = match InboundMessage::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(target: TARGET, "Skipping malformed frame: {}", e);
            return;
        }
    };
    connection.trace(|| format!("recv {text}"));

    let id = frame.id_str();
    match &frame.kind {
        MessageType::ConnectionAck => {
            connection.mark_acknowledged(epoch);
            tracing::debug!(target: TARGET, "Connection acknowledged");
        }
        MessageType::ConnectionError => {
            tracing::warn!(
                target: TARGET,
                "Server rejected connection: {}",
                frame.payload.as_deref().map(RawValue::get).unwrap_or("null")
            );
        }
        MessageType::KeepAlive => keepalive.arm(now),
        MessageType::Complete => match connection.registry().remove(id) {
            Some(handler) => {
                deliver(
                    id,
                    handler.as_ref(),
                    SubscriptionEvent {
                        completed: true,
                        ..Default::default()
                    },
                );
            }
            None => stop_unknown(connection, epoch, id).await,
        },
        MessageType::Error => match connection.registry().remove(id) {
            Some(handler) => {
                let message = error_message(frame.payload.as_deref());
                deliver(
                    id,
                    handler.as_ref(),
                    SubscriptionEvent {
                        errors: GraphQLErrors::from(vec![GraphQLError::new(message)]),
                        ..Default::default()
                    },
                );
            }
            None => stop_unknown(connection, epoch, id).await,
        },
        MessageType::Data => {
            let Some(handler) = connection.registry().get(id) else {
                stop_unknown(connection, epoch, id).await;
                return;
            };
            let payload: DataPayload = match frame.payload_as() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(target: TARGET, "Skipping malformed data for {}: {}", id, e);
                    return;
                }
            };
            let event = SubscriptionEvent {
                data: payload.data,
                errors: payload.errors,
                completed: false,
            };
            if !deliver(id, handler.as_ref(), event)
                && let Err(e) = connection.unsubscribe(id).await
            {
                tracing::warn!(target: TARGET, "Failed to stop subscription {}: {}", id, e);
            }
        }
        other => {
            tracing::debug!(target: TARGET, "Ignoring {} frame", other);
        }
    }
}

/// Invoke a handler, returning whether it wants more results.
fn deliver(id: &str, handler: &dyn SubscriptionHandler, event: SubscriptionEvent) -> bool {
    match handler.handle(event) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(target: TARGET, "Handler for subscription {} stopped: {}", id, e);
            false
        }
    }
}

async fn stop_unknown(connection: &Arc<Connection>, epoch: u64, id: &str) {
    tracing::debug!(target: TARGET, "Frame for unknown subscription {}", id);
    if let Err(e) = connection.send_stop(epoch, id).await {
        tracing::warn!(target: TARGET, "Failed to stop unknown subscription {}: {}", id, e);
    }
}

/// The message reported to a handler for an `error` frame.
///
/// String payloads are unquoted and objects contribute their `message`
/// field. Anything else is passed through as JSON text.
pub(crate) fn error_message(payload: Option<&RawValue>) -> String {
    let Some(raw) = payload else {
        return String::new();
    };
    match serde_json::from_str::<Value>(raw.get()) {
        Ok(Value::String(message)) => message,
        Ok(Value::Object(object)) => match object.get("message") {
            Some(Value::String(message)) => message.clone(),
            _ => raw.get().to_string(),
        },
        _ => raw.get().to_string(),
    }
}
