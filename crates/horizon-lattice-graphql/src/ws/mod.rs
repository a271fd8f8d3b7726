//! GraphQL subscriptions over WebSocket.
//!
//! Speaks the `graphql-ws` subprotocol (the `subscriptions-transport-ws`
//! envelope vocabulary: `connection_init`, `start`, `stop`, `data`, `ka`, ...).
//! One physical connection carries every subscription of a client:
//!
//! - Lazy connection on the first subscription
//! - Ordered queueing of frames sent while connecting
//! - Keepalive liveness detection
//! - Automatic reconnection with exponential backoff
//! - Replaceable transport through the [`Dialer`] trait
//!
//! # Example
//!
//! ```ignore
//! use horizon_lattice_graphql::ws::{SubscriptionClient, SubscriptionConfig, SubscriptionEvent};
//!
//! let client = SubscriptionClient::new(SubscriptionConfig::new("ws://localhost:8080/graphql"));
//!
//! client
//!     .subscribe(
//!         GraphQLRequest::new("subscription { tick }"),
//!         |event: SubscriptionEvent| {
//!             if event.completed {
//!                 println!("done");
//!             }
//!             Ok(())
//!         },
//!     )
//!     .await?;
//! ```

mod backoff;
mod client;
mod connection;
mod dialer;
mod dispatch;
mod keepalive;
mod message;
mod queue;
mod registry;

pub use backoff::ReconnectConfig;
pub use client::{LogHook, SubscriptionClient, SubscriptionConfig};
pub use connection::{ConnectionInfo, ConnectionState};
pub use dialer::{
    DialRequest, Dialer, FrameSink, FrameStream, GRAPHQL_WS_PROTOCOL, Transport,
    TungsteniteDialer,
};
pub use keepalive::MIN_KEEPALIVE_TIMEOUT;
pub use message::{InboundMessage, MessageType, OutboundMessage};
pub use registry::{HandlerError, SubscriptionEvent, SubscriptionHandler};
