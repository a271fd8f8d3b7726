//! GraphQL client for Horizon Lattice.
//!
//! This crate provides GraphQL capabilities for Horizon Lattice applications:
//!
//! - **HTTP**: Queries and mutations, single or batched
//! - **File uploads**: Multipart requests following the GraphQL multipart request convention
//! - **Subscriptions**: Many operations multiplexed over one WebSocket, with
//!   keepalive detection and automatic reconnection
//!
//! # Queries and Mutations
//!
//! ```ignore
//! use horizon_lattice_graphql::{GraphQLClient, GraphQLRequest};
//!
//! let client = GraphQLClient::builder("https://api.example.com/graphql")
//!     .bearer_auth("my-token")
//!     .build()?;
//!
//! let request = GraphQLRequest::new("query($id: ID!) { user(id: $id) { name } }")
//!     .variable("id", "42");
//! let user: serde_json::Value = client.run(request).await?;
//! ```
//!
//! ## Batches
//!
//! ```ignore
//! let responses = client
//!     .execute_batch(vec![
//!         GraphQLRequest::new("{ a }"),
//!         GraphQLRequest::new("{ b }"),
//!     ])
//!     .await?;
//! ```
//!
//! ## File Uploads
//!
//! ```ignore
//! let avatar = Upload::from_path("avatar.png").await?.mime_type("image/png");
//! let request = GraphQLRequest::new("mutation($file: Upload!) { setAvatar(file: $file) }")
//!     .upload("file", avatar);
//! client.execute(request).await?;
//! ```
//!
//! # Subscriptions
//!
//! ```ignore
//! use horizon_lattice_graphql::{SubscriptionClient, SubscriptionConfig, SubscriptionEvent};
//!
//! let subscriptions = client.subscription_client();
//!
//! let id = subscriptions
//!     .subscribe(
//!         GraphQLRequest::new("subscription { messageAdded { body } }"),
//!         |event: SubscriptionEvent| {
//!             let message: serde_json::Value = event.data()?;
//!             println!("{message}");
//!             Ok(())
//!         },
//!     )
//!     .await?;
//!
//! subscriptions.unsubscribe(&id).await?;
//! subscriptions.close().await?;
//! ```

mod client;
mod error;
mod request;
mod response;
pub mod ws;

pub use client::{GraphQLClient, GraphQLClientBuilder};
pub use error::{Error, Result};
pub use request::{GraphQLRequest, Upload};
pub use response::{GraphQLError, GraphQLErrors, GraphQLLocation, GraphQLResponse, PathSegment};

// Re-export commonly used subscription types at the crate root
pub use ws::{
    ConnectionInfo, ConnectionState, HandlerError, ReconnectConfig, SubscriptionClient,
    SubscriptionConfig, SubscriptionEvent, SubscriptionHandler,
};
