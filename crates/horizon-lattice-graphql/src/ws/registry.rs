//! Live subscriptions and their handlers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;

use crate::error::{Error, Result};
use crate::response::GraphQLErrors;

/// Error returned by a handler to ask for its subscription to be stopped.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// One delivery to a subscription handler.
#[derive(Debug, Default)]
pub struct SubscriptionEvent {
    /// The `data` member of the result, undecoded.
    pub data: Option<Box<RawValue>>,
    /// Errors reported by the server for this result.
    pub errors: GraphQLErrors,
    /// Set on the final delivery after the server completed the operation.
    pub completed: bool,
}

impl SubscriptionEvent {
    /// Decode the data member into a concrete type.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = self.data.as_deref().map(RawValue::get).unwrap_or("null");
        serde_json::from_str(raw).map_err(|e| Error::json_with_body(e, raw))
    }

    /// Check if the server reported errors.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Receives the results of one subscription.
///
/// Returning an error unsubscribes the operation.
pub trait SubscriptionHandler: Send + Sync + 'static {
    /// Handle one event.
    fn handle(&self, event: SubscriptionEvent) -> std::result::Result<(), HandlerError>;
}

impl<F> SubscriptionHandler for F
where
    F: Fn(SubscriptionEvent) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, event: SubscriptionEvent) -> std::result::Result<(), HandlerError> {
        self(event)
    }
}

/// Concurrency-safe map from subscription id to handler.
///
/// The lock is never held while a handler runs.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    handlers: Mutex<HashMap<String, Arc<dyn SubscriptionHandler>>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn put(&self, id: impl Into<String>, handler: Arc<dyn SubscriptionHandler>) {
        self.handlers.lock().insert(id.into(), handler);
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<dyn SubscriptionHandler>> {
        self.handlers.lock().get(id).cloned()
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Arc<dyn SubscriptionHandler>> {
        self.handlers.lock().remove(id)
    }

    /// Remove every entry, calling `notify` for each id without stopping at
    /// the first failure. Returns the first error.
    pub(crate) async fn remove_all<F, Fut>(&self, mut notify: F) -> Result<()>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let ids: Vec<String> = {
            let mut handlers = self.handlers.lock();
            let mut ids: Vec<String> = handlers.drain().map(|(id, _)| id).collect();
            ids.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));
            ids
        };

        let mut first_error = None;
        for id in ids {
            if let Err(e) = notify(id).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drop every entry without notification.
    pub(crate) fn clear(&self) -> usize {
        let mut handlers = self.handlers.lock();
        let count = handlers.len();
        handlers.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.handlers.lock().contains_key(id)
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("len", &self.len())
            .finish()
    }
}
