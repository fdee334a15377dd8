//! Boundary to the shared real-time document store.
//!
//! The core never talks to a concrete backend; everything goes through the
//! object-safe [`DocumentStore`] trait so the embedding layer can plug in
//! whatever store the deployment uses. [`MemoryStore`] backs tests and local
//! development.

mod memory;

use std::error::Error;

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub use memory::MemoryStore;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error raised by store backends regardless of the underlying transport.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or rejected the operation.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Human-readable context for the failure.
        message: String,
        /// Backend-specific cause.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// A document payload could not be encoded or decoded.
    #[error("document serialization failed")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StoreError::Unavailable {
            message,
            source: Box::new(source),
        }
    }
}

/// Change notification delivered to a document subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum DocEvent {
    /// The document exists with this content. Delivered once on subscribe
    /// when the document already exists, then on every write.
    Updated(Value),
    /// The document was deleted after the subscription was established.
    Deleted,
}

/// Live subscription to one document.
///
/// Dropping the subscription unsubscribes: the backend notices the closed
/// channel on its next delivery and forgets the subscriber.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::UnboundedReceiver<DocEvent>,
}

impl Subscription {
    /// Wrap a receiver produced by a backend.
    pub fn new(events: mpsc::UnboundedReceiver<DocEvent>) -> Self {
        Self { events }
    }

    /// Wait for the next change notification; `None` once the backend side
    /// is gone.
    pub async fn next_event(&mut self) -> Option<DocEvent> {
        self.events.recv().await
    }

    /// Non-blocking poll used by synchronous drains in tests.
    pub fn try_next(&mut self) -> Option<DocEvent> {
        self.events.try_recv().ok()
    }

    /// Adapt the subscription into a [`futures::Stream`] of events.
    pub fn into_stream(self) -> UnboundedReceiverStream<DocEvent> {
        UnboundedReceiverStream::new(self.events)
    }
}

/// Abstraction over the shared real-time document store.
///
/// All methods return boxed futures so the trait stays object-safe and can be
/// held as `Arc<dyn DocumentStore>` by every component.
pub trait DocumentStore: Send + Sync {
    /// Read a document, `None` when it does not exist.
    fn get(&self, key: &str) -> BoxFuture<'static, StoreResult<Option<Value>>>;
    /// Create or fully replace a document.
    fn set(&self, key: &str, value: Value) -> BoxFuture<'static, StoreResult<()>>;
    /// Shallow-merge `partial` into an existing document (or create it).
    fn update(&self, key: &str, partial: Value) -> BoxFuture<'static, StoreResult<()>>;
    /// Delete a document. Deleting a missing document is a no-op.
    fn delete(&self, key: &str) -> BoxFuture<'static, StoreResult<()>>;
    /// Subscribe to changes of a document. If the document currently exists
    /// its content is delivered immediately as the first event.
    fn subscribe(&self, key: &str) -> BoxFuture<'static, StoreResult<Subscription>>;
}
