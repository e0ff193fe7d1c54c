//! Message source abstractions and notification channels.
//!
//! This module defines the capability implemented by message sources: a
//! source ingests messages from some transport (or accepts them in-process)
//! and republishes every accepted message through its notification channels.
//!
//! ## Key components
//!
//! - [`MessageSource`]: Trait implemented by concrete source backends
//! - [`Publisher`] / [`Subscription`]: Subscribe/unsubscribe/publish channels
//! - [`SourceError`]: Unified error type with tracing context
//!
//! Two channels exist per source: one carries [`Envelope`]s of accepted
//! messages, the other carries errors. For a single inbound event exactly
//! one of the two fires, never both.

mod inmemory;

#[cfg(feature = "http")]
pub mod http;

pub mod parser;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::Envelope;
use parser::ParseError;

pub use inmemory::InMemorySource;

/// Trait implemented by concrete message source backends.
///
/// A source is a one-shot listener: it moves from created to listening to
/// stopped, and a stopped source cannot be restarted. Messages reach
/// subscribers either through the source's own transport or through
/// [`receive`](MessageSource::receive), which bypasses the transport
/// entirely.
#[async_trait]
pub trait MessageSource<M> {
    /// Accept a message handed over by another in-process component.
    ///
    /// The message is published exactly as if it had arrived over the
    /// source's transport. Empty envelopes are suppressed and never reach
    /// subscribers.
    async fn receive(&self, message: Envelope<M>) -> Result<(), SourceError>;

    /// Begin listening for messages on the source's transport.
    ///
    /// Returns once listening is active. The token governs the listener's
    /// own startup and shutdown machinery, not individual in-flight
    /// requests.
    async fn start_receiving(&mut self, cancel: CancellationToken) -> Result<(), SourceError>;

    /// Stop accepting new messages and drain in-flight handling.
    ///
    /// Idempotent; stopping a source that was never started is a no-op.
    /// The token bounds how long the caller waits for the drain.
    async fn stop_receiving(&mut self, cancel: CancellationToken) -> Result<(), SourceError>;

    /// Subscribe to envelopes published by this source.
    fn subscribe_messages(&self) -> Subscription<Envelope<M>>;

    /// Subscribe to errors published by this source.
    fn subscribe_errors(&self) -> Subscription<Arc<SourceError>>;
}

/// Error returned or published by message sources.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct SourceError {
    context: SpanTrace,
    kind: SourceErrorKind,
}

/// Source error kinds.
#[derive(Debug)]
pub enum SourceErrorKind {
    /// The listener's underlying resource could not be acquired.
    StartFailed(tower::BoxError),
    /// Start was called while the source was already listening.
    AlreadyListening,
    /// Start was called on a source that has already been stopped.
    Stopped,
    /// An inbound payload could not be parsed into a message.
    Parse(ParseError),
    /// An inbound request body could not be read.
    Request(tower::BoxError),
}

impl SourceError {
    /// Create a listener-start failure.
    pub fn start_failed(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SourceErrorKind::StartFailed(err),
        }
    }

    /// Create an already-listening failure.
    pub fn already_listening() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SourceErrorKind::AlreadyListening,
        }
    }

    /// Create a source-stopped failure.
    pub fn stopped() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SourceErrorKind::Stopped,
        }
    }

    /// Create a parse failure.
    pub fn parse(err: ParseError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SourceErrorKind::Parse(err),
        }
    }

    /// Create a request-read failure.
    pub fn request(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SourceErrorKind::Request(err),
        }
    }

    /// The kind of failure this error represents.
    pub fn kind(&self) -> &SourceErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SourceErrorKind::StartFailed(err) => writeln!(f, "Failed to start listener: {err}"),
            SourceErrorKind::AlreadyListening => writeln!(f, "Source is already listening"),
            SourceErrorKind::Stopped => {
                writeln!(f, "Source has been stopped and cannot be restarted")
            }
            SourceErrorKind::Parse(err) => writeln!(f, "Failed to parse inbound payload: {err}"),
            SourceErrorKind::Request(err) => writeln!(f, "Failed to read inbound request: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SourceErrorKind::StartFailed(err) | SourceErrorKind::Request(err) => {
                Some(err.as_ref())
            }
            SourceErrorKind::Parse(err) => Some(err),
            SourceErrorKind::AlreadyListening | SourceErrorKind::Stopped => None,
        }
    }
}

/// Default capacity of a subscription channel.
const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 100;

/// Identifier of a registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Notification channel with subscribe/unsubscribe/publish semantics.
///
/// Each subscriber gets its own bounded channel. [`publish`](Publisher::publish)
/// snapshots the subscriber list before delivering, so subscriptions may
/// come and go concurrently with a publish without corrupting delivery.
/// Subscribers whose receiving end has been dropped are pruned at the next
/// publish.
///
/// Cloning a `Publisher` yields a handle to the same subscriber list.
pub struct Publisher<T> {
    subscribers: Arc<Mutex<Vec<(SubscriptionId, mpsc::Sender<T>)>>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T> Default for Publisher<T> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<T> Publisher<T> {
    fn subscribers(&self) -> MutexGuard<'_, Vec<(SubscriptionId, mpsc::Sender<T>)>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a subscriber.
    ///
    /// Unknown identifiers are ignored, so unsubscribing twice is harmless.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers().retain(|(sid, _)| *sid != id);
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}

impl<T: Clone> Publisher<T> {
    /// Register a new subscriber with the default channel capacity.
    pub fn subscribe(&self) -> Subscription<T> {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIPTION_CAPACITY)
    }

    /// Register a new subscriber with an explicit channel capacity.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription<T> {
        let (tx, receiver) = mpsc::channel(capacity);
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers().push((id, tx));
        Subscription { id, receiver }
    }

    /// Deliver an item to every current subscriber.
    ///
    /// The subscriber list is snapshotted first; subscribers registered
    /// while a publish is in progress receive the next item. Delivery
    /// applies per-subscriber backpressure. With no subscribers this is a
    /// no-op; nothing is buffered for later.
    pub async fn publish(&self, item: T) {
        let targets: Vec<(SubscriptionId, mpsc::Sender<T>)> = self.subscribers().clone();

        let mut closed = Vec::new();
        for (id, tx) in targets {
            if tx.send(item.clone()).await.is_err() {
                closed.push(id);
            }
        }

        for id in closed {
            self.unsubscribe(id);
        }
    }
}

/// Receiving end of a [`Publisher`] channel.
pub struct Subscription<T> {
    id: SubscriptionId,
    receiver: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    /// Identifier to pass to [`Publisher::unsubscribe`].
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Receive the next published item.
    ///
    /// Returns `None` once the publisher has been dropped and every
    /// buffered item has been consumed.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Take an already published item without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let publisher = Publisher::<u32>::default();
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();

        publisher.publish(7).await;

        assert_eq!(first.recv().await, Some(7));
        assert_eq!(second.recv().await, Some(7));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let publisher = Publisher::<u32>::default();

        publisher.publish(7).await;

        // A late subscriber must not see items published before it existed.
        let mut late = publisher.subscribe();
        assert_eq!(late.try_recv(), None);
    }

    #[tokio::test]
    async fn unsubscribed_receivers_stop_getting_items() {
        let publisher = Publisher::<u32>::default();
        let mut kept = publisher.subscribe();
        let mut removed = publisher.subscribe();

        publisher.unsubscribe(removed.id());
        publisher.publish(7).await;

        assert_eq!(kept.recv().await, Some(7));
        // The sender side was dropped by unsubscribe, so the channel ends.
        assert_eq!(removed.recv().await, None);
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned() {
        let publisher = Publisher::<u32>::default();
        let mut kept = publisher.subscribe();
        let dropped = publisher.subscribe();
        drop(dropped);

        publisher.publish(7).await;

        assert_eq!(kept.recv().await, Some(7));
        assert_eq!(publisher.subscriber_count(), 1);
    }
}
