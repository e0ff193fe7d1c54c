use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    source::{MessageSource, Publisher, SourceError, Subscription},
    Envelope,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Listening,
    Stopped,
}

/// In-memory message source for testing or local pipelines.
///
/// Implements [`MessageSource`] without any transport: [`receive`](MessageSource::receive)
/// is the only way in, and start/stop drive the same one-shot lifecycle as
/// a real listener without acquiring any resource. Useful for:
/// - Unit and integration testing
/// - Composing pipelines without a live network
///
/// Cloning yields a handle to the same channels and lifecycle state, so one
/// handle can feed messages while another is owned by a consumer.
pub struct InMemorySource<M> {
    messages: Publisher<Envelope<M>>,
    errors: Publisher<Arc<SourceError>>,
    state: Arc<Mutex<Lifecycle>>,
}

impl<M> Clone for InMemorySource<M> {
    fn clone(&self) -> Self {
        Self {
            messages: self.messages.clone(),
            errors: self.errors.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<M> Default for InMemorySource<M> {
    /// Create a new source in the created (not yet listening) state.
    fn default() -> Self {
        Self {
            messages: Publisher::default(),
            errors: Publisher::default(),
            state: Arc::new(Mutex::new(Lifecycle::Created)),
        }
    }
}

#[async_trait]
impl<M> MessageSource<M> for InMemorySource<M>
where
    M: Clone + Send + 'static,
{
    async fn receive(&self, message: Envelope<M>) -> Result<(), SourceError> {
        if !message.is_empty() {
            self.messages.publish(message).await;
        }
        Ok(())
    }

    async fn start_receiving(&mut self, _cancel: CancellationToken) -> Result<(), SourceError> {
        let mut state = self.state.lock().await;
        match *state {
            Lifecycle::Created => {
                *state = Lifecycle::Listening;
                Ok(())
            }
            Lifecycle::Listening => Err(SourceError::already_listening()),
            Lifecycle::Stopped => Err(SourceError::stopped()),
        }
    }

    async fn stop_receiving(&mut self, _cancel: CancellationToken) -> Result<(), SourceError> {
        let mut state = self.state.lock().await;
        if *state == Lifecycle::Listening {
            *state = Lifecycle::Stopped;
        }
        Ok(())
    }

    fn subscribe_messages(&self) -> Subscription<Envelope<M>> {
        self.messages.subscribe()
    }

    fn subscribe_errors(&self) -> Subscription<Arc<SourceError>> {
        self.errors.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceErrorKind;

    #[tokio::test]
    async fn receive_publishes_to_subscribers() {
        let source = InMemorySource::<u32>::default();
        let mut messages = source.subscribe_messages();

        source.receive(Envelope::new(42)).await.unwrap();

        assert_eq!(messages.recv().await, Some(Envelope::new(42)));
    }

    #[tokio::test]
    async fn empty_envelopes_are_suppressed() {
        let source = InMemorySource::<u32>::default();
        let mut messages = source.subscribe_messages();

        source.receive(Envelope::empty()).await.unwrap();
        source.receive(Envelope::new(42)).await.unwrap();

        // Only the non-empty envelope ever shows up.
        assert_eq!(messages.recv().await, Some(Envelope::new(42)));
        assert_eq!(messages.try_recv(), None);
    }

    #[tokio::test]
    async fn start_is_guarded_against_double_listen() {
        let mut source = InMemorySource::<u32>::default();

        source
            .start_receiving(CancellationToken::new())
            .await
            .unwrap();
        let err = source
            .start_receiving(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), SourceErrorKind::AlreadyListening));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_safe_before_start() {
        let mut source = InMemorySource::<u32>::default();

        source
            .stop_receiving(CancellationToken::new())
            .await
            .unwrap();

        source
            .start_receiving(CancellationToken::new())
            .await
            .unwrap();
        source
            .stop_receiving(CancellationToken::new())
            .await
            .unwrap();
        source
            .stop_receiving(CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn a_stopped_source_is_terminal() {
        let mut source = InMemorySource::<u32>::default();

        source
            .start_receiving(CancellationToken::new())
            .await
            .unwrap();
        source
            .stop_receiving(CancellationToken::new())
            .await
            .unwrap();

        let err = source
            .start_receiving(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), SourceErrorKind::Stopped));
    }
}
