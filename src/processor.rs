//! Processing loop that consumes messages published by a source.
//!
//! This module implements a generic *message processor* that:
//!
//! - Subscribes to a source's notification channels before starting it
//! - Starts the source and consumes published envelopes one at a time
//! - Hands each message to a [`ProcessMessage`] handler
//! - Exposes lifecycle hooks for observability and customization
//!
//! The processor runs until:
//! - The source's channels close
//! - Starting or stopping the source fails
//! - A [`CancellationToken`] is triggered

use std::marker::PhantomData;

use tokio_util::sync::CancellationToken;

use crate::{
    source::{MessageSource, SourceError},
    Envelope,
};

/// Trait implemented by message handlers.
///
/// A handler receives each message accepted by the source, one at a time
/// in arrival order. Retry and backoff policies are the handler's own
/// business; a failed message is reported through the processor hook and
/// the loop moves on.
#[async_trait::async_trait]
pub trait ProcessMessage<M>: Send {
    /// Handler-specific error type.
    type Error: Into<tower::BoxError>;

    /// Process a single message.
    ///
    /// The token is the processor's own; long-running handlers may honor
    /// it for cooperative cancellation.
    async fn process(&mut self, message: M, cancel: &CancellationToken)
        -> Result<(), Self::Error>;
}

/// Message processor.
///
/// The `Processor` owns a message source, subscribes to its channels, and
/// delivers every published envelope to a handler serially.
///
/// Generic parameters:
/// - `M`: message payload type
/// - `S`: message source implementation
/// - `P`: handler implementation
/// - `HK`: hook implementation for lifecycle events
pub struct Processor<M, S, P, HK> {
    source: S,
    handler: P,
    hook: HK,
    message_marker: PhantomData<M>,
}

impl<M, S, P> Processor<M, S, P, DefaultProcessorHook>
where
    S: MessageSource<M>,
    P: ProcessMessage<M>,
{
    /// Create a new processor with the default hook implementation.
    pub fn new(source: S, handler: P) -> Self {
        Self {
            source,
            handler,
            hook: DefaultProcessorHook,
            message_marker: PhantomData,
        }
    }
}

impl<M, S, P, HK> Processor<M, S, P, HK>
where
    M: Clone + Send + 'static,
    S: MessageSource<M> + Send,
    P: ProcessMessage<M>,
    HK: ProcessorHook<M>,
{
    /// Replace the processor hook while keeping all other generics
    /// unchanged.
    ///
    /// This allows customizing behavior (logging, metrics, etc.) without
    /// rebuilding the processor.
    pub fn with_hook<HK2: ProcessorHook<M>>(self, hook: HK2) -> Processor<M, S, P, HK2> {
        Processor {
            source: self.source,
            handler: self.handler,
            hook,
            message_marker: self.message_marker,
        }
    }

    /// Run the processing loop.
    ///
    /// The processor:
    /// - Subscribes to the source's message and error channels
    /// - Starts the source
    /// - Processes each published envelope serially, in arrival order
    /// - Stops the source and drains already-published envelopes on
    ///   cancellation
    ///
    /// Handler failures are reported through the hook and do not end the
    /// loop; failures to start or stop the source do.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ProcessorRunError> {
        self.hook.on_startup();

        let mut messages = self.source.subscribe_messages();
        let mut errors = self.source.subscribe_errors();

        self.source
            .start_receiving(cancel.child_token())
            .await
            .map_err(ProcessorRunError::source)?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown();
                    self.source
                        .stop_receiving(CancellationToken::new())
                        .await
                        .map_err(ProcessorRunError::source)?;
                    // The listener has drained; consume what it published.
                    while let Some(envelope) = messages.try_recv() {
                        self.dispatch(envelope, &cancel).await;
                    }
                    break;
                }
                envelope = messages.recv() => {
                    match envelope {
                        Some(envelope) => self.dispatch(envelope, &cancel).await,
                        None => break,
                    }
                }
                error = errors.recv() => {
                    if let Some(error) = error {
                        self.hook.on_source_error(error.as_ref());
                    }
                }
            }
        }

        Ok(())
    }

    async fn dispatch(&mut self, envelope: Envelope<M>, cancel: &CancellationToken) {
        self.hook.on_envelope(&envelope);

        let message = match envelope.into_message() {
            Ok(message) => message,
            Err(err) => {
                self.hook.on_process_error(&err);
                return;
            }
        };

        match self.handler.process(message, cancel).await {
            Ok(()) => self.hook.on_processed(),
            Err(err) => self.hook.on_process_error(err.into().as_ref()),
        }
    }
}

/// Error returned when the processing loop fails.
#[derive(Debug)]
pub struct ProcessorRunError {
    context: tracing_error::SpanTrace,
    kind: ProcessorRunErrorKind,
}

impl ProcessorRunError {
    fn source(error: SourceError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: ProcessorRunErrorKind::Source(error),
        }
    }

    /// The kind of failure this error represents.
    pub fn kind(&self) -> &ProcessorRunErrorKind {
        &self.kind
    }
}

/// Classification of processor runtime errors.
#[derive(Debug)]
pub enum ProcessorRunErrorKind {
    /// Errors originating from the source lifecycle.
    Source(SourceError),
}

impl std::fmt::Display for ProcessorRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ProcessorRunErrorKind::Source(err) => writeln!(f, "Source error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ProcessorRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ProcessorRunErrorKind::Source(err) => Some(err),
        }
    }
}

/// Hook trait for observing processor lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking
/// work. Typical use cases include logging, metrics, and tracing
/// integration.
pub trait ProcessorHook<M>: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_envelope(&self, envelope: &Envelope<M>);
    fn on_processed(&self);
    fn on_process_error(&self, error: &dyn std::error::Error);
    fn on_source_error(&self, error: &dyn std::error::Error);
}

/// Default processor hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultProcessorHook;

impl<M> ProcessorHook<M> for DefaultProcessorHook {
    fn on_startup(&self) {
        tracing::info!("Processor is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Processor is shutting down");
    }

    fn on_envelope(&self, _envelope: &Envelope<M>) {
        tracing::debug!("Envelope received");
    }

    fn on_processed(&self) {
        tracing::debug!("Message processed");
    }

    fn on_process_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Error processing message");
    }

    fn on_source_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Source reported an error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemorySource;
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    struct Recorder {
        seen: Arc<Mutex<Vec<u32>>>,
        fail_on: Option<u32>,
    }

    #[async_trait::async_trait]
    impl ProcessMessage<u32> for Recorder {
        type Error = std::io::Error;

        async fn process(
            &mut self,
            message: u32,
            _cancel: &CancellationToken,
        ) -> Result<(), Self::Error> {
            if self.fail_on == Some(message) {
                return Err(std::io::Error::other("rejected"));
            }
            self.seen.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn processes_messages_serially_in_arrival_order() {
        let source = InMemorySource::<u32>::default();
        let feed = source.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = Recorder {
            seen: Arc::clone(&seen),
            fail_on: None,
        };
        let cancel = CancellationToken::new();

        let run = tokio::spawn(Processor::new(source, handler).run(cancel.clone()));
        // Give the processor time to subscribe and start the source.
        tokio::time::sleep(Duration::from_millis(100)).await;

        for n in 0..5 {
            feed.receive(Envelope::new(n)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn a_failing_handler_does_not_stop_the_loop() {
        let source = InMemorySource::<u32>::default();
        let feed = source.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = Recorder {
            seen: Arc::clone(&seen),
            fail_on: Some(1),
        };
        let cancel = CancellationToken::new();

        let run = tokio::spawn(Processor::new(source, handler).run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        feed.receive(Envelope::new(1)).await.unwrap();
        feed.receive(Envelope::new(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn cancellation_drains_already_published_envelopes() {
        let source = InMemorySource::<u32>::default();
        let feed = source.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = Recorder {
            seen: Arc::clone(&seen),
            fail_on: None,
        };
        let cancel = CancellationToken::new();

        let run = tokio::spawn(Processor::new(source, handler).run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        for n in 0..3 {
            feed.receive(Envelope::new(n)).await.unwrap();
        }
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn a_source_that_fails_to_start_fails_the_run() {
        let mut source = InMemorySource::<u32>::default();
        source
            .start_receiving(CancellationToken::new())
            .await
            .unwrap();
        source
            .stop_receiving(CancellationToken::new())
            .await
            .unwrap();

        let handler = Recorder {
            seen: Arc::new(Mutex::new(Vec::new())),
            fail_on: None,
        };

        let err = Processor::new(source, handler)
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ProcessorRunErrorKind::Source(_)));
    }
}
