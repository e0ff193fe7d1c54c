//! HTTP message source backend.
//!
//! Binds a TCP listener, routes `POST` bodies through a [`RequestParser`]
//! and republishes the outcome on the source's notification channels. The
//! listener's lifecycle is one-shot: `Created → Listening → Stopped`.
//!
//! ## Key components
//!
//! - [`HttpMessageSource`]: The [`MessageSource`] implementation
//! - [`HttpMessageSourceBuilder`]: Validating builder; the only way to
//!   construct a source
//! - [`ingest`]: The request handler the default route wiring mounts
//! - [`BuildError`]: Configuration failures, raised before any network
//!   resource is touched

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, State},
    http::StatusCode,
    routing::post,
    Router,
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_error::SpanTrace;
use url::Url;

use crate::{
    source::{
        parser::{JsonParser, RequestParser},
        MessageSource, Publisher, SourceError, Subscription,
    },
    Envelope,
};

/// Router configuration callback used by the builder overrides.
pub type RouterConfig<M> =
    Box<dyn FnOnce(Router<IngestState<M>>) -> Router<IngestState<M>> + Send + Sync>;

/// State shared with the request handlers of an [`HttpMessageSource`].
///
/// Exposed so custom route wiring can mount [`ingest`] (or a handler of its
/// own) against the same parser and channels.
pub struct IngestState<M> {
    parser: Arc<dyn RequestParser<M>>,
    messages: Publisher<Envelope<M>>,
    errors: Publisher<Arc<SourceError>>,
}

impl<M> Clone for IngestState<M> {
    fn clone(&self) -> Self {
        Self {
            parser: Arc::clone(&self.parser),
            messages: self.messages.clone(),
            errors: self.errors.clone(),
        }
    }
}

impl<M> IngestState<M>
where
    M: Clone + Send + 'static,
{
    /// Publish an envelope on the message channel, suppressing empty ones.
    pub async fn publish_message(&self, envelope: Envelope<M>) {
        if !envelope.is_empty() {
            self.messages.publish(envelope).await;
        }
    }

    /// Publish an error on the error channel.
    pub async fn publish_error(&self, error: SourceError) {
        self.errors.publish(Arc::new(error)).await;
    }
}

/// Request handler the default route wiring mounts at `POST /`.
///
/// Reads the body, parses it, and publishes the outcome: a successfully
/// parsed message goes to the message channel (202 Accepted), a body-read
/// or parse failure goes to the error channel (400 Bad Request). Exactly
/// one of the two channels fires per request, and no failure escapes into
/// the listener's own control flow.
pub async fn ingest<M>(
    State(state): State<IngestState<M>>,
    body: Result<Bytes, BytesRejection>,
) -> StatusCode
where
    M: Clone + Send + 'static,
{
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Discarding unreadable request");
            state
                .publish_error(SourceError::request(Box::new(rejection)))
                .await;
            return StatusCode::BAD_REQUEST;
        }
    };

    match state.parser.parse(&body).await {
        Ok(message) => {
            state.publish_message(Envelope::new(message)).await;
            StatusCode::ACCEPTED
        }
        Err(err) => {
            tracing::debug!(error = %err, "Discarding unparseable request");
            state.publish_error(SourceError::parse(err)).await;
            StatusCode::BAD_REQUEST
        }
    }
}

/// Live network resource owned by a listening source.
///
/// Never handed out; dropping the source drops the shutdown sender, which
/// the serve task treats as a stop signal.
struct ListenerHandle {
    shutdown: oneshot::Sender<()>,
    served: JoinHandle<()>,
    local_addr: SocketAddr,
}

enum ListenerState {
    Created,
    Listening(ListenerHandle),
    Stopped,
}

/// Message source backed by an HTTP listener.
///
/// While listening, every `POST` to the configured URL's root path is read,
/// parsed and republished. Request failures are contained to the error
/// channel and never terminate the listener or a sibling in-flight request.
///
/// The lifecycle is one-shot: a stopped source stays stopped, and
/// restarting requires building a new instance.
pub struct HttpMessageSource<M> {
    url: String,
    authority: String,
    state: ListenerState,
    channels: IngestState<M>,
    routes: Option<RouterConfig<M>>,
    service: Option<RouterConfig<M>>,
    span: tracing::Span,
}

impl<M> std::fmt::Debug for HttpMessageSource<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMessageSource")
            .field("url", &self.url)
            .field("authority", &self.authority)
            .finish_non_exhaustive()
    }
}

impl<M> HttpMessageSource<M> {
    /// URL this source listens on.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Address the listener is bound to, while listening.
    ///
    /// Useful when the configured URL carries port 0 and the operating
    /// system picked the port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            ListenerState::Listening(handle) => Some(handle.local_addr),
            _ => None,
        }
    }
}

#[async_trait]
impl<M> MessageSource<M> for HttpMessageSource<M>
where
    M: Clone + Send + 'static,
{
    async fn receive(&self, message: Envelope<M>) -> Result<(), SourceError> {
        self.channels.publish_message(message).await;
        Ok(())
    }

    async fn start_receiving(&mut self, cancel: CancellationToken) -> Result<(), SourceError> {
        match self.state {
            ListenerState::Created => {}
            ListenerState::Listening(_) => return Err(SourceError::already_listening()),
            ListenerState::Stopped => return Err(SourceError::stopped()),
        }

        let listener = TcpListener::bind(self.authority.as_str())
            .await
            .map_err(|err| SourceError::start_failed(Box::new(err)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| SourceError::start_failed(Box::new(err)))?;

        let router = match self.routes.take() {
            Some(configure) => configure(Router::new()),
            None => Router::new().route("/", post(ingest::<M>)),
        };
        let router = match self.service.take() {
            Some(configure) => configure(router),
            None => router,
        };
        let router = router.with_state(self.channels.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let signal = async move {
            tokio::select! {
                _ = shutdown_rx => {}
                _ = cancel.cancelled() => {}
            }
        };

        let served = tokio::spawn(
            async move {
                tracing::info!(addr = %local_addr, "Listener started");
                if let Err(error) = axum::serve(listener, router)
                    .with_graceful_shutdown(signal)
                    .await
                {
                    tracing::error!(%error, "Listener terminated abnormally");
                }
                tracing::info!("Listener stopped");
            }
            .instrument(self.span.clone()),
        );

        self.state = ListenerState::Listening(ListenerHandle {
            shutdown: shutdown_tx,
            served,
            local_addr,
        });

        Ok(())
    }

    async fn stop_receiving(&mut self, cancel: CancellationToken) -> Result<(), SourceError> {
        if matches!(self.state, ListenerState::Created) {
            // Nothing to stop; the source stays startable.
            return Ok(());
        }

        let handle = match std::mem::replace(&mut self.state, ListenerState::Stopped) {
            ListenerState::Listening(handle) => handle,
            _ => return Ok(()),
        };

        let _ = handle.shutdown.send(());

        let mut served = handle.served;
        tokio::select! {
            result = &mut served => {
                if let Err(error) = result {
                    tracing::error!(%error, "Listener task failed during shutdown");
                }
            }
            _ = cancel.cancelled() => {
                tracing::warn!("Stop wait cancelled; listener drains in the background");
            }
        }

        Ok(())
    }

    fn subscribe_messages(&self) -> Subscription<Envelope<M>> {
        self.channels.messages.subscribe()
    }

    fn subscribe_errors(&self) -> Subscription<Arc<SourceError>> {
        self.channels.errors.subscribe()
    }
}

/// Builder for [`HttpMessageSource`].
///
/// Setters validate eagerly; [`build`](Self::build) checks the cross-field
/// requirements and assembles the source without touching any network
/// resource. Only `start_receiving` binds the port.
///
/// ## Example
///
/// ```rust
/// use inlet::source::http::HttpMessageSourceBuilder;
///
/// let source = HttpMessageSourceBuilder::<serde_json::Value>::new()
///     .listen_on("http://127.0.0.1:6007")?
///     .build()?;
/// # Ok::<(), inlet::source::http::BuildError>(())
/// ```
pub struct HttpMessageSourceBuilder<M> {
    url: Option<(String, String)>,
    parser: Arc<dyn RequestParser<M>>,
    routes: Option<RouterConfig<M>>,
    service: Option<RouterConfig<M>>,
    span: Option<tracing::Span>,
}

impl<M> std::fmt::Debug for HttpMessageSourceBuilder<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMessageSourceBuilder")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl<M> HttpMessageSourceBuilder<M>
where
    M: serde::de::DeserializeOwned + Send + 'static,
{
    /// Create a builder with the default JSON parser.
    pub fn new() -> Self {
        Self {
            url: None,
            parser: Arc::new(JsonParser::default()),
            routes: None,
            service: None,
            span: None,
        }
    }
}

impl<M> Default for HttpMessageSourceBuilder<M>
where
    M: serde::de::DeserializeOwned + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> HttpMessageSourceBuilder<M> {
    /// Make the source listen on the given URL.
    ///
    /// The URL must be non-blank, use the `http` scheme and carry a host.
    /// Port 0 is allowed; the bound address is then reported by
    /// [`HttpMessageSource::local_addr`].
    pub fn listen_on(mut self, url: &str) -> Result<Self, BuildError> {
        if url.trim().is_empty() {
            return Err(BuildError::empty_url());
        }

        let parsed = Url::parse(url).map_err(|err| BuildError::invalid_url(Box::new(err)))?;
        if parsed.scheme() != "http" {
            return Err(BuildError::unsupported_scheme(parsed.scheme()));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| BuildError::invalid_url("URL carries no host".into()))?;
        let port = parsed.port_or_known_default().unwrap_or(80);

        self.url = Some((url.to_owned(), format!("{host}:{port}")));
        Ok(self)
    }

    /// Use a custom request parser instead of the default JSON one.
    pub fn parser(mut self, parser: impl RequestParser<M> + 'static) -> Self {
        self.parser = Arc::new(parser);
        self
    }

    /// Override the route wiring.
    ///
    /// The callback receives a fresh router and returns the configured one;
    /// mount [`ingest`] to keep the built-in handling on custom paths. The
    /// default wiring routes `POST /` to [`ingest`].
    pub fn configure_routes(
        mut self,
        configure: impl FnOnce(Router<IngestState<M>>) -> Router<IngestState<M>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.routes = Some(Box::new(configure));
        self
    }

    /// Override the service wiring.
    ///
    /// Applied after the routes are mounted; the place to attach tower
    /// middleware via [`Router::layer`]. The default applies none.
    pub fn configure_service(
        mut self,
        configure: impl FnOnce(Router<IngestState<M>>) -> Router<IngestState<M>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.service = Some(Box::new(configure));
        self
    }

    /// Override the logging wiring.
    ///
    /// The listener task runs inside this span. The default is an info
    /// span naming the source and its URL.
    pub fn configure_logging(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Assemble the source.
    ///
    /// Fails if no listening URL was configured. Never binds the port;
    /// that happens in `start_receiving`.
    pub fn build(self) -> Result<HttpMessageSource<M>, BuildError> {
        let (url, authority) = match self.url {
            Some(pair) if !pair.0.trim().is_empty() => pair,
            _ => return Err(BuildError::missing_url()),
        };

        let span = self
            .span
            .unwrap_or_else(|| tracing::info_span!("http_message_source", url = %url));

        Ok(HttpMessageSource {
            channels: IngestState {
                parser: self.parser,
                messages: Publisher::default(),
                errors: Publisher::default(),
            },
            url,
            authority,
            state: ListenerState::Created,
            routes: self.routes,
            service: self.service,
            span,
        })
    }
}

/// Error returned when an [`HttpMessageSourceBuilder`] rejects its
/// configuration.
#[derive(Debug)]
pub struct BuildError {
    context: SpanTrace,
    kind: BuildErrorKind,
}

/// Build error kinds.
#[derive(Debug)]
pub enum BuildErrorKind {
    /// The supplied URL was empty or whitespace.
    EmptyUrl,
    /// The supplied URL could not be parsed or carries no usable host.
    InvalidUrl(tower::BoxError),
    /// The supplied URL uses a scheme other than `http`.
    UnsupportedScheme(String),
    /// `build` was called without a listening URL.
    MissingUrl,
}

impl BuildError {
    fn empty_url() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: BuildErrorKind::EmptyUrl,
        }
    }

    fn invalid_url(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: BuildErrorKind::InvalidUrl(err),
        }
    }

    fn unsupported_scheme(scheme: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: BuildErrorKind::UnsupportedScheme(scheme.to_owned()),
        }
    }

    fn missing_url() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: BuildErrorKind::MissingUrl,
        }
    }

    /// The kind of failure this error represents.
    pub fn kind(&self) -> &BuildErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            BuildErrorKind::EmptyUrl => {
                writeln!(f, "Listening URL cannot be empty or whitespace")
            }
            BuildErrorKind::InvalidUrl(err) => writeln!(f, "Invalid listening URL: {err}"),
            BuildErrorKind::UnsupportedScheme(scheme) => {
                writeln!(f, "Unsupported listening URL scheme: {scheme}")
            }
            BuildErrorKind::MissingUrl => writeln!(
                f,
                "Cannot build HTTP message source: a listening URL must be specified"
            ),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            BuildErrorKind::InvalidUrl(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
