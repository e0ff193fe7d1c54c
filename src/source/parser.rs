//! Request payload parsers.
//!
//! A parser turns the raw body of an inbound request into a typed message.
//! Parsers are swappable per source instance; the default is [`JsonParser`].

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing_error::SpanTrace;

/// Trait implemented by request payload parsers.
///
/// `parse` is side-effect free: the body has already been read from the
/// wire exactly once and is handed over as a byte slice.
#[async_trait]
pub trait RequestParser<M>: Send + Sync {
    /// Parse a raw request body into a message.
    async fn parse(&self, body: &[u8]) -> Result<M, ParseError>;
}

/// Default parser: deserializes a UTF-8 JSON body via `serde_json`.
///
/// Tolerant of any whitespace or indentation in the payload. Invalid
/// syntax, type mismatches and missing required fields all surface as
/// [`ParseError`]s.
pub struct JsonParser<M> {
    _message: PhantomData<fn() -> M>,
}

impl<M> Default for JsonParser<M> {
    fn default() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<M> RequestParser<M> for JsonParser<M>
where
    M: DeserializeOwned + Send,
{
    async fn parse(&self, body: &[u8]) -> Result<M, ParseError> {
        serde_json::from_slice(body).map_err(ParseError::from)
    }
}

/// Error returned when a request body cannot be parsed into a message.
#[derive(Debug)]
pub struct ParseError {
    context: SpanTrace,
    kind: ParseErrorKind,
}

/// Parse error kinds.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// The payload is not a structurally valid message.
    Malformed(tower::BoxError),
}

impl ParseError {
    /// Create a malformed-payload parse error.
    pub fn malformed(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ParseErrorKind::Malformed(err),
        }
    }

    /// The kind of failure this error represents.
    pub fn kind(&self) -> &ParseErrorKind {
        &self.kind
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed(Box::new(err))
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ParseErrorKind::Malformed(err) => writeln!(f, "Malformed payload: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ParseErrorKind::Malformed(err) => Some(err.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Note {
        id: u32,
        text: String,
    }

    #[tokio::test]
    async fn parses_a_well_formed_body() {
        let parser = JsonParser::<Note>::default();

        let note = parser
            .parse(br#"{"id":1,"text":"hello"}"#)
            .await
            .unwrap();

        assert_eq!(
            note,
            Note {
                id: 1,
                text: "hello".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn tolerates_indented_payloads() {
        let parser = JsonParser::<Note>::default();

        let body = b"{\n    \"id\": 1,\n    \"text\": \"hello\"\n}\n";
        assert!(parser.parse(body).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_invalid_syntax() {
        let parser = JsonParser::<Note>::default();

        let err = parser.parse(b"not-json").await.unwrap_err();
        assert!(matches!(err.kind(), ParseErrorKind::Malformed(_)));
    }

    #[tokio::test]
    async fn rejects_missing_required_fields() {
        let parser = JsonParser::<Note>::default();

        assert!(parser.parse(br#"{"id":1}"#).await.is_err());
    }

    #[tokio::test]
    async fn rejects_type_mismatches() {
        let parser = JsonParser::<Note>::default();

        assert!(parser.parse(br#"{"id":"one","text":"hello"}"#).await.is_err());
    }
}
