/// Message container exchanged between a source and its subscribers.
///
/// `Envelope` wraps a single message payload and makes the "no message"
/// state explicit: an empty envelope can be constructed and handed around,
/// but the publish step suppresses it and subscribers never observe one.
///
/// ## Design
///
/// - `M` is the application-defined message payload; the core imposes no
///   shape on it beyond what each seam needs
/// - construction is explicit ([`new`](Envelope::new) / [`empty`](Envelope::empty));
///   there is no implicit conversion from a payload
/// - taking the payload out of an empty envelope is an error, not a panic
///
/// ## Example
///
/// ```rust
/// use inlet::Envelope;
///
/// let envelope = Envelope::new(42);
/// assert!(!envelope.is_empty());
/// assert_eq!(envelope.into_message().unwrap(), 42);
///
/// let empty = Envelope::<i32>::empty();
/// assert!(empty.into_message().is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    message: Option<M>,
}

impl<M> Envelope<M> {
    /// Wrap a message.
    pub fn new(message: M) -> Self {
        Self {
            message: Some(message),
        }
    }

    /// Create an envelope carrying no message.
    pub fn empty() -> Self {
        Self { message: None }
    }

    /// Whether this envelope carries no message.
    pub fn is_empty(&self) -> bool {
        self.message.is_none()
    }

    /// Borrow the message, if any.
    pub fn message(&self) -> Option<&M> {
        self.message.as_ref()
    }

    /// Consume the envelope and return the message it carries.
    ///
    /// Fails on an empty envelope.
    pub fn into_message(self) -> Result<M, EnvelopeError> {
        self.message.ok_or_else(EnvelopeError::empty)
    }
}

/// Error type for `Envelope` operations.
#[derive(Debug)]
pub struct EnvelopeError {
    kind: EnvelopeErrorKind,
}

#[derive(Debug)]
enum EnvelopeErrorKind {
    Empty,
}

impl EnvelopeError {
    fn empty() -> Self {
        Self {
            kind: EnvelopeErrorKind::Empty,
        }
    }
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            EnvelopeErrorKind::Empty => write!(f, "Cannot take a message out of an empty envelope"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_message_is_not_empty() {
        let envelope = Envelope::new("hello");

        assert!(!envelope.is_empty());
        assert_eq!(envelope.message(), Some(&"hello"));
        assert_eq!(envelope.into_message().unwrap(), "hello");
    }

    #[test]
    fn empty_envelope_cannot_be_unwrapped() {
        let envelope = Envelope::<String>::empty();

        assert!(envelope.is_empty());
        assert!(envelope.message().is_none());
        assert!(envelope.into_message().is_err());
    }
}
