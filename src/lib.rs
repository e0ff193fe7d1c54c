#![doc = include_str!("../README.md")]

pub mod envelope;
mod processor;
pub mod source;

#[doc(inline)]
pub use envelope::{Envelope, EnvelopeError};

#[doc(inline)]
pub use source::{
    MessageSource, Publisher, SourceError, SourceErrorKind, Subscription, SubscriptionId,
};

#[cfg(feature = "http")]
#[doc(inline)]
pub use source::http::{HttpMessageSource, HttpMessageSourceBuilder};

#[doc(inline)]
pub use processor::{
    DefaultProcessorHook, ProcessMessage, Processor, ProcessorHook, ProcessorRunError,
    ProcessorRunErrorKind,
};
