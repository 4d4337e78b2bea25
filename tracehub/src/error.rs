//! Error types shared across the tracing pipeline.

use std::io;

use thiserror::Error;

/// Returned when a span id string does not have the form
/// `<trace>/<span>` or `<trace>/<span>/<parent>` with each part sixteen
/// lowercase hex digits.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("bad span ID")]
pub struct ParseSpanIdError;

/// Errors from marshaling events to annotations and back.
#[derive(Error, Debug)]
pub enum EventError {
    /// The annotation set carries no `_schema:<tag>` marker for the
    /// requested event type.
    #[error("event schema {schema:?} not found in annotations")]
    SchemaNotFound {
        /// Schema tag of the requested event type.
        schema: &'static str,
    },

    /// The event value could not be flattened into annotations.
    #[error("encoding event: {0}")]
    Encode(String),

    /// The annotations could not be rebuilt into the event value.
    #[error("decoding event: {0}")]
    Decode(String),
}

/// Errors from submitting annotations to a [`Collector`].
///
/// [`Collector`]: crate::collector::Collector
#[derive(Error, Debug)]
pub enum CollectError {
    /// A flush exceeded the configured timeout and the pending queue was
    /// dropped in its entirety.
    #[error("flush timed out, pending queue dropped")]
    QueueDropped,

    /// The collector was stopped and accepts no further submissions.
    #[error("collector stopped")]
    Stopped,

    /// An event could not be marshaled for submission.
    #[error(transparent)]
    Event(#[from] EventError),

    /// A transport-level failure that persisted through reconnection.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The backing store rejected the submission.
    #[error("store: {0}")]
    Store(Box<StoreError>),

    /// Several packets failed during one flush.
    #[error("{} collect errors during flush", .0.len())]
    Multiple(Vec<CollectError>),
}

impl From<StoreError> for CollectError {
    fn from(err: StoreError) -> Self {
        CollectError::Store(Box::new(err))
    }
}

/// Errors from trace storage and retrieval.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No trace with the requested id exists.
    #[error("trace not found")]
    TraceNotFound,

    #[error(transparent)]
    Io(#[from] io::Error),

    /// A persisted snapshot could not be encoded or decoded.
    #[error("snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// A wrapped collector failed while the store was delegating to it.
    #[error("collect: {0}")]
    Collect(Box<CollectError>),
}

impl From<CollectError> for StoreError {
    fn from(err: CollectError) -> Self {
        StoreError::Collect(Box::new(err))
    }
}
