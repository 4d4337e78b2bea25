//! Recording events on a span.

use std::sync::{Arc, Mutex, PoisonError};

use crate::collector::Collector;
use crate::error::CollectError;
use crate::event::{log, marshal_event, msg, Event, SpanNameEvent};
use crate::span::{Annotations, SpanId};

/// Records events on a single span and submits them to a collector.
///
/// Submission never blocks on I/O; buffering is the collector chain's
/// responsibility. Failed submissions accumulate and are drained with
/// [`Recorder::errors`]. Safe for concurrent use.
pub struct Recorder {
    id: SpanId,
    collector: Arc<dyn Collector>,
    errors: Mutex<Vec<CollectError>>,
}

impl Recorder {
    pub fn new(id: SpanId, collector: Arc<dyn Collector>) -> Recorder {
        Recorder {
            id,
            collector,
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Identity of the span this recorder is bound to.
    pub fn span_id(&self) -> SpanId {
        self.id
    }

    /// Returns a recorder for a new span that is a child of this one.
    ///
    /// The child shares the collector but accumulates its own errors.
    pub fn child(&self) -> Recorder {
        Recorder::new(self.id.new_child(), Arc::clone(&self.collector))
    }

    /// Marshals `event` into annotations and submits them for this span.
    pub fn event<E: Event>(&self, event: &E) {
        match marshal_event(event) {
            Ok(anns) => self.annotate(anns),
            Err(err) => self.stash(err.into()),
        }
    }

    /// Records a message event.
    pub fn msg(&self, text: impl Into<String>) {
        self.event(&msg(text));
    }

    /// Records a message event stamped with the current time.
    pub fn log(&self, text: impl Into<String>) {
        self.event(&log(text));
    }

    /// Sets the span's display name.
    pub fn name(&self, name: impl Into<String>) {
        self.event(&SpanNameEvent { name: name.into() });
    }

    /// Submits raw annotations for this span.
    pub fn annotate(&self, anns: Annotations) {
        if let Err(err) = self.collector.collect(self.id, anns) {
            self.stash(err);
        }
    }

    /// Returns and clears the errors accumulated from failed submissions.
    pub fn errors(&self) -> Vec<CollectError> {
        std::mem::take(&mut *self.errors.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn stash(&self, err: CollectError) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(err);
    }
}
