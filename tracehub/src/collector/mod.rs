//! Collectors accept span annotation submissions.
//!
//! A [`Collector`] is a sink for `(span id, annotations)` pairs. Collectors
//! compose by wrapping: a [`ChunkedCollector`] batches in front of a
//! [`RemoteCollector`], which frames packets to a [`CollectorServer`],
//! which forwards into a store-backed collector on the other side.

pub mod chunked;
pub mod remote;
pub mod server;
pub mod wire;

use std::sync::Arc;

pub use chunked::ChunkedCollector;
pub use remote::RemoteCollector;
pub use server::CollectorServer;

use crate::error::CollectError;
use crate::span::{Annotations, SpanId};
use crate::store::Store;

/// A sink accepting `(span id, annotations)` submissions.
///
/// Implementations must be safe for concurrent use and must not panic on
/// failure; errors are returned to the caller.
pub trait Collector: Send + Sync {
    fn collect(&self, id: SpanId, anns: Annotations) -> Result<(), CollectError>;
}

impl<C: Collector + ?Sized> Collector for Arc<C> {
    fn collect(&self, id: SpanId, anns: Annotations) -> Result<(), CollectError> {
        (**self).collect(id, anns)
    }
}

/// Forwards every submission directly into a [`Store`].
pub struct LocalCollector<S> {
    store: S,
}

impl<S: Store> LocalCollector<S> {
    pub fn new(store: S) -> LocalCollector<S> {
        LocalCollector { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: Store> Collector for LocalCollector<S> {
    fn collect(&self, id: SpanId, anns: Annotations) -> Result<(), CollectError> {
        self.store.collect(id, anns)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Test collector recording every submission.
    pub(crate) struct RecordingCollector {
        pub(crate) packets: Mutex<Vec<(SpanId, Annotations)>>,
    }

    impl RecordingCollector {
        pub(crate) fn new() -> RecordingCollector {
            RecordingCollector {
                packets: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn packets(&self) -> Vec<(SpanId, Annotations)> {
            self.packets.lock().unwrap().clone()
        }
    }

    impl Collector for RecordingCollector {
        fn collect(&self, id: SpanId, anns: Annotations) -> Result<(), CollectError> {
            self.packets.lock().unwrap().push((id, anns));
            Ok(())
        }
    }
}
