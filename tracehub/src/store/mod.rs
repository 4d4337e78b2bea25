//! Trace storage: the store traits, the in-memory store, and the eviction
//! and aggregation wrappers layered over it.

pub mod aggregate;
pub mod limit;
pub mod memory;
pub mod persist;
pub mod recent;

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub use aggregate::{AggregateEvent, AggregateStore};
pub use limit::LimitStore;
pub use memory::MemoryStore;
pub use persist::{persist_every, PersistentStore, Persister};
pub use recent::RecentStore;

use crate::collector::Collector;
use crate::error::StoreError;
use crate::span::Id;
use crate::trace::Trace;

/// Stores and retrieves spans.
///
/// A store is a [`Collector`] whose submissions become queryable; collecting
/// more annotations for a known span accumulates them in order.
pub trait Store: Collector {
    /// Returns the trace tree with trace id `id`, reassembled as far as the
    /// collected spans allow, or [`StoreError::TraceNotFound`].
    fn trace(&self, id: Id) -> Result<Trace, StoreError>;
}

impl<S: Store + ?Sized> Store for Arc<S> {
    fn trace(&self, id: Id) -> Result<Trace, StoreError> {
        (**self).trace(id)
    }
}

/// Constraints for [`Queryer::traces`].
#[derive(Clone, Debug, Default)]
pub struct TracesOpts {
    /// Only traces whose timespan overlaps this window. Traces carrying no
    /// timespan events have no position on the time axis and are excluded
    /// when the window is set.
    pub timespan: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Only these trace ids; empty means all.
    pub trace_ids: Vec<Id>,
}

/// Lists stored traces.
pub trait Queryer {
    fn traces(&self, opts: &TracesOpts) -> Result<Vec<Trace>, StoreError>;
}

impl<S: Queryer + ?Sized> Queryer for Arc<S> {
    fn traces(&self, opts: &TracesOpts) -> Result<Vec<Trace>, StoreError> {
        (**self).traces(opts)
    }
}

/// A store that can delete traces.
pub trait DeleteStore: Store {
    /// Removes the listed traces.
    fn delete(&self, ids: &[Id]) -> Result<(), StoreError>;
}

impl<S: DeleteStore + ?Sized> DeleteStore for Arc<S> {
    fn delete(&self, ids: &[Id]) -> Result<(), StoreError> {
        (**self).delete(ids)
    }
}

/// Receives errors from background deletions and sweeps, which run off the
/// caller's path and would otherwise be swallowed.
pub trait ErrorSink: Send + Sync {
    fn report(&self, err: StoreError);
}

/// The default [`ErrorSink`], reporting through the `tracing` machinery.
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&self, err: StoreError) {
        tracing::error!(error = %err, "background store operation failed");
    }
}
