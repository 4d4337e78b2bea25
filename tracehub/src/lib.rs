//! An application-performance tracing system: record causally linked
//! operations ("spans") across distributed processes, transport them to a
//! central collector, store them in memory, and aggregate recurring
//! request patterns.
//!
//! The pieces compose as a pipeline:
//!
//! ```ascii
//!   user code
//!      |
//!   Recorder ── ChunkedCollector ── RemoteCollector ═══ CollectorServer
//!                                                             |
//!                           AggregateStore / RecentStore / LimitStore
//!                                                             |
//!                                                        MemoryStore
//! ```
//!
//! * [`span`] defines ids, span identities, and annotations.
//! * [`event`] and [`codec`] turn typed events into annotations and back.
//! * [`recorder`] records events on one span and submits them.
//! * [`collector`] buffers, frames, and transports submissions.
//! * [`store`] reassembles traces (in any arrival order) and layers
//!   eviction and aggregation on top.
//! * [`trace`] is the reassembled tree with search and rendering helpers.
//!
//! # Recording spans
//!
//! ```
//! use std::sync::Arc;
//! use tracehub::{MemoryStore, Recorder, SpanId, Store};
//!
//! let store = Arc::new(MemoryStore::new());
//! let span = Recorder::new(SpanId::new_root(), store.clone());
//! span.name("handle-request");
//! span.msg("cache miss");
//!
//! let child = span.child();
//! child.name("backend-query");
//!
//! let trace = store.trace(span.span_id().trace).unwrap();
//! assert_eq!(trace.span.name().as_deref(), Some("handle-request"));
//! assert_eq!(trace.sub.len(), 1);
//! ```

pub mod codec;
pub mod collector;
pub mod error;
pub mod event;
pub mod recorder;
pub mod span;
pub mod store;
pub mod trace;

pub use collector::{
    ChunkedCollector, Collector, CollectorServer, LocalCollector, RemoteCollector,
};
pub use error::{CollectError, EventError, ParseSpanIdError, StoreError};
pub use event::{Event, LogEvent, MsgEvent, SpanNameEvent, TimespanEvent};
pub use recorder::Recorder;
pub use span::{Annotation, Annotations, Id, Span, SpanId};
pub use store::{
    AggregateEvent, AggregateStore, DeleteStore, ErrorSink, LimitStore, MemoryStore, Queryer,
    RecentStore, Store, TracesOpts,
};
pub use trace::Trace;
