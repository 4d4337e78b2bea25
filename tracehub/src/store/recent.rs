//! Age-based eviction wrapper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;

use crate::collector::Collector;
use crate::error::{CollectError, StoreError};
use crate::span::{Annotations, Id, SpanId};
use crate::store::{DeleteStore, ErrorSink, LogSink, Queryer, Store, TracesOpts};
use crate::trace::Trace;

/// Deletes traces from the underlying store once they grow older than
/// `min_evict_age`.
///
/// Each trace's age is measured from the wall-clock time its first span was
/// collected. A sweep runs at most once per `min_evict_age`, triggered from
/// `collect`; the deletions themselves are dispatched to a background
/// thread so `collect` stays fast, and their failures go to the configured
/// [`ErrorSink`].
pub struct RecentStore<S> {
    min_evict_age: Duration,
    inner: Arc<S>,
    sink: Arc<dyn ErrorSink>,
    state: Mutex<RecentState>,
}

#[derive(Default)]
struct RecentState {
    created: HashMap<Id, SystemTime>,
    last_swept: Option<Instant>,
}

impl<S: DeleteStore + Send + Sync + 'static> RecentStore<S> {
    pub fn new(min_evict_age: Duration, inner: Arc<S>) -> RecentStore<S> {
        RecentStore {
            min_evict_age,
            inner,
            sink: Arc::new(LogSink),
            state: Mutex::new(RecentState::default()),
        }
    }

    /// Replaces the sink receiving background deletion errors.
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> RecentStore<S> {
        self.sink = sink;
        self
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    fn lock(&self) -> MutexGuard<'_, RecentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: DeleteStore + Send + Sync + 'static> Collector for RecentStore<S> {
    fn collect(&self, id: SpanId, anns: Annotations) -> Result<(), CollectError> {
        let to_evict = {
            let mut state = self.lock();
            state.created.entry(id.trace).or_insert_with(SystemTime::now);

            let due = state
                .last_swept
                .map_or(true, |last| last.elapsed() > self.min_evict_age);
            if due {
                state.last_swept = Some(Instant::now());
                let cutoff = SystemTime::now() - self.min_evict_age;
                let expired: Vec<Id> = state
                    .created
                    .iter()
                    .filter(|(_, created)| **created < cutoff)
                    .map(|(id, _)| *id)
                    .collect();
                for id in &expired {
                    state.created.remove(id);
                }
                expired
            } else {
                Vec::new()
            }
        };

        if !to_evict.is_empty() {
            debug!(count = to_evict.len(), "evicting traces past the age bound");
            let inner = Arc::clone(&self.inner);
            let sink = Arc::clone(&self.sink);
            thread::spawn(move || {
                if let Err(err) = inner.delete(&to_evict) {
                    sink.report(err);
                }
            });
        }

        self.inner.collect(id, anns)
    }
}

impl<S: DeleteStore + Send + Sync + 'static> Store for RecentStore<S> {
    fn trace(&self, id: Id) -> Result<Trace, StoreError> {
        self.inner.trace(id)
    }
}

impl<S: DeleteStore + Queryer + Send + Sync + 'static> Queryer for RecentStore<S> {
    fn traces(&self, opts: &TracesOpts) -> Result<Vec<Trace>, StoreError> {
        self.inner.traces(opts)
    }
}

impl<S: DeleteStore + Send + Sync + 'static> DeleteStore for RecentStore<S> {
    fn delete(&self, ids: &[Id]) -> Result<(), StoreError> {
        {
            let mut state = self.lock();
            for id in ids {
                state.created.remove(id);
            }
        }
        self.inner.delete(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn span_id(trace: u64, span: u64, parent: u64) -> SpanId {
        SpanId {
            trace: Id(trace),
            span: Id(span),
            parent: Id(parent),
        }
    }

    #[test]
    fn evicts_old_traces() {
        const AGE: Duration = Duration::from_millis(50);
        let memory = Arc::new(MemoryStore::new());
        let store = RecentStore::new(AGE, Arc::clone(&memory));

        store.collect(span_id(1, 2, 3), Annotations::new()).unwrap();
        store.collect(span_id(2, 3, 4), Annotations::new()).unwrap();
        assert_eq!(memory.traces(&TracesOpts::default()).unwrap().len(), 2);

        thread::sleep(AGE * 2);
        store.collect(span_id(3, 4, 5), Annotations::new()).unwrap();

        // The deletion runs off-thread; give it a moment to settle.
        thread::sleep(AGE * 2);
        let traces = memory.traces(&TracesOpts::default()).unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].id(), span_id(3, 4, 5));
    }

    #[test]
    fn eviction_failures_reach_the_sink() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct FailingDelete {
            memory: MemoryStore,
        }
        impl Collector for FailingDelete {
            fn collect(&self, id: SpanId, anns: Annotations) -> Result<(), CollectError> {
                self.memory.collect(id, anns)
            }
        }
        impl Store for FailingDelete {
            fn trace(&self, id: Id) -> Result<Trace, StoreError> {
                self.memory.trace(id)
            }
        }
        impl DeleteStore for FailingDelete {
            fn delete(&self, _ids: &[Id]) -> Result<(), StoreError> {
                Err(StoreError::TraceNotFound)
            }
        }

        struct CountingSink(AtomicUsize);
        impl ErrorSink for CountingSink {
            fn report(&self, _err: StoreError) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        const AGE: Duration = Duration::from_millis(20);
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let store = RecentStore::new(
            AGE,
            Arc::new(FailingDelete {
                memory: MemoryStore::new(),
            }),
        )
        .with_error_sink(sink.clone());

        store.collect(span_id(1, 1, 0), Annotations::new()).unwrap();
        thread::sleep(AGE * 2);
        store.collect(span_id(2, 1, 0), Annotations::new()).unwrap();
        thread::sleep(AGE * 2);
        assert!(sink.0.load(Ordering::SeqCst) >= 1);
    }
}
