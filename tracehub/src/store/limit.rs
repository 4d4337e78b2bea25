//! FIFO-bounded store wrapper.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::collector::Collector;
use crate::error::{CollectError, StoreError};
use crate::span::{Annotations, Id, SpanId};
use crate::store::{DeleteStore, Queryer, Store, TracesOpts};
use crate::trace::Trace;

/// Bounds the number of distinct traces in the underlying store.
///
/// Admitting a new trace beyond `max` first deletes the oldest trace by
/// first-seen order. The policy is strict FIFO, not LRU: later activity on
/// an old trace does not refresh its position.
pub struct LimitStore<S> {
    max: usize,
    inner: S,
    state: Mutex<LimitState>,
}

#[derive(Default)]
struct LimitState {
    seen: HashSet<Id>,
    fifo: VecDeque<Id>,
}

impl<S: DeleteStore> LimitStore<S> {
    pub fn new(max: usize, inner: S) -> LimitStore<S> {
        LimitStore {
            max,
            inner,
            state: Mutex::new(LimitState::default()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn lock(&self) -> MutexGuard<'_, LimitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: DeleteStore> Collector for LimitStore<S> {
    fn collect(&self, id: SpanId, anns: Annotations) -> Result<(), CollectError> {
        let evicted = {
            let mut state = self.lock();
            if state.seen.insert(id.trace) {
                state.fifo.push_back(id.trace);
                if state.fifo.len() > self.max {
                    state.fifo.pop_front().map(|oldest| {
                        state.seen.remove(&oldest);
                        oldest
                    })
                } else {
                    None
                }
            } else {
                None
            }
        };
        if let Some(oldest) = evicted {
            self.inner.delete(&[oldest])?;
        }
        self.inner.collect(id, anns)
    }
}

impl<S: DeleteStore> Store for LimitStore<S> {
    fn trace(&self, id: Id) -> Result<Trace, StoreError> {
        self.inner.trace(id)
    }
}

impl<S: DeleteStore + Queryer> Queryer for LimitStore<S> {
    fn traces(&self, opts: &TracesOpts) -> Result<Vec<Trace>, StoreError> {
        self.inner.traces(opts)
    }
}

impl<S: DeleteStore> DeleteStore for LimitStore<S> {
    fn delete(&self, ids: &[Id]) -> Result<(), StoreError> {
        {
            let mut state = self.lock();
            for id in ids {
                state.seen.remove(id);
            }
            state.fifo.retain(|id| !ids.contains(id));
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
    fn evicts_oldest_first_seen() {
        let store = LimitStore::new(2, MemoryStore::new());

        assert!(store.inner().traces(&TracesOpts::default()).unwrap().is_empty());

        store.collect(span_id(1, 2, 3), Annotations::new()).unwrap();
        assert_eq!(store.inner().traces(&TracesOpts::default()).unwrap().len(), 1);

        store.collect(span_id(2, 3, 4), Annotations::new()).unwrap();
        assert_eq!(store.inner().traces(&TracesOpts::default()).unwrap().len(), 2);

        // A third trace displaces the first; more spans of a retained
        // trace do not count against the bound.
        store.collect(span_id(3, 4, 5), Annotations::new()).unwrap();
        store.collect(span_id(3, 5, 6), Annotations::new()).unwrap();

        let mut traces = store.inner().traces(&TracesOpts::default()).unwrap();
        traces.sort_by_key(|t| t.id().trace);
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].id(), span_id(2, 3, 4));
        assert_eq!(traces[1].id(), span_id(3, 5, 6));
        assert_eq!(traces[1].sub.len(), 1);
        assert!(matches!(
            store.trace(Id(1)),
            Err(StoreError::TraceNotFound)
        ));
    }

    #[test]
    fn bound_holds_for_many_traces() {
        const MAX: usize = 10;
        let store = LimitStore::new(MAX, MemoryStore::new());
        for trace in 1..=100u64 {
            store.collect(span_id(trace, 1, 0), Annotations::new()).unwrap();
        }
        let traces = store.inner().traces(&TracesOpts::default()).unwrap();
        assert_eq!(traces.len(), MAX);
        // The retained traces are the most recently first-seen.
        let mut ids: Vec<u64> = traces.iter().map(|t| t.id().trace.0).collect();
        ids.sort();
        assert_eq!(ids, (91..=100).collect::<Vec<u64>>());
    }

    #[test]
    fn explicit_delete_frees_capacity() {
        let store = LimitStore::new(2, MemoryStore::new());
        store.collect(span_id(1, 1, 0), Annotations::new()).unwrap();
        store.collect(span_id(2, 1, 0), Annotations::new()).unwrap();
        store.delete(&[Id(1)]).unwrap();
        store.collect(span_id(3, 1, 0), Annotations::new()).unwrap();

        let mut ids: Vec<u64> = store
            .inner()
            .traces(&TracesOpts::default())
            .unwrap()
            .iter()
            .map(|t| t.id().trace.0)
            .collect();
        ids.sort();
        assert_eq!(ids, vec![2, 3]);
    }
}
