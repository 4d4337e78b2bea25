//! Time-batched, per-span coalescing collector.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::debug;

use crate::collector::Collector;
use crate::error::CollectError;
use crate::span::{Annotations, SpanId};

/// Coalesces submissions in front of another collector.
///
/// Annotations submitted for the same span between two flushes are merged
/// into one packet, in submission order, and packets are forwarded in
/// first-submission order every `min_interval`. The background flusher
/// starts lazily on the first `collect`; [`ChunkedCollector::stop`] shuts
/// it down, after which `collect` fails with [`CollectError::Stopped`].
///
/// If `flush_timeout` is set and one flush exceeds it, the **entire**
/// pending queue is dropped, including packets the flush never reached,
/// and [`CollectError::QueueDropped`] is reported. Dropping everything
/// rather than re-queueing is the backpressure mechanism bounding memory
/// behind a sink that cannot keep up.
pub struct ChunkedCollector {
    inner: Arc<dyn Collector>,
    min_interval: Duration,
    flush_timeout: Option<Duration>,
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    queue: Vec<SpanId>,
    pending: HashMap<SpanId, Annotations>,
    started: bool,
    stopped: bool,
    stop_tx: Option<Sender<()>>,
    last_err: Option<CollectError>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChunkedCollector {
    /// Wraps `inner`, flushing every `min_interval`.
    pub fn new(inner: Arc<dyn Collector>, min_interval: Duration) -> ChunkedCollector {
        ChunkedCollector {
            inner,
            min_interval,
            flush_timeout: None,
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Bounds the duration of one flush; see the type docs for the drop
    /// semantics.
    pub fn with_flush_timeout(mut self, timeout: Duration) -> ChunkedCollector {
        self.flush_timeout = Some(timeout);
        self
    }

    /// Synchronously flushes everything pending.
    ///
    /// Exceeding the configured flush timeout drops the whole pending
    /// queue and returns [`CollectError::QueueDropped`].
    pub fn flush(&self) -> Result<(), CollectError> {
        flush_once(&self.shared, self.inner.as_ref(), self.flush_timeout)
    }

    /// Terminates the background flusher. Pending packets are discarded
    /// and subsequent `collect` calls fail.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        state.stopped = true;
        state.queue.clear();
        state.pending.clear();
        // Dropping the sender disconnects the flusher's channel.
        state.stop_tx.take();
    }

    fn start_flusher(&self, state: &mut State) {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        state.stop_tx = Some(stop_tx);
        state.started = true;

        let shared = Arc::clone(&self.shared);
        let inner = Arc::clone(&self.inner);
        let min_interval = self.min_interval;
        let flush_timeout = self.flush_timeout;
        let _ = thread::Builder::new()
            .name("tracehub-chunked-flusher".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(min_interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(err) = flush_once(&shared, inner.as_ref(), flush_timeout) {
                            debug!(error = %err, "background flush failed");
                            shared.lock().last_err = Some(err);
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            });
    }
}

impl Collector for ChunkedCollector {
    fn collect(&self, id: SpanId, anns: Annotations) -> Result<(), CollectError> {
        let mut state = self.shared.lock();
        if state.stopped {
            return Err(CollectError::Stopped);
        }
        if !state.started {
            self.start_flusher(&mut state);
        }

        match state.pending.get_mut(&id) {
            Some(pending) => pending.extend(anns),
            None => {
                state.pending.insert(id, anns);
                state.queue.push(id);
            }
        }

        // A failed background flush surfaces to the next caller, once.
        if let Some(err) = state.last_err.take() {
            return Err(err);
        }
        Ok(())
    }
}

/// Swaps out the pending queue under the lock, then feeds the inner
/// collector without holding it.
fn flush_once(
    shared: &Shared,
    inner: &dyn Collector,
    flush_timeout: Option<Duration>,
) -> Result<(), CollectError> {
    let (queue, mut pending) = {
        let mut state = shared.lock();
        (
            std::mem::take(&mut state.queue),
            std::mem::take(&mut state.pending),
        )
    };

    let started = Instant::now();
    let mut errs = Vec::new();
    for id in queue {
        if let Some(timeout) = flush_timeout {
            if started.elapsed() > timeout {
                return Err(CollectError::QueueDropped);
            }
        }
        let Some(anns) = pending.remove(&id) else {
            continue;
        };
        if let Err(err) = inner.collect(id, anns) {
            errs.push(err);
        }
    }

    match errs.len() {
        0 => Ok(()),
        1 => Err(errs.into_iter().next().unwrap_or(CollectError::QueueDropped)),
        _ => Err(CollectError::Multiple(errs)),
    }
}
