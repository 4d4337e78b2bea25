//! Long-running summarization of traces grouped by root span name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collector::Collector;
use crate::error::{CollectError, StoreError};
use crate::event::{marshal_event, Event, TimespanEvent};
use crate::span::{Annotations, Id, SpanId};
use crate::store::{
    DeleteStore, ErrorSink, LimitStore, LogSink, MemoryStore, Queryer, Store, TracesOpts,
};
use crate::trace::Trace;

/// A synthetic event summarizing the traces sharing one root span name;
/// the only event type the aggregation engine produces.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateEvent {
    /// Root span name shared by every trace in the group.
    #[serde(rename = "Name")]
    pub name: String,
    /// Trace ids of the group's current slowest traces, slowest first.
    #[serde(rename = "Slowest", default)]
    pub slowest: Vec<Id>,
}

impl Event for AggregateEvent {
    const SCHEMA: &'static str = "aggregate";
}

/// Maintains, per distinct root span name, the timespans seen within the
/// retention window and the N slowest traces, whose full span trees are
/// preserved in the output store. Each group also owns one synthetic trace
/// in the output store: its root span carries the group's
/// [`AggregateEvent`] and one child span per recorded timespan.
///
/// Incoming spans stage in a FIFO-bounded buffer (`max_rate` traces) until
/// their trace proves slow enough to promote; everything else ages out of
/// staging without ever reaching the output store.
///
/// Group identity is the root span name alone. Two unrelated services
/// emitting the same root name will share a group.
pub struct AggregateStore {
    min_evict_age: Duration,
    max_rate: usize,
    n_slowest: usize,
    output: Arc<MemoryStore>,
    keep: Option<Arc<dyn Store>>,
    sink: Arc<dyn ErrorSink>,
    state: Mutex<AggState>,
}

struct AggState {
    groups: HashMap<String, SpanGroup>,
    /// Staging buffer, created lazily on the first collect.
    pre: Option<LimitStore<MemoryStore>>,
    last_evicted: Option<Instant>,
}

impl Default for AggregateStore {
    fn default() -> AggregateStore {
        AggregateStore::new()
    }
}

impl AggregateStore {
    /// A store with the default tuning: 72h retention, 4096 staged traces,
    /// 5 slowest per group, and a fresh in-memory output store.
    pub fn new() -> AggregateStore {
        AggregateStore {
            min_evict_age: Duration::from_secs(72 * 60 * 60),
            max_rate: 4096,
            n_slowest: 5,
            output: Arc::new(MemoryStore::new()),
            keep: None,
            sink: Arc::new(LogSink),
            state: Mutex::new(AggState {
                groups: HashMap::new(),
                pre: None,
                last_evicted: None,
            }),
        }
    }

    /// Age beyond which timespans, slowest slots, and empty groups are
    /// dropped.
    pub fn with_min_evict_age(mut self, age: Duration) -> AggregateStore {
        self.min_evict_age = age;
        self
    }

    /// Capacity of the staging buffer, in traces. Bounds peak memory
    /// during bursts.
    pub fn with_max_rate(mut self, max_rate: usize) -> AggregateStore {
        self.max_rate = max_rate;
        self
    }

    /// How many slowest traces each group retains in full.
    pub fn with_n_slowest(mut self, n: usize) -> AggregateStore {
        self.n_slowest = n;
        self
    }

    /// A store consulted before deleting a displaced or evicted trace from
    /// the output store: traces still present there are kept.
    pub fn with_keep(mut self, keep: Arc<dyn Store>) -> AggregateStore {
        self.keep = Some(keep);
        self
    }

    /// Replaces the sink receiving deletion errors.
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> AggregateStore {
        self.sink = sink;
        self
    }

    /// The output store holding the slowest traces and the synthetic
    /// aggregate traces.
    pub fn output(&self) -> &Arc<MemoryStore> {
        &self.output
    }

    fn lock(&self) -> MutexGuard<'_, AggState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deletes `trace` from the output store unless the keep store still
    /// holds it. Failures go to the error sink: removal is bookkeeping off
    /// the submission path, not part of its contract.
    fn remove_from_output(&self, trace: Id) {
        if let Some(keep) = &self.keep {
            match keep.trace(trace) {
                Ok(_) => return,
                Err(StoreError::TraceNotFound) => {}
                Err(err) => {
                    self.sink.report(err);
                    return;
                }
            }
        }
        if let Err(err) = self.output.delete(&[trace]) {
            self.sink.report(err);
        }
    }

    fn evict_groups(&self, state: &mut AggState, cutoff: DateTime<Utc>) {
        let mut forgotten = Vec::new();
        for (name, group) in state.groups.iter_mut() {
            let evicted = group.evict_before(cutoff);
            for span in evicted.timespan_spans {
                self.output.delete_sub(span, false);
            }
            for trace in evicted.slowest {
                self.remove_from_output(trace);
            }
            if group.is_empty() {
                self.remove_from_output(group.trace.trace);
                forgotten.push(name.clone());
            }
        }
        for name in &forgotten {
            state.groups.remove(name);
        }
        if !forgotten.is_empty() {
            debug!(count = forgotten.len(), "forgot empty aggregation groups");
        }
    }
}

impl Collector for AggregateStore {
    fn collect(&self, id: SpanId, anns: Annotations) -> Result<(), CollectError> {
        let mut state = self.lock();

        // Stage the submission; the bound makes bursts safe.
        let max_rate = self.max_rate;
        let pre = state
            .pre
            .get_or_insert_with(|| LimitStore::new(max_rate, MemoryStore::new()));
        pre.collect(id, anns)?;

        // Periodic eviction, triggered from the ingestion path.
        let due = state
            .last_evicted
            .map_or(true, |last| last.elapsed() > self.min_evict_age);
        if due {
            state.last_evicted = Some(Instant::now());
            let cutoff = Utc::now() - saturating_chrono(self.min_evict_age);
            self.evict_groups(&mut state, cutoff);
        }

        // Until the trace has a name and a timespan there is nothing to
        // aggregate; its spans simply wait in staging.
        let AggState { groups, pre, .. } = &mut *state;
        let Some(pre) = pre.as_ref() else {
            return Ok(());
        };
        let staged = match pre.trace(id.trace) {
            Ok(staged) => staged,
            Err(StoreError::TraceNotFound) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let Some(name) = staged.span.name() else {
            return Ok(());
        };
        let Some((start, end)) = staged.timespan() else {
            return Ok(());
        };

        let n_slowest = self.n_slowest;
        let group = groups
            .entry(name.clone())
            .or_insert_with(|| SpanGroup::new(name, n_slowest));

        // Account for this trace and record the timespan as a child span
        // of the group's synthetic trace.
        let timespan_span = Id::generate();
        let mut displaced = Vec::new();
        group.update(start, end, timespan_span, id.trace, &mut displaced);
        let timespan_id = SpanId {
            trace: group.trace.trace,
            span: timespan_span,
            parent: group.trace.span,
        };
        self.output
            .collect(timespan_id, marshal_event(&TimespanEvent { start, end })?)?;

        // Promote the current slowest traces out of staging in full.
        let slowest: Vec<Id> = group.slowest_ids();
        for trace in &slowest {
            match pre.trace(*trace) {
                Ok(staged) => {
                    copy_trace(&self.output, &staged)?;
                    pre.delete(&[*trace])?;
                }
                Err(StoreError::TraceNotFound) => {}
                Err(err) => return Err(err.into()),
            }
        }

        // Replace the group's synthetic aggregate event.
        let event = AggregateEvent {
            name: group.name.clone(),
            slowest,
        };
        let event_anns = marshal_event(&event)?;
        if !self.output.set_span_annotations(group.trace, event_anns.clone()) {
            self.output.collect(group.trace, event_anns)?;
        }

        for trace in displaced {
            self.remove_from_output(trace);
        }
        Ok(())
    }
}

impl Store for AggregateStore {
    fn trace(&self, id: Id) -> Result<Trace, StoreError> {
        // Aggregate lock first, then the output store's; never the other
        // way around.
        let _state = self.lock();
        self.output.trace(id)
    }
}

impl Queryer for AggregateStore {
    fn traces(&self, opts: &TracesOpts) -> Result<Vec<Trace>, StoreError> {
        let _state = self.lock();
        self.output.traces(opts)
    }
}

impl DeleteStore for AggregateStore {
    fn delete(&self, ids: &[Id]) -> Result<(), StoreError> {
        let _state = self.lock();
        self.output.delete(ids)
    }
}

/// Copies every span of `trace` into `output`.
fn copy_trace(output: &MemoryStore, trace: &Trace) -> Result<(), CollectError> {
    let mut stack = vec![trace];
    while let Some(node) = stack.pop() {
        output.collect(node.span.id, node.span.annotations.clone())?;
        stack.extend(node.sub.iter());
    }
    Ok(())
}

fn saturating_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000_000_000))
}

/// One of the slowest traces in a group.
#[derive(Clone, Copy, Debug)]
struct SlowestSlot {
    trace: Id,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl SlowestSlot {
    fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

fn slot_duration(slot: &Option<SlowestSlot>) -> chrono::Duration {
    slot.as_ref()
        .map(SlowestSlot::duration)
        .unwrap_or_else(chrono::Duration::zero)
}

struct Evicted {
    timespan_spans: Vec<SpanId>,
    slowest: Vec<Id>,
}

/// All the timings recorded for the root spans of one name, plus the
/// N-slowest traces of the group.
struct SpanGroup {
    /// Root span of the synthetic trace the group's aggregate event lives
    /// in.
    trace: SpanId,
    name: String,
    /// Timespans seen within the retention window, paired with the child
    /// span recording each in the synthetic trace.
    times: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    timespan_spans: Vec<Id>,
    /// Slowest traces, slowest first; `None` slots are unused capacity.
    slowest: Vec<Option<SlowestSlot>>,
}

impl SpanGroup {
    fn new(name: String, n_slowest: usize) -> SpanGroup {
        SpanGroup {
            trace: SpanId::new_root(),
            name,
            times: Vec::new(),
            timespan_spans: Vec::new(),
            slowest: vec![None; n_slowest],
        }
    }

    fn slowest_ids(&self) -> Vec<Id> {
        self.slowest.iter().flatten().map(|slot| slot.trace).collect()
    }

    /// Accounts for one more timespan of the group, stealing a slowest
    /// slot if the trace is at least as slow as the slot's occupant.
    /// Displaced occupants are appended to `displaced`. Returns whether
    /// the trace entered the slowest set.
    fn update(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timespan_span: Id,
        trace: Id,
        displaced: &mut Vec<Id>,
    ) -> bool {
        self.times.push((start, end));
        self.timespan_spans.push(timespan_span);

        if self.slowest.iter().flatten().any(|slot| slot.trace == trace) {
            return false;
        }

        // The list stays sorted slowest-first, so scanning from the
        // fastest slot backward finds the one to steal.
        let duration = end - start;
        for i in (0..self.slowest.len()).rev() {
            if duration < slot_duration(&self.slowest[i]) {
                continue;
            }
            if let Some(old) = self.slowest[i].take() {
                displaced.push(old.trace);
            }
            self.slowest[i] = Some(SlowestSlot { trace, start, end });
            self.slowest.sort_by(|a, b| slot_duration(b).cmp(&slot_duration(a)));
            return true;
        }
        false
    }

    /// Drops timespans and slowest slots that started before `cutoff`,
    /// returning what was dropped so the caller can clean the output
    /// store.
    fn evict_before(&mut self, cutoff: DateTime<Utc>) -> Evicted {
        let mut kept_times = Vec::with_capacity(self.times.len());
        let mut kept_spans = Vec::with_capacity(self.timespan_spans.len());
        let mut dead_spans = Vec::new();
        for ((start, end), span) in self.times.drain(..).zip(self.timespan_spans.drain(..)) {
            if start < cutoff {
                dead_spans.push(SpanId {
                    trace: self.trace.trace,
                    span,
                    parent: self.trace.span,
                });
            } else {
                kept_times.push((start, end));
                kept_spans.push(span);
            }
        }
        self.times = kept_times;
        self.timespan_spans = kept_spans;

        let mut dead_slowest = Vec::new();
        for slot in self.slowest.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.start < cutoff) {
                if let Some(old) = slot.take() {
                    dead_slowest.push(old.trace);
                }
            }
        }
        self.slowest.sort_by(|a, b| slot_duration(b).cmp(&slot_duration(a)));

        Evicted {
            timespan_spans: dead_spans,
            slowest: dead_slowest,
        }
    }

    fn is_empty(&self) -> bool {
        self.times.is_empty() && self.slowest.iter().all(Option::is_none)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::event::{unmarshal_event, SpanNameEvent};
    use crate::span::Annotation;

    const NAME: &str = "the-trace-name";

    fn minutes(m: i64) -> chrono::Duration {
        chrono::Duration::minutes(m)
    }

    /// Collects one complete trace of the given duration into `store`.
    fn emit_trace(store: &AggregateStore, minutes_long: i64) -> Id {
        let id = SpanId::new_root();
        let start = Utc.timestamp_opt(1_000_000, 0).unwrap();
        let end = start + minutes(minutes_long);

        let mut anns = marshal_event(&SpanNameEvent { name: NAME.into() }).unwrap();
        anns.extend(marshal_event(&TimespanEvent { start, end }).unwrap());
        anns.push(Annotation::new("peer", "test"));
        store.collect(id, anns).unwrap();
        id.trace
    }

    /// Every non-synthetic trace's duration, in minutes, sorted.
    fn output_durations(store: &AggregateStore) -> Vec<i64> {
        let mut durations: Vec<i64> = store
            .traces(&TracesOpts::default())
            .unwrap()
            .iter()
            .filter(|t| !t.span.annotations.has_schema(AggregateEvent::SCHEMA))
            .filter_map(|t| t.timespan())
            .map(|(start, end)| (end - start).num_minutes())
            .collect();
        durations.sort();
        durations
    }

    fn aggregate_traces(store: &AggregateStore) -> Vec<Trace> {
        store
            .traces(&TracesOpts::default())
            .unwrap()
            .into_iter()
            .filter(|t| t.span.annotations.has_schema(AggregateEvent::SCHEMA))
            .collect()
    }

    #[test]
    fn keeps_the_n_slowest() {
        let store = AggregateStore::new().with_n_slowest(5);
        for minutes_long in [2, 3, 5, 4, 1, 4, 2, 5, 3, 1] {
            emit_trace(&store, minutes_long);
        }

        assert_eq!(output_durations(&store), vec![3, 4, 4, 5, 5]);

        let aggregates = aggregate_traces(&store);
        assert_eq!(aggregates.len(), 1);
        let event = unmarshal_event::<AggregateEvent>(&aggregates[0].span.annotations).unwrap();
        assert_eq!(event.name, NAME);
        assert_eq!(event.slowest.len(), 5);
        // Ten timespans were recorded under the synthetic trace.
        assert_eq!(aggregates[0].sub.len(), 10);
    }

    #[test]
    fn displacement_deletes_the_fastest_retained_trace() {
        let store = AggregateStore::new().with_n_slowest(5);
        for minutes_long in [2, 3, 5, 4, 1, 4, 2, 5, 3, 1] {
            emit_trace(&store, minutes_long);
        }
        emit_trace(&store, 6);

        assert_eq!(output_durations(&store), vec![4, 4, 5, 5, 6]);
    }

    #[test]
    fn keep_store_vetoes_deletion() {
        let kept = Arc::new(MemoryStore::new());
        let store = AggregateStore::new()
            .with_n_slowest(1)
            .with_keep(kept.clone() as Arc<dyn Store>);

        let first = emit_trace(&store, 3);
        // Mirror the retained trace into the keep store.
        let staged = store.trace(first).unwrap();
        kept.collect(staged.span.id, staged.span.annotations.clone())
            .unwrap();

        emit_trace(&store, 9);

        // The displaced trace survives because the keep store holds it.
        assert_eq!(output_durations(&store), vec![3, 9]);
    }

    #[test]
    fn traces_without_name_or_timespan_do_not_aggregate() {
        let store = AggregateStore::new();

        // No name annotation.
        let id = SpanId::new_root();
        let start = Utc.timestamp_opt(1_000_000, 0).unwrap();
        store
            .collect(
                id,
                marshal_event(&TimespanEvent {
                    start,
                    end: start + minutes(1),
                })
                .unwrap(),
            )
            .unwrap();

        // No timespan event.
        let id = SpanId::new_root();
        store
            .collect(
                id,
                marshal_event(&SpanNameEvent { name: NAME.into() }).unwrap(),
            )
            .unwrap();

        assert!(store.traces(&TracesOpts::default()).unwrap().is_empty());
    }

    #[test]
    fn eviction_forgets_stale_groups() {
        let store = AggregateStore::new()
            .with_min_evict_age(Duration::from_millis(30))
            .with_n_slowest(2);

        emit_trace(&store, 5);
        assert_eq!(aggregate_traces(&store).len(), 1);
        assert_eq!(output_durations(&store), vec![5]);

        // The emitted timespans are far in the past, so once the eviction
        // interval elapses the next collect sweeps the group away.
        std::thread::sleep(Duration::from_millis(60));
        let id = SpanId::new_root();
        store
            .collect(id, vec![Annotation::new("k", "v")].into())
            .unwrap();

        assert!(aggregate_traces(&store).is_empty());
        assert!(output_durations(&store).is_empty());
    }

    #[test]
    fn group_update_orders_slowest_first() {
        let start = Utc.timestamp_opt(0, 0).unwrap();
        let mut group = SpanGroup::new(NAME.into(), 3);
        let mut displaced = Vec::new();

        for (trace, m) in [(1u64, 4), (2, 2), (3, 6), (4, 3)] {
            group.update(
                start,
                start + minutes(m),
                Id::generate(),
                Id(trace),
                &mut displaced,
            );
        }

        // 2 minutes was the fastest and fell out when 3 arrived.
        assert_eq!(displaced, vec![Id(2)]);
        assert_eq!(group.slowest_ids(), vec![Id(3), Id(1), Id(4)]);

        // A repeat of a trace already in the set changes nothing.
        let before = group.slowest_ids();
        assert!(!group.update(start, start + minutes(9), Id::generate(), Id(3), &mut displaced));
        assert_eq!(group.slowest_ids(), before);
    }
}
