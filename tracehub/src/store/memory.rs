//! In-memory trace storage with out-of-order tree reassembly.

use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::collector::Collector;
use crate::error::{CollectError, StoreError};
use crate::span::{Annotations, Id, Span, SpanId};
use crate::store::{DeleteStore, Queryer, Store, TracesOpts};
use crate::trace::Trace;

/// An in-memory [`Store`], [`Queryer`], and [`DeleteStore`].
///
/// Spans of a trace may be collected in any order: root before children,
/// children before root, or interleaved with children of spans that have
/// not arrived yet. The store keeps every trace as a tree rooted at the
/// real root once it is known, and at a *temporary* root before then; a
/// span whose parent has not arrived hangs off the root as a temporary
/// child until the parent shows up. Lookups observe whatever placement the
/// arrivals so far allow; an incomplete trace is a working state, not an
/// error.
///
/// The whole store can be snapshotted to a writer and restored, see
/// [`MemoryStore::write`] and [`MemoryStore::read_from`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inner {
    traces: HashMap<Id, TraceEntry>,
}

/// Reassembly state for one trace.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TraceEntry {
    /// Span id of the current root or temporary root.
    root: Id,
    /// Every collected span of the trace, indexed by span id.
    #[serde(default)]
    spans: HashMap<Id, Node>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    span: Span,
    /// Child span ids in attachment order.
    #[serde(default)]
    sub: Vec<Id>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serializes the store's internal state. The format is self-describing
    /// JSON; unknown fields are tolerated on the way back in, so snapshots
    /// survive forward-compatible additions.
    pub fn write<W: io::Write>(&self, writer: W) -> Result<(), StoreError> {
        let inner = self.lock();
        serde_json::to_writer(writer, &*inner)?;
        Ok(())
    }

    /// Replaces the store's state from a snapshot, returning the number of
    /// traces restored.
    pub fn read_from<R: io::Read>(&self, reader: R) -> Result<usize, StoreError> {
        let restored: Inner = serde_json::from_reader(reader)?;
        let mut inner = self.lock();
        *inner = restored;
        Ok(inner.traces.len())
    }

    /// Removes one span from a trace tree. With `delete_children` the
    /// span's whole subtree goes with it; otherwise surviving children are
    /// re-attached to the trace's root as temporary children. Returns
    /// whether the span existed.
    pub(crate) fn delete_sub(&self, id: SpanId, delete_children: bool) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.traces.get_mut(&id.trace) else {
            return false;
        };
        let Some(node) = entry.spans.remove(&id.span) else {
            return false;
        };
        for other in entry.spans.values_mut() {
            other.sub.retain(|child| *child != id.span);
        }

        let mut orphans = node.sub;
        if delete_children {
            let mut stack = std::mem::take(&mut orphans);
            while let Some(child) = stack.pop() {
                if let Some(removed) = entry.spans.remove(&child) {
                    stack.extend(removed.sub);
                }
            }
        }

        if entry.root == id.span {
            if entry.spans.is_empty() {
                inner.traces.remove(&id.trace);
                return true;
            }
            // The root went away with spans left behind: promote a
            // surviving child, or failing that any remaining span, to
            // temporary root.
            let new_root = orphans
                .iter()
                .copied()
                .find(|child| entry.spans.contains_key(child))
                .or_else(|| entry.spans.keys().next().copied());
            match new_root {
                Some(root) => entry.root = root,
                None => {
                    inner.traces.remove(&id.trace);
                    return true;
                }
            }
        }

        let root = entry.root;
        orphans.retain(|child| *child != root && entry.spans.contains_key(child));
        if let Some(root_node) = entry.spans.get_mut(&root) {
            root_node.sub.extend(orphans);
        }
        true
    }

    /// Overwrites the annotations of one already-collected span in place.
    /// Returns whether the span existed.
    pub(crate) fn set_span_annotations(&self, id: SpanId, anns: Annotations) -> bool {
        let mut inner = self.lock();
        let Some(node) = inner
            .traces
            .get_mut(&id.trace)
            .and_then(|entry| entry.spans.get_mut(&id.span))
        else {
            return false;
        };
        node.span.annotations = anns;
        true
    }
}

impl Collector for MemoryStore {
    fn collect(&self, id: SpanId, anns: Annotations) -> Result<(), CollectError> {
        let mut inner = self.lock();
        let entry = inner.traces.entry(id.trace).or_default();

        // A known span only accumulates annotations.
        if let Some(node) = entry.spans.get_mut(&id.span) {
            node.span.annotations.extend(anns);
            return Ok(());
        }
        entry.spans.insert(
            id.span,
            Node {
                span: Span { id, annotations: anns },
                sub: Vec::new(),
            },
        );

        // First span of the trace becomes the root, temporary or real.
        if entry.root.is_zero() {
            trace!(trace = %id.trace, root = %id.span, temp = !id.is_root(), "new trace root");
            entry.root = id.span;
            return Ok(());
        }

        let old_root = entry.root;
        let root_parent = entry
            .spans
            .get(&old_root)
            .map(|node| node.span.id.parent)
            .unwrap_or_default();

        if id.is_root() || root_parent == id.span {
            // The real root arrived, or the temp root's parent did: this
            // span takes over as root, the old root moves under it (or
            // under its own parent), and the old root's temporary children
            // come along.
            trace!(trace = %id.trace, new_root = %id.span, old_root = %old_root, "promoting root");
            entry.root = id.span;
            reattach_children(entry, id.span, old_root);
            insert(entry, id.span, old_root);
            let pending = take_temporary_children(entry, old_root);
            if let Some(root_node) = entry.spans.get_mut(&id.span) {
                root_node.sub.extend(pending);
            }
        } else {
            let root = entry.root;
            insert(entry, root, id.span);
        }

        // The new span may be the parent some temporary children of the
        // root have been waiting for.
        let root = entry.root;
        if id.span != root {
            reattach_children(entry, id.span, root);
        }
        Ok(())
    }
}

/// Places `target` under its parent if the parent has arrived, and as a
/// temporary child of the root otherwise.
fn insert(entry: &mut TraceEntry, root: Id, target: Id) {
    let parent = entry
        .spans
        .get(&target)
        .map(|node| node.span.id.parent)
        .unwrap_or_default();
    let under = if parent != target && entry.spans.contains_key(&parent) {
        parent
    } else {
        root
    };
    if under == target {
        return;
    }
    if let Some(node) = entry.spans.get_mut(&under) {
        node.sub.push(target);
    }
}

/// Moves the children of `src` whose declared parent is `dst` under `dst`.
fn reattach_children(entry: &mut TraceEntry, dst: Id, src: Id) {
    if dst == src {
        return;
    }
    let children = match entry.spans.get_mut(&src) {
        Some(node) => std::mem::take(&mut node.sub),
        None => return,
    };
    let mut kept = Vec::new();
    let mut moved = Vec::new();
    for child in children {
        let parent = entry
            .spans
            .get(&child)
            .map(|node| node.span.id.parent)
            .unwrap_or_default();
        if child != dst && parent == dst {
            moved.push(child);
        } else {
            kept.push(child);
        }
    }
    if let Some(node) = entry.spans.get_mut(&src) {
        node.sub = kept;
    }
    if let Some(node) = entry.spans.get_mut(&dst) {
        node.sub.extend(moved);
    }
}

/// Detaches and returns the children of `from` that are only temporary
/// (their declared parent is some other, not-yet-arrived span).
fn take_temporary_children(entry: &mut TraceEntry, from: Id) -> Vec<Id> {
    let children = match entry.spans.get_mut(&from) {
        Some(node) => std::mem::take(&mut node.sub),
        None => return Vec::new(),
    };
    let mut kept = Vec::new();
    let mut temporary = Vec::new();
    for child in children {
        let parent = entry
            .spans
            .get(&child)
            .map(|node| node.span.id.parent)
            .unwrap_or_default();
        if parent == from {
            kept.push(child);
        } else {
            temporary.push(child);
        }
    }
    if let Some(node) = entry.spans.get_mut(&from) {
        node.sub = kept;
    }
    temporary
}

/// Materializes the tree for one entry without recursing.
fn build_trace(entry: &TraceEntry) -> Option<Trace> {
    let root = entry.root;
    entry.spans.get(&root)?;

    let mut order = Vec::with_capacity(entry.spans.len());
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        order.push(id);
        if let Some(node) = entry.spans.get(&id) {
            stack.extend(node.sub.iter().copied());
        }
    }

    let mut built: HashMap<Id, Trace> = HashMap::with_capacity(order.len());
    for id in order.into_iter().rev() {
        let Some(node) = entry.spans.get(&id) else {
            continue;
        };
        let sub = node
            .sub
            .iter()
            .filter_map(|child| built.remove(child))
            .collect();
        built.insert(
            id,
            Trace {
                span: node.span.clone(),
                sub,
            },
        );
    }
    built.remove(&root)
}

impl Store for MemoryStore {
    fn trace(&self, id: Id) -> Result<Trace, StoreError> {
        let inner = self.lock();
        inner
            .traces
            .get(&id)
            .and_then(build_trace)
            .ok_or(StoreError::TraceNotFound)
    }
}

impl Queryer for MemoryStore {
    fn traces(&self, opts: &TracesOpts) -> Result<Vec<Trace>, StoreError> {
        let inner = self.lock();
        let mut out = Vec::new();
        for (id, entry) in &inner.traces {
            if !opts.trace_ids.is_empty() && !opts.trace_ids.contains(id) {
                continue;
            }
            let Some(trace) = build_trace(entry) else {
                continue;
            };
            if let Some((from, until)) = opts.timespan {
                match trace.timespan() {
                    Some((start, end)) if start <= until && end >= from => {}
                    _ => continue,
                }
            }
            out.push(trace);
        }
        Ok(out)
    }
}

impl DeleteStore for MemoryStore {
    fn delete(&self, ids: &[Id]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for id in ids {
            inner.traces.remove(id);
        }
        Ok(())
    }
}
