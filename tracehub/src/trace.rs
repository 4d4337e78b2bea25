//! Trace trees: ordered trees of spans sharing one trace id.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{unmarshal_event, TimespanEvent};
use crate::span::{Id, Span, SpanId};

/// A tree of spans. The tree is ordered but not sorted; siblings stay in
/// the order they were attached.
///
/// Traversals use explicit stacks so traces thousands of spans deep cannot
/// overflow the call stack.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub span: Span,
    #[serde(default)]
    pub sub: Vec<Trace>,
}

impl Trace {
    /// Identity of the (possibly temporary) root span.
    pub fn id(&self) -> SpanId {
        self.span.id
    }

    /// Searches this tree for the span with the given span id.
    pub fn find_span(&self, span: Id) -> Option<&Trace> {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.span.id.span == span {
                return Some(node);
            }
            stack.extend(node.sub.iter().rev());
        }
        None
    }

    /// Number of spans in the tree.
    pub fn span_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.sub.iter());
        }
        count
    }

    /// The minimum start and maximum end over every timespan event in the
    /// tree, or `None` if no span carries one.
    pub fn timespan(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let mut acc: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if let Ok(event) = unmarshal_event::<TimespanEvent>(&node.span.annotations) {
                acc = Some(match acc {
                    None => (event.start, event.end),
                    Some((start, end)) => (start.min(event.start), end.max(event.end)),
                });
            }
            stack.extend(node.sub.iter());
        }
        acc
    }

    /// Renders the tree structure as an ASCII outline.
    pub fn tree_string(&self) -> String {
        const INDENT: &str = "    ";
        let mut out = String::new();
        let mut stack: Vec<(&Trace, usize)> = vec![(self, 0)];
        while let Some((node, depth)) = stack.pop() {
            let indent = INDENT.repeat(depth);
            if depth == 0 {
                let _ = writeln!(out, "+ Trace {:x}", node.span.id.trace.0);
            } else {
                if depth == 1 {
                    out.push('|');
                } else {
                    out.push('|');
                    out.push_str(&indent[INDENT.len()..]);
                }
                let _ = write!(out, "{}+ Span {:x}", "-".repeat(INDENT.len()), node.span.id.span.0);
                if !node.span.id.parent.is_zero() {
                    let _ = write!(out, " (parent {:x})", node.span.id.parent.0);
                }
                out.push('\n');
            }
            for ann in &node.span.annotations {
                if depth == 0 {
                    out.push_str("| ");
                } else {
                    out.push('|');
                    out.push_str(&indent[1..]);
                    out.push_str(" | ");
                }
                let _ = writeln!(out, "{} = {}", ann.key, String::from_utf8_lossy(&ann.value));
            }
            stack.extend(node.sub.iter().rev().map(|sub| (sub, depth + 1)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::event::marshal_event;
    use crate::span::Annotation;

    fn span(trace: u64, id: u64, parent: u64) -> Span {
        Span::new(SpanId {
            trace: Id(trace),
            span: Id(id),
            parent: Id(parent),
        })
    }

    fn sample() -> Trace {
        Trace {
            span: span(1, 1, 0),
            sub: vec![
                Trace {
                    span: span(1, 2, 1),
                    sub: vec![Trace {
                        span: span(1, 4, 2),
                        sub: Vec::new(),
                    }],
                },
                Trace {
                    span: span(1, 3, 1),
                    sub: Vec::new(),
                },
            ],
        }
    }

    #[test]
    fn find_span() {
        let trace = sample();
        assert_eq!(trace.find_span(Id(1)).map(|t| t.span.id.span), Some(Id(1)));
        assert_eq!(trace.find_span(Id(4)).map(|t| t.span.id.parent), Some(Id(2)));
        assert!(trace.find_span(Id(9)).is_none());
    }

    #[test]
    fn span_count() {
        assert_eq!(sample().span_count(), 4);
    }

    #[test]
    fn tree_string_outline() {
        let mut trace = sample();
        trace.span.annotations.push(Annotation::new("Name", "root"));
        let rendered = trace.tree_string();
        let want = "\
+ Trace 1
| Name = root
|----+ Span 2 (parent 1)
|    ----+ Span 4 (parent 2)
|----+ Span 3 (parent 1)
";
        assert_eq!(rendered, want);
    }

    #[test]
    fn deep_trace_does_not_overflow() {
        let mut trace = Trace {
            span: span(1, 1, 0),
            sub: Vec::new(),
        };
        for i in 2..5_000u64 {
            trace = Trace {
                span: span(1, i, i - 1),
                sub: vec![trace],
            };
        }
        assert_eq!(trace.span_count(), 4_999);
        assert!(trace.find_span(Id(1)).is_some());
        assert!(!trace.tree_string().is_empty());
    }

    #[test]
    fn timespan_folds_min_start_max_end() {
        let start = Utc.timestamp_opt(100, 0).unwrap();
        let end = Utc.timestamp_opt(200, 0).unwrap();
        let mut trace = sample();
        trace.span.annotations.extend(
            marshal_event(&TimespanEvent {
                start: Utc.timestamp_opt(120, 0).unwrap(),
                end,
            })
            .unwrap(),
        );
        trace.sub[0].span.annotations.extend(
            marshal_event(&TimespanEvent {
                start,
                end: Utc.timestamp_opt(150, 0).unwrap(),
            })
            .unwrap(),
        );
        assert_eq!(trace.timespan(), Some((start, end)));

        let bare = sample();
        assert_eq!(bare.timespan(), None);
    }
}
