//! Span identifiers and annotations, the primitive units of a trace.

use std::fmt;
use std::slice;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ParseSpanIdError;

/// Annotation key carrying a span's display name.
pub const NAME_KEY: &str = "Name";

/// Prefix of annotation keys that mark the presence of an event type.
pub const SCHEMA_PREFIX: &str = "_schema:";

/// Name of the HTTP header by which span ids are propagated between
/// processes. The value is the [`SpanId`] text form.
pub const SPAN_ID_HEADER: &str = "Span-ID";

/// An opaque identifier for a trace or a span.
///
/// Zero is reserved to mean "absent" (for example the parent of a root
/// span) and is never produced by [`Id::generate`]. The text form is
/// sixteen lowercase hex digits, fixed width.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub u64);

impl Id {
    /// Generates a new non-zero id from a cryptographically strong source.
    pub fn generate() -> Id {
        let mut rng = rand::thread_rng();
        loop {
            let v = rng.gen::<u64>();
            if v != 0 {
                return Id(v);
            }
        }
    }

    /// Whether this is the reserved "absent" id.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({:016x})", self.0)
    }
}

impl From<u64> for Id {
    fn from(v: u64) -> Id {
        Id(v)
    }
}

impl FromStr for Id {
    type Err = ParseSpanIdError;

    fn from_str(s: &str) -> Result<Id, ParseSpanIdError> {
        if s.len() != 16 || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(ParseSpanIdError);
        }
        u64::from_str_radix(s, 16).map(Id).map_err(|_| ParseSpanIdError)
    }
}

/// The identity of a span: the trace it belongs to, its own id, and the id
/// of its parent span (zero for a root span).
///
/// The text form is `<trace>/<span>` for roots and
/// `<trace>/<span>/<parent>` otherwise.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct SpanId {
    /// Id of the trace this span belongs to.
    pub trace: Id,
    /// Id of this span.
    pub span: Id,
    /// Id of the parent span; zero for a root span.
    pub parent: Id,
}

impl SpanId {
    /// Creates the identity of a new root span in a new trace.
    pub fn new_root() -> SpanId {
        SpanId {
            trace: Id::generate(),
            span: Id::generate(),
            parent: Id(0),
        }
    }

    /// Creates the identity of a new span that is a child of this one.
    pub fn new_child(&self) -> SpanId {
        SpanId {
            trace: self.trace,
            span: Id::generate(),
            parent: self.span,
        }
    }

    /// Whether this span is the root of its trace.
    pub fn is_root(&self) -> bool {
        self.parent.is_zero()
    }

    /// Substitutes the id's text form for the first `%s` in `pattern` and
    /// `text` for the second, e.g. to correlate SQL with the issuing span:
    /// `id.format("/* %s */ %s", "SELECT 1")`.
    pub fn format(&self, pattern: &str, text: &str) -> String {
        pattern
            .replacen("%s", &self.to_string(), 1)
            .replacen("%s", text, 1)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parent.is_zero() {
            write!(f, "{}/{}", self.trace, self.span)
        } else {
            write!(f, "{}/{}/{}", self.trace, self.span, self.parent)
        }
    }
}

impl FromStr for SpanId {
    type Err = ParseSpanIdError;

    fn from_str(s: &str) -> Result<SpanId, ParseSpanIdError> {
        let mut parts = s.split('/');
        let trace = parts.next().ok_or(ParseSpanIdError)?.parse()?;
        let span = parts.next().ok_or(ParseSpanIdError)?.parse()?;
        let parent = match parts.next() {
            Some(p) => p.parse()?,
            None => Id(0),
        };
        if parts.next().is_some() {
            return Err(ParseSpanIdError);
        }
        Ok(SpanId { trace, span, parent })
    }
}

/// A key/value pair attached to a span.
///
/// Keys are printable strings; values are opaque byte sequences. Duplicate
/// keys are allowed and preserved in arrival order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub key: String,
    pub value: Vec<u8>,
}

impl Annotation {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Annotation {
        Annotation {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// An ordered sequence of annotations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Annotations(Vec<Annotation>);

impl Annotations {
    pub fn new() -> Annotations {
        Annotations(Vec::new())
    }

    pub fn push(&mut self, ann: Annotation) {
        self.0.push(ann);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value of the first annotation with the given key.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|ann| ann.key == key)
            .map(|ann| ann.value.as_slice())
    }

    /// Schema tags of every event marker present, in arrival order.
    pub fn schemas(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter_map(|ann| ann.key.strip_prefix(SCHEMA_PREFIX))
            .collect()
    }

    /// Whether a marker for the given event schema is present.
    pub fn has_schema(&self, schema: &str) -> bool {
        self.0
            .iter()
            .any(|ann| ann.key.strip_prefix(SCHEMA_PREFIX) == Some(schema))
    }

    pub fn iter(&self) -> slice::Iter<'_, Annotation> {
        self.0.iter()
    }
}

impl From<Vec<Annotation>> for Annotations {
    fn from(anns: Vec<Annotation>) -> Annotations {
        Annotations(anns)
    }
}

impl FromIterator<Annotation> for Annotations {
    fn from_iter<I: IntoIterator<Item = Annotation>>(iter: I) -> Annotations {
        Annotations(iter.into_iter().collect())
    }
}

impl Extend<Annotation> for Annotations {
    fn extend<I: IntoIterator<Item = Annotation>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for Annotations {
    type Item = Annotation;
    type IntoIter = std::vec::IntoIter<Annotation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Annotations {
    type Item = &'a Annotation;
    type IntoIter = slice::Iter<'a, Annotation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// One timed, annotated operation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub id: SpanId,
    #[serde(default)]
    pub annotations: Annotations,
}

impl Span {
    pub fn new(id: SpanId) -> Span {
        Span {
            id,
            annotations: Annotations::new(),
        }
    }

    /// The span's display name: the value of the `Name` annotation, if any.
    pub fn name(&self) -> Option<String> {
        self.annotations
            .get(NAME_KEY)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }
}
