//! Typed events and their annotation form.
//!
//! An event is any serializable value with a stable schema tag. Marshaling
//! flattens the value into key/value annotations (see [`crate::codec`]) and
//! adds one `_schema:<tag>` marker; unmarshaling requires that marker to be
//! present, so a span's annotation set can carry several event types side
//! by side and each decodes independently.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::EventError;
use crate::span::{Annotation, Annotations, SCHEMA_PREFIX};

/// A record of the occurrence of something, serializable to and from a
/// span's annotations.
pub trait Event: Serialize + DeserializeOwned {
    /// Stable textual tag discriminating this event type.
    const SCHEMA: &'static str;
}

/// An event that can report the time at which it occurred.
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

/// An event spanning a period of time.
pub trait Timespanned {
    fn start(&self) -> DateTime<Utc>;
    fn end(&self) -> DateTime<Utc>;
}

/// Marshals `event` into annotations: its flattened fields plus the schema
/// marker.
pub fn marshal_event<E: Event>(event: &E) -> Result<Annotations, EventError> {
    let mut anns = codec::flatten(event)?;
    anns.push(Annotation::new(
        format!("{}{}", SCHEMA_PREFIX, E::SCHEMA),
        Vec::new(),
    ));
    Ok(anns)
}

/// Unmarshals an event of type `E` from `anns`.
///
/// Fails with [`EventError::SchemaNotFound`] unless the `_schema:` marker
/// for `E` is present.
pub fn unmarshal_event<E: Event>(anns: &Annotations) -> Result<E, EventError> {
    if !anns.has_schema(E::SCHEMA) {
        return Err(EventError::SchemaNotFound { schema: E::SCHEMA });
    }
    codec::unflatten(anns)
}

/// Sets a span's display name (annotation key `Name`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanNameEvent {
    #[serde(rename = "Name")]
    pub name: String,
}

impl Event for SpanNameEvent {
    const SCHEMA: &'static str = "name";
}

/// A human-readable message with no timestamp.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgEvent {
    #[serde(rename = "Msg")]
    pub msg: String,
}

impl Event for MsgEvent {
    const SCHEMA: &'static str = "msg";
}

/// Returns an event that contains only a human-readable message.
pub fn msg(text: impl Into<String>) -> MsgEvent {
    MsgEvent { msg: text.into() }
}

/// A human-readable message stamped with the time it was recorded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(rename = "Msg")]
    pub msg: String,
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,
}

impl Event for LogEvent {
    const SCHEMA: &'static str = "log";
}

impl Timestamped for LogEvent {
    fn timestamp(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Returns an event carrying `text` and the current time.
pub fn log(text: impl Into<String>) -> LogEvent {
    LogEvent {
        msg: text.into(),
        time: Utc::now(),
    }
}

/// The period of time covered by a span. The aggregation engine derives
/// trace durations from these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimespanEvent {
    #[serde(rename = "S")]
    pub start: DateTime<Utc>,
    #[serde(rename = "E")]
    pub end: DateTime<Utc>,
}

impl Event for TimespanEvent {
    const SCHEMA: &'static str = "timespan";
}

impl Timespanned for TimespanEvent {
    fn start(&self) -> DateTime<Utc> {
        self.start
    }

    fn end(&self) -> DateTime<Utc> {
        self.end
    }
}

/// Serde helper serializing a [`std::time::Duration`] as seconds as a
/// decimal number, the annotation convention for durations.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(de::Error::custom("duration seconds out of range"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
