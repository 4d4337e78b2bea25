//! Wire format between [`RemoteCollector`] and [`CollectorServer`].
//!
//! The stream is a sequence of self-delimited frames, each a protobuf
//! message prefixed with its varint byte length (protobuf's standard
//! length-delimited framing): `<varint len><message bytes>`. No enclosing
//! structure exists, so a reader can recover frames from any byte stream
//! without out-of-band hints.
//!
//! [`RemoteCollector`]: crate::collector::RemoteCollector
//! [`CollectorServer`]: crate::collector::CollectorServer

use std::io::{self, Write};

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::span::{Annotation, Annotations, Id, SpanId};

/// Frames larger than this are treated as stream corruption.
const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

#[derive(Clone, PartialEq, Message)]
pub struct PacketSpanId {
    #[prost(fixed64, tag = "1")]
    pub trace: u64,
    #[prost(fixed64, tag = "2")]
    pub span: u64,
    /// Zero for a root span.
    #[prost(fixed64, tag = "3")]
    pub parent: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct PacketAnnotation {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// One collect submission: a span id and its ordered annotations.
#[derive(Clone, PartialEq, Message)]
pub struct CollectPacket {
    #[prost(message, optional, tag = "1")]
    pub span_id: Option<PacketSpanId>,
    #[prost(message, repeated, tag = "2")]
    pub annotations: Vec<PacketAnnotation>,
}

impl CollectPacket {
    pub fn new(id: SpanId, anns: Annotations) -> CollectPacket {
        CollectPacket {
            span_id: Some(PacketSpanId {
                trace: id.trace.0,
                span: id.span.0,
                parent: id.parent.0,
            }),
            annotations: anns
                .into_iter()
                .map(|ann| PacketAnnotation {
                    key: ann.key,
                    value: ann.value,
                })
                .collect(),
        }
    }

    /// Splits the packet back into its parts. A missing span id is a
    /// protocol violation.
    pub fn into_parts(self) -> io::Result<(SpanId, Annotations)> {
        let span_id = self.span_id.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "collect packet without span id")
        })?;
        let id = SpanId {
            trace: Id(span_id.trace),
            span: Id(span_id.span),
            parent: Id(span_id.parent),
        };
        let anns = self
            .annotations
            .into_iter()
            .map(|ann| Annotation::new(ann.key, ann.value))
            .collect();
        Ok((id, anns))
    }
}

/// Writes one length-delimited packet.
pub fn write_packet<W: Write>(writer: &mut W, packet: &CollectPacket) -> io::Result<()> {
    let frame = packet.encode_length_delimited_to_vec();
    writer.write_all(&frame)
}

/// Reads one length-delimited packet. Returns `Ok(None)` on a clean EOF at
/// a frame boundary; EOF inside a frame is an error.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<CollectPacket>> {
    let mut len: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof && shift == 0 && len == 0 => {
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        len |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame length varint overflow",
            ));
        }
    }

    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut frame = vec![0u8; len as usize];
    reader.read_exact(&mut frame).await?;
    CollectPacket::decode(frame.as_slice())
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Annotation;

    fn packet(trace: u64) -> CollectPacket {
        CollectPacket::new(
            SpanId {
                trace: Id(trace),
                span: Id(trace + 1),
                parent: Id(trace + 2),
            },
            vec![
                Annotation::new("k1", "v1"),
                Annotation::new("k2", vec![0u8, 1, 255]),
            ]
            .into(),
        )
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let mut buf = Vec::new();
        write_packet(&mut buf, &packet(1)).unwrap();
        write_packet(&mut buf, &packet(2)).unwrap();

        let mut reader = buf.as_slice();
        let first = read_packet(&mut reader).await.unwrap().unwrap();
        assert_eq!(first, packet(1));
        let second = read_packet(&mut reader).await.unwrap().unwrap();
        let (id, anns) = second.into_parts().unwrap();
        assert_eq!(id.trace, Id(2));
        assert_eq!(anns.get("k2"), Some(&[0u8, 1, 255][..]));
        assert!(read_packet(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_frame_is_an_error() {
        let mut buf = Vec::new();
        write_packet(&mut buf, &packet(1)).unwrap();
        buf.truncate(buf.len() - 1);

        let mut reader = buf.as_slice();
        assert!(read_packet(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        // Varint announcing far more data than the limit.
        let buf = [0xff, 0xff, 0xff, 0xff, 0x7f];
        let mut reader = &buf[..];
        let err = read_packet(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn missing_span_id_is_a_protocol_violation() {
        let packet = CollectPacket {
            span_id: None,
            annotations: Vec::new(),
        };
        assert!(packet.into_parts().is_err());
    }
}
