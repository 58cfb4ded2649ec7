//! Frame values and their serialization back to wire bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{
    FRAME_HEADER_SIZE, FrameHeader, FrameType, MAX_FRAME_PAYLOAD_LENGTH, encode_header,
};
use crate::reader::FrameSpan;
use crate::state::{HeaderField, MangleError, MangleErrorKind, StreamId};

/// A complete frame: header plus owned (reference-counted) payload.
///
/// The header's `length` is always derived from the payload, so the two
/// cannot disagree at serialization time. Frames lifted from a read buffer
/// keep their original wire bytes and serialize to exactly those bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    header:  FrameHeader,
    payload: Bytes,
    wire:    Option<Bytes>,
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.payload == other.payload
    }
}

impl Eq for Frame {}

impl Frame {
    /// Build a frame, deriving the length field from `payload`.
    ///
    /// Fails with `FieldOverflow` when the payload is longer than a 24-bit
    /// length can describe or the stream id does not fit in 31 bits.
    pub fn new(
        frame_type: FrameType,
        flags: u8,
        stream_id: StreamId,
        payload: Bytes,
    ) -> Result<Self, MangleError> {
        let length = u32::try_from(payload.len())
            .ok()
            .filter(|&len| len <= MAX_FRAME_PAYLOAD_LENGTH)
            .ok_or_else(|| {
                MangleError::with_stream(
                    MangleErrorKind::FieldOverflow {
                        field: HeaderField::Length,
                        value: payload.len() as u64,
                    },
                    stream_id,
                )
            })?;
        if stream_id.0 > StreamId::MAX {
            return Err(MangleError::new(MangleErrorKind::FieldOverflow {
                field: HeaderField::StreamId,
                value: u64::from(stream_id.0),
            }));
        }
        Ok(Self {
            header: FrameHeader::new(frame_type, flags, stream_id, length),
            payload,
            wire: None,
        })
    }

    /// Lift a span read from `buffer` into a frame sharing `buffer`'s memory.
    pub fn from_span(buffer: &Bytes, span: &FrameSpan) -> Self {
        Self {
            header:  span.header,
            payload: buffer.slice(span.payload_range()),
            wire:    Some(buffer.slice(span.frame_range())),
        }
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Size on the wire: header plus payload.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// True when this frame was lifted unchanged from a read buffer.
    pub fn is_passthrough(&self) -> bool {
        self.wire.is_some()
    }

    pub fn into_parts(self) -> (FrameHeader, Bytes) {
        (self.header, self.payload)
    }
}

/// Append one frame to `dst`.
pub fn write_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), MangleError> {
    if let Some(wire) = &frame.wire {
        dst.extend_from_slice(wire);
        return Ok(());
    }
    let header = encode_header(&frame.header)?;
    dst.reserve(frame.encoded_len());
    dst.put_slice(&header);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Concatenate the wire form of `frames`, in order.
pub fn serialize(frames: &[Frame]) -> Result<Bytes, MangleError> {
    let total = frames.iter().map(Frame::encoded_len).sum();
    let mut dst = BytesMut::with_capacity(total);
    for frame in frames {
        write_frame(frame, &mut dst)?;
    }
    Ok(dst.freeze())
}
