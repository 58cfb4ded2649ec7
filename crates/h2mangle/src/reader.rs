//! Lazy frame stream reader.
//!
//! Walks a contiguous buffer of back-to-back frames and yields the header of
//! each frame together with the offsets of its payload. Payload bytes are
//! never copied; callers borrow or `Bytes::slice` them from the buffer they
//! passed in.

use std::ops::Range;

use crate::frame::{FRAME_HEADER_SIZE, FrameHeader, decode_header};
use crate::state::{MangleError, MangleErrorKind};

/// Bounds-checked read position within a buffer of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pos: usize,
    len: usize,
}

impl Cursor {
    pub fn new(len: usize) -> Self {
        Self { pos: 0, len }
    }

    /// Current offset from the start of the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes between the cursor and the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.len - self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos == self.len
    }

    /// Move forward by `n` bytes and return the range stepped over.
    ///
    /// Returns `None` and leaves the cursor untouched when fewer than `n`
    /// bytes remain.
    pub fn advance(&mut self, n: usize) -> Option<Range<usize>> {
        if n > self.remaining() {
            return None;
        }
        let start = self.pos;
        self.pos += n;
        Some(start..self.pos)
    }
}

/// Location of one frame within the buffer it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpan {
    pub header:         FrameHeader,
    /// Offset of the first header byte
    pub offset:         usize,
    /// Offset of the first payload byte
    pub payload_offset: usize,
    pub payload_len:    usize,
}

impl FrameSpan {
    /// Range of the whole frame (header and payload).
    pub fn frame_range(&self) -> Range<usize> {
        self.offset..self.payload_offset + self.payload_len
    }

    pub fn payload_range(&self) -> Range<usize> {
        self.payload_offset..self.payload_offset + self.payload_len
    }

    /// Borrow the payload from the buffer this span was read from.
    pub fn payload<'a>(&self, buffer: &'a [u8]) -> &'a [u8] {
        &buffer[self.payload_range()]
    }
}

/// How a [`FrameReader`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    /// The last frame ended exactly at the end of the buffer
    Clean,
    /// A partial frame header trails the last complete frame; `needed` more
    /// bytes complete the header
    Incomplete { offset: usize, needed: usize },
    /// A header declared more payload than the buffer holds
    Truncated { offset: usize, needed: usize },
}

impl ReadEnd {
    /// Offset of the first byte that was not consumed as a complete frame.
    pub fn consumed(&self, buffer_len: usize) -> usize {
        match *self {
            Self::Clean => buffer_len,
            Self::Incomplete { offset, .. } | Self::Truncated { offset, .. } => offset,
        }
    }
}

/// Iterator over the frames of a buffer.
///
/// Finite and not restartable: once it returns `None` (or an error) it stays
/// exhausted, and [`FrameReader::end`] reports why it stopped.
pub struct FrameReader<'a> {
    buffer: &'a [u8],
    cursor: Cursor,
    end:    Option<ReadEnd>,
}

/// Read the frames of `buffer` lazily, in wire order.
pub fn parse_all(buffer: &[u8]) -> FrameReader<'_> {
    FrameReader {
        buffer,
        cursor: Cursor::new(buffer.len()),
        end: None,
    }
}

impl<'a> FrameReader<'a> {
    /// Why the reader stopped, or `None` while frames may still follow.
    pub fn end(&self) -> Option<ReadEnd> {
        self.end
    }

    /// Offset of the next unread byte.
    pub fn position(&self) -> usize {
        self.cursor.position()
    }

    pub fn buffer(&self) -> &'a [u8] {
        self.buffer
    }
}

impl Iterator for FrameReader<'_> {
    type Item = Result<FrameSpan, MangleError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.end.is_some() {
            return None;
        }

        let offset = self.cursor.position();
        if self.cursor.remaining() < FRAME_HEADER_SIZE {
            self.end = Some(if self.cursor.is_at_end() {
                ReadEnd::Clean
            } else {
                ReadEnd::Incomplete {
                    offset,
                    needed: FRAME_HEADER_SIZE - self.cursor.remaining(),
                }
            });
            return None;
        }

        let header = match decode_header(&self.buffer[offset..]) {
            Ok(h) => h,
            Err(e) => {
                self.end = Some(ReadEnd::Incomplete {
                    offset,
                    needed: FRAME_HEADER_SIZE,
                });
                return Some(Err(e));
            },
        };
        let payload_len = header.length as usize;
        let available = self.cursor.remaining() - FRAME_HEADER_SIZE;

        if payload_len > available {
            // Leave the cursor on the header so the caller can resume here
            self.end = Some(ReadEnd::Truncated {
                offset,
                needed: payload_len - available,
            });
            crate::trace_debug!("truncated {header} at offset {offset}: {available} bytes present");
            return Some(Err(MangleError::with_stream(
                MangleErrorKind::TruncatedPayload {
                    declared: payload_len,
                    available,
                },
                header.stream_id,
            )));
        }

        let frame = self.cursor.advance(FRAME_HEADER_SIZE + payload_len)?;
        Some(Ok(FrameSpan {
            header,
            offset: frame.start,
            payload_offset: frame.start + FRAME_HEADER_SIZE,
            payload_len,
        }))
    }
}

impl std::iter::FusedIterator for FrameReader<'_> {}
