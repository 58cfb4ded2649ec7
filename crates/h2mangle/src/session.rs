//! Boundary between the mutation core and the protocol engine driving a
//! connection.
//!
//! The engine (a [`SessionDriver`], or an I/O adapter wrapping a real HTTP/2
//! implementation) produces valid wire bytes. A [`ConnectionContext`] sits
//! between that engine and the transport: outbound bytes are re-framed and
//! mutated, inbound bytes are observed and turned into [`ProtocolEvent`]s.

use bytes::{Bytes, BytesMut};

use crate::frame::{
    CONNECTION_PREFACE, DEFAULT_MAX_FRAME_SIZE, FLAG_ACK, FLAG_END_STREAM, FrameHeader, FrameType,
    MAX_FRAME_PAYLOAD_LENGTH,
};
use crate::mutate::{MutationRecord, MutationRule, RuleState, apply, apply_lenient};
use crate::reader::{FrameSpan, parse_all};
use crate::serialize::write_frame;
use crate::state::{ErrorCode, MangleError, MangleErrorKind, MangleLimits, StreamId};

/// Settings carried by a non-ACK SETTINGS frame; unset entries were absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SettingsUpdate {
    pub header_table_size:      Option<u32>,
    pub enable_push:            Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size:    Option<u32>,
    pub max_frame_size:         Option<u32>,
    pub max_header_list_size:   Option<u32>,
}

impl SettingsUpdate {
    /// Parse a SETTINGS payload (6 bytes per entry: 2-byte id, 4-byte value).
    /// A trailing partial entry is ignored.
    pub fn parse(payload: &[u8]) -> Self {
        let mut update = Self::default();
        for entry in payload.chunks_exact(6) {
            let setting_id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);

            match setting_id {
                0x01 => update.header_table_size = Some(value),
                0x02 => update.enable_push = Some(value != 0),
                0x03 => update.max_concurrent_streams = Some(value),
                0x04 => update.initial_window_size = Some(value),
                0x05 => update.max_frame_size = Some(value),
                0x06 => update.max_header_list_size = Some(value),
                _ => {}, // Unknown setting
            }
        }
        update
    }
}

/// Protocol-level happenings observed on a connection.
///
/// Closed set: consumers are expected to match exhaustively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// A HEADERS frame arrived
    HeadersReceived { stream_id: StreamId, end_stream: bool },
    /// A DATA frame arrived; `length` is the flow-controlled length
    DataReceived { stream_id: StreamId, length: usize },
    /// The peer half-closed a stream (END_STREAM)
    StreamEnded { stream_id: StreamId },
    /// The peer advertised new settings
    RemoteSettingsChanged(SettingsUpdate),
    /// The peer acknowledged our SETTINGS
    SettingsAcknowledged,
    /// The peer reset a stream
    StreamReset {
        stream_id:  StreamId,
        error_code: ErrorCode,
    },
    /// The peer sent GOAWAY
    ConnectionTerminated {
        error_code:      ErrorCode,
        last_stream_id:  StreamId,
        additional_data: Bytes,
    },
}

impl ProtocolEvent {
    /// True when the event ends the connection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ConnectionTerminated { .. })
    }
}

impl std::fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HeadersReceived {
                stream_id,
                end_stream,
            } => write!(f, "headers on stream {stream_id} (end_stream={end_stream})"),
            Self::DataReceived { stream_id, length } => {
                write!(f, "{length} data bytes on stream {stream_id}")
            },
            Self::StreamEnded { stream_id } => write!(f, "stream {stream_id} ended"),
            Self::RemoteSettingsChanged(update) => write!(f, "remote settings {update:?}"),
            Self::SettingsAcknowledged => write!(f, "settings acknowledged"),
            Self::StreamReset {
                stream_id,
                error_code,
            } => write!(f, "stream {stream_id} reset with {error_code}"),
            Self::ConnectionTerminated {
                error_code,
                last_stream_id,
                additional_data,
            } => write!(
                f,
                "connection terminated with {error_code} (last stream {last_stream_id}, {} bytes of debug data)",
                additional_data.len()
            ),
        }
    }
}

/// How the peer reacted to a mutated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The peer rejected the frame with FRAME_SIZE_ERROR; `stream_id` is set
    /// for a stream-level reset, unset for GOAWAY
    Enforced { stream_id: Option<StreamId> },
    /// The peer failed the connection or stream with a different code
    RejectedOther { error_code: ErrorCode },
    /// The peer completed a stream without complaint
    Accepted,
    /// Nothing was mutated, or the peer gave no decisive reaction
    Inconclusive,
}

impl Verdict {
    /// Classify the peer's reaction from the events observed after at least
    /// `mutations` rewritten frames. The first error event decides.
    pub fn from_events<'a, I>(events: I, mutations: usize) -> Self
    where
        I: IntoIterator<Item = &'a ProtocolEvent>,
    {
        if mutations == 0 {
            return Self::Inconclusive;
        }

        let mut stream_completed = false;
        for event in events {
            match event {
                ProtocolEvent::ConnectionTerminated { error_code, .. } => {
                    if *error_code == ErrorCode::FRAME_SIZE_ERROR {
                        return Self::Enforced { stream_id: None };
                    }
                    if *error_code != ErrorCode::NO_ERROR {
                        return Self::RejectedOther {
                            error_code: *error_code,
                        };
                    }
                },
                ProtocolEvent::StreamReset {
                    stream_id,
                    error_code,
                } => {
                    if *error_code == ErrorCode::FRAME_SIZE_ERROR {
                        return Self::Enforced {
                            stream_id: Some(*stream_id),
                        };
                    }
                    return Self::RejectedOther {
                        error_code: *error_code,
                    };
                },
                ProtocolEvent::StreamEnded { .. } => stream_completed = true,
                ProtocolEvent::HeadersReceived { .. }
                | ProtocolEvent::DataReceived { .. }
                | ProtocolEvent::RemoteSettingsChanged(_)
                | ProtocolEvent::SettingsAcknowledged => {},
            }
        }

        if stream_completed {
            Self::Accepted
        } else {
            Self::Inconclusive
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enforced { stream_id: None } => {
                write!(f, "enforced: connection closed with FRAME_SIZE_ERROR")
            },
            Self::Enforced {
                stream_id: Some(id),
            } => write!(f, "enforced: stream {id} reset with FRAME_SIZE_ERROR"),
            Self::RejectedOther { error_code } => write!(f, "rejected with {error_code}"),
            Self::Accepted => write!(f, "accepted oversized frame"),
            Self::Inconclusive => write!(f, "inconclusive"),
        }
    }
}

/// The legitimate protocol engine whose output is intercepted.
///
/// Implementations are sans-io: they hand out bytes to send and accept bytes
/// received, and never touch a transport themselves.
pub trait SessionDriver {
    /// Bytes the engine wants sent next (valid HTTP/2).
    fn next_outbound_bytes(&mut self) -> Bytes;

    /// Feed bytes received from the peer into the engine.
    fn consume_inbound_bytes(&mut self, data: Bytes) -> Vec<ProtocolEvent>;

    /// The peer's SETTINGS_MAX_FRAME_SIZE as negotiated so far.
    fn negotiated_max_frame_size(&self) -> u32;
}

/// Apply `rule` once to a complete byte stream.
///
/// A leading client connection preface and any trailing partial frame are
/// passed through untouched. Oversize targets resolve against the default
/// SETTINGS_MAX_FRAME_SIZE (16384).
pub fn mutate(stream: Bytes, rule: &MutationRule) -> Result<Bytes, MangleError> {
    mutate_with_max_frame_size(stream, rule, DEFAULT_MAX_FRAME_SIZE)
}

/// [`mutate`] with an explicit peer max frame size.
pub fn mutate_with_max_frame_size(
    stream: Bytes,
    rule: &MutationRule,
    max_frame_size: u32,
) -> Result<Bytes, MangleError> {
    let mut state = RuleState::new();
    let mut out = BytesMut::with_capacity(stream.len());

    let start = if stream.starts_with(CONNECTION_PREFACE) {
        out.extend_from_slice(CONNECTION_PREFACE);
        state.base_offset = CONNECTION_PREFACE.len();
        CONNECTION_PREFACE.len()
    } else {
        0
    };

    let body = stream.slice(start..);
    let (spans, consumed) = complete_spans(&body)?;
    let frames = apply(&body, &spans, rule, &mut state, max_frame_size)?;
    for frame in &frames {
        write_frame(frame, &mut out)?;
    }
    if consumed < body.len() {
        crate::trace_warn!("passing {} trailing bytes through unparsed", body.len() - consumed);
        out.extend_from_slice(&body[consumed..]);
    }
    Ok(out.freeze())
}

/// Read the complete frames at the front of `buffer`.
///
/// Returns the spans and the number of bytes they cover. A trailing partial
/// header or a truncated payload ends the list without failing.
fn complete_spans(buffer: &[u8]) -> Result<(Vec<FrameSpan>, usize), MangleError> {
    let mut reader = parse_all(buffer);
    let mut spans = Vec::new();
    for item in reader.by_ref() {
        match item {
            Ok(span) => spans.push(span),
            Err(e) if matches!(e.kind, MangleErrorKind::TruncatedPayload { .. }) => break,
            Err(e) => return Err(e),
        }
    }
    let consumed = reader
        .end()
        .map_or(reader.position(), |end| end.consumed(buffer.len()));
    Ok((spans, consumed))
}

/// Progress through the optional 24-byte client connection preface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Preface {
    /// Not enough bytes seen yet to tell
    Undecided,
    /// The preface (if any) is behind us
    Done,
}

/// Incremental framing state for one direction of a connection.
#[derive(Debug)]
struct FrameChannel {
    /// Bytes of an incomplete frame awaiting the rest
    buffer:  BytesMut,
    preface: Preface,
    /// Bytes of this direction handed on so far
    offset:  usize,
}

impl FrameChannel {
    fn new() -> Self {
        Self {
            buffer:  BytesMut::new(),
            preface: Preface::Undecided,
            offset:  0,
        }
    }

    fn extend(&mut self, data: &[u8], limits: &MangleLimits) -> Result<(), MangleError> {
        if self.buffer.len() + data.len() > limits.max_buffer_size {
            return Err(MangleError::new(MangleErrorKind::BufferTooLarge {
                limit: limits.max_buffer_size,
            }));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Length of the connection preface at the front of the buffer, without
    /// consuming it.
    ///
    /// Returns `None` while undecided (only a strict prefix of the preface
    /// has arrived) and `Some(0)` once the direction is past any preface.
    fn preface_len(&mut self) -> Option<usize> {
        if self.preface == Preface::Done {
            return Some(0);
        }
        let n = self.buffer.len().min(CONNECTION_PREFACE.len());
        if self.buffer[..n] != CONNECTION_PREFACE[..n] {
            self.preface = Preface::Done;
            return Some(0);
        }
        if n < CONNECTION_PREFACE.len() {
            return None;
        }
        Some(CONNECTION_PREFACE.len())
    }

    /// Mark `taken` bytes, starting with a `preface_len`-byte preface, as
    /// handed on.
    fn commit(&mut self, preface_len: usize, taken: usize) {
        if preface_len > 0 {
            self.preface = Preface::Done;
        }
        self.offset += taken;
    }

    /// Put bytes split off the front of the buffer back in place.
    fn restore(&mut self, taken: &[u8]) {
        let mut restored = BytesMut::with_capacity(taken.len() + self.buffer.len());
        restored.extend_from_slice(taken);
        restored.extend_from_slice(&self.buffer);
        self.buffer = restored;
    }

    /// Split off the connection preface if the direction starts with one.
    ///
    /// `None` while undecided, the preface bytes once, an empty `Bytes` after.
    fn take_preface(&mut self) -> Option<Bytes> {
        let n = self.preface_len()?;
        self.commit(n, n);
        Some(self.buffer.split_to(n).freeze())
    }

    /// Take the complete frames out of the buffer, leaving any partial frame.
    fn take_frames(&mut self) -> Result<(Bytes, Vec<FrameSpan>), MangleError> {
        let (spans, consumed) = complete_spans(&self.buffer)?;
        let frames = self.buffer.split_to(consumed).freeze();
        self.offset += consumed;
        Ok((frames, spans))
    }
}

/// Per-connection state shared by every core operation on that connection.
///
/// Owns the rule, its progress, and the framing state of both directions.
/// Nothing in here outlives the connection.
#[derive(Debug)]
pub struct ConnectionContext {
    rule:                MutationRule,
    rule_state:          RuleState,
    limits:              MangleLimits,
    outbound:            FrameChannel,
    inbound:             FrameChannel,
    peer_max_frame_size: u32,
    terminated:          bool,
}

impl ConnectionContext {
    pub fn new(rule: MutationRule) -> Self {
        Self::with_limits(rule, MangleLimits::default())
    }

    pub fn with_limits(rule: MutationRule, limits: MangleLimits) -> Self {
        Self {
            rule,
            rule_state: RuleState::new(),
            peer_max_frame_size: limits.default_max_frame_size,
            limits,
            outbound: FrameChannel::new(),
            inbound: FrameChannel::new(),
            terminated: false,
        }
    }

    pub fn rule(&self) -> &MutationRule {
        &self.rule
    }

    /// The peer's SETTINGS_MAX_FRAME_SIZE as last seen (or the default).
    pub fn peer_max_frame_size(&self) -> u32 {
        self.peer_max_frame_size
    }

    pub fn set_peer_max_frame_size(&mut self, size: u32) {
        self.peer_max_frame_size = size;
    }

    /// Frames rewritten on this connection so far.
    pub fn mutations(&self) -> usize {
        self.rule_state.applied
    }

    /// Take the records of rewrites performed since the last call.
    pub fn drain_mutations(&mut self) -> Vec<MutationRecord> {
        self.rule_state.drain_records()
    }

    /// True once the peer sent GOAWAY (or the driver reported termination).
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Bytes held back in the outbound direction waiting for the rest of a
    /// frame.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.buffer.len()
    }

    /// Transform bytes on their way to the peer.
    ///
    /// Complete frames are run through the rule and returned serialized; a
    /// trailing partial frame is held until a later call completes it. The
    /// client connection preface passes through unchanged.
    pub fn outbound(&mut self, data: &[u8]) -> Result<Bytes, MangleError> {
        self.outbound.extend(data, &self.limits)?;

        let Some(preface_len) = self.outbound.preface_len() else {
            return Ok(Bytes::new());
        };
        let (spans, consumed) = complete_spans(&self.outbound.buffer[preface_len..])?;

        let taken = self.outbound.buffer.split_to(preface_len + consumed).freeze();
        let frames_buffer = taken.slice(preface_len..);
        self.rule_state.base_offset = self.outbound.offset + preface_len;
        let frames = match apply_lenient(
            &frames_buffer,
            &spans,
            &self.rule,
            &mut self.rule_state,
            self.peer_max_frame_size,
        ) {
            Ok(frames) => frames,
            Err(e) => {
                // Hand the batch back so the connection resumes where it was
                self.outbound.restore(&taken);
                return Err(e);
            },
        };
        self.outbound.commit(preface_len, taken.len());

        let mut out = BytesMut::with_capacity(taken.len());
        out.extend_from_slice(&taken[..preface_len]);
        for frame in &frames {
            write_frame(frame, &mut out)?;
        }
        Ok(out.freeze())
    }

    /// Swap the rule for the rest of the connection. Progress so far (frames
    /// seen, rewrites made) carries over.
    pub fn set_rule(&mut self, rule: MutationRule) {
        self.rule = rule;
    }

    /// Observe bytes received from the peer without altering them.
    ///
    /// Returns the events carried by the complete frames seen so far and
    /// tracks the peer's SETTINGS_MAX_FRAME_SIZE.
    pub fn inbound(&mut self, data: &[u8]) -> Result<Vec<ProtocolEvent>, MangleError> {
        self.inbound.extend(data, &self.limits)?;

        if self.inbound.take_preface().is_none() {
            return Ok(Vec::new());
        }

        let (buffer, spans) = self.inbound.take_frames()?;
        let mut events = Vec::new();
        for span in &spans {
            self.observe(&span.header, span.payload(&buffer), &mut events);
        }
        Ok(events)
    }

    fn observe(&mut self, header: &FrameHeader, payload: &[u8], events: &mut Vec<ProtocolEvent>) {
        let stream_id = header.stream_id;
        match header.frame_type {
            FrameType::Headers => {
                let end_stream = header.has_flag(FLAG_END_STREAM);
                events.push(ProtocolEvent::HeadersReceived {
                    stream_id,
                    end_stream,
                });
                if end_stream {
                    events.push(ProtocolEvent::StreamEnded { stream_id });
                }
            },
            FrameType::Data => {
                events.push(ProtocolEvent::DataReceived {
                    stream_id,
                    length: payload.len(),
                });
                if header.has_flag(FLAG_END_STREAM) {
                    events.push(ProtocolEvent::StreamEnded { stream_id });
                }
            },
            FrameType::Settings if header.has_flag(FLAG_ACK) => {
                events.push(ProtocolEvent::SettingsAcknowledged);
            },
            FrameType::Settings => {
                let update = SettingsUpdate::parse(payload);
                if let Some(size) = update.max_frame_size {
                    if (DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_PAYLOAD_LENGTH).contains(&size) {
                        self.peer_max_frame_size = size;
                    } else {
                        crate::trace_warn!("peer advertised invalid SETTINGS_MAX_FRAME_SIZE {size}");
                    }
                }
                events.push(ProtocolEvent::RemoteSettingsChanged(update));
            },
            FrameType::RstStream => match payload.first_chunk::<4>() {
                Some(code) => events.push(ProtocolEvent::StreamReset {
                    stream_id,
                    error_code: ErrorCode(u32::from_be_bytes(*code)),
                }),
                None => crate::trace_warn!("RST_STREAM on stream {stream_id} too short"),
            },
            FrameType::GoAway => match payload.first_chunk::<8>() {
                Some(fixed) => {
                    let last_stream_id =
                        StreamId(u32::from_be_bytes([fixed[0] & 0x7F, fixed[1], fixed[2], fixed[3]]));
                    let error_code =
                        ErrorCode(u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]));
                    self.terminated = true;
                    events.push(ProtocolEvent::ConnectionTerminated {
                        error_code,
                        last_stream_id,
                        additional_data: Bytes::copy_from_slice(&payload[8..]),
                    });
                },
                None => crate::trace_warn!("GOAWAY too short ({} bytes)", payload.len()),
            },
            _ => {
                // Skip other frame types
            },
        }
    }

    /// Run one send cycle against a sans-io driver: take its next outbound
    /// bytes and return them transformed.
    pub fn pull<D: SessionDriver + ?Sized>(&mut self, driver: &mut D) -> Result<Bytes, MangleError> {
        self.peer_max_frame_size = driver.negotiated_max_frame_size();
        let data = driver.next_outbound_bytes();
        self.outbound(&data)
    }

    /// Run one receive cycle: hand `data` to the driver and return its
    /// events, noting termination.
    pub fn push<D: SessionDriver + ?Sized>(&mut self, driver: &mut D, data: Bytes) -> Vec<ProtocolEvent> {
        let events = driver.consume_inbound_bytes(data);
        if events.iter().any(ProtocolEvent::is_terminal) {
            self.terminated = true;
        }
        events
    }

    /// Close out the connection: report a rule that had to match but never
    /// did, and any bytes still held back.
    pub fn finish(self) -> Result<FinishedConnection, MangleError> {
        if self.rule.require_match && self.rule_state.applied == 0 {
            return Err(MangleError::new(MangleErrorKind::NoMatch));
        }
        if !self.outbound.buffer.is_empty() {
            crate::trace_warn!(
                "dropping {} outbound bytes of an incomplete frame",
                self.outbound.buffer.len()
            );
        }
        Ok(FinishedConnection {
            mutations:       self.rule_state.applied,
            frames_seen:     self.rule_state.frames_seen,
            dropped_pending: self.outbound.buffer.len(),
        })
    }
}

/// Summary of a connection handed back by [`ConnectionContext::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishedConnection {
    pub mutations:       usize,
    pub frames_seen:     usize,
    pub dropped_pending: usize,
}
