//! Mutation rules and the one-pass engine that applies them.
//!
//! A [`MutationRule`] pairs a [`Selector`] with a [`MutationAction`]. The
//! engine walks frames in wire order; frames the selector rejects are passed
//! through as slices of the input buffer, selected frames are rebuilt from
//! the rule. Frames are never reordered, dropped or duplicated.

use std::sync::Arc;

use bytes::Bytes;

use crate::frame::{FrameHeader, FrameType, MAX_FRAME_PAYLOAD_LENGTH};
use crate::reader::FrameSpan;
use crate::serialize::Frame;
use crate::state::{HeaderField, MangleError, MangleErrorKind, StreamId};

/// Oversize target relative to the peer's SETTINGS_MAX_FRAME_SIZE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// One byte past the limit: `max + 1` (16385 for the default 16384)
    OneOver,
    /// One byte past the doubled limit: `2 * max + 1` (32769 for the default)
    Doubled,
}

impl SizeClass {
    /// Payload length that violates `max_frame_size` by this class.
    pub fn resolve(self, max_frame_size: u32) -> u64 {
        let max = u64::from(max_frame_size);
        match self {
            Self::OneOver => max + 1,
            Self::Doubled => 2 * max + 1,
        }
    }
}

/// Length of a generated payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSize {
    Exact(usize),
    Oversize(SizeClass),
}

impl PayloadSize {
    pub fn resolve(self, max_frame_size: u32) -> u64 {
        match self {
            Self::Exact(n) => u64::try_from(n).unwrap_or(u64::MAX),
            Self::Oversize(class) => class.resolve(max_frame_size),
        }
    }
}

/// Payload of a rebuilt frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadOverride {
    /// Keep the original payload bytes
    #[default]
    PassThrough,
    /// A run of `byte` of the given size
    Repeat { byte: u8, size: PayloadSize },
}

impl PayloadOverride {
    /// Zero-filled payload violating the max frame size by `class`.
    pub fn oversize(class: SizeClass) -> Self {
        Self::Repeat {
            byte: 0x00,
            size: PayloadSize::Oversize(class),
        }
    }

    /// Produce the payload, refusing lengths a 24-bit length field cannot
    /// carry before anything is allocated.
    fn build(&self, original: Bytes, max_frame_size: u32, stream_id: StreamId) -> Result<Bytes, MangleError> {
        match *self {
            Self::PassThrough => Ok(original),
            Self::Repeat { byte, size } => {
                let len = size.resolve(max_frame_size);
                if len > u64::from(MAX_FRAME_PAYLOAD_LENGTH) {
                    return Err(MangleError::with_stream(
                        MangleErrorKind::FieldOverflow {
                            field: HeaderField::Length,
                            value: len,
                        },
                        stream_id,
                    ));
                }
                Ok(Bytes::from(vec![byte; len as usize]))
            },
        }
    }
}

/// Header fields to replace; `None` keeps the original value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderOverride {
    pub frame_type: Option<FrameType>,
    pub flags:      Option<u8>,
    pub stream_id:  Option<StreamId>,
}

impl HeaderOverride {
    pub fn frame_type(mut self, frame_type: FrameType) -> Self {
        self.frame_type = Some(frame_type);
        self
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn stream_id(mut self, stream_id: StreamId) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.frame_type.is_none() && self.flags.is_none() && self.stream_id.is_none()
    }
}

/// Header of an entirely synthetic frame used for interception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTemplate {
    pub frame_type: FrameType,
    pub flags:      u8,
    pub stream_id:  StreamId,
}

/// Predicate selecting the frames a rule rewrites.
///
/// `index` counts frames from the start of the connection direction and
/// `offset` is the byte offset of the frame header in that direction.
#[derive(Clone)]
pub enum Selector {
    /// The frame with this ordinal
    Index(usize),
    /// The frame whose header starts at this byte offset
    Offset(usize),
    /// Every frame of this type
    Type(FrameType),
    /// Every frame on this stream
    Stream(StreamId),
    /// Every frame
    Any,
    /// No frame
    Never,
    /// Arbitrary predicate over `(index, header)`
    Custom(Arc<dyn Fn(usize, &FrameHeader) -> bool + Send + Sync>),
}

impl Selector {
    /// Wrap a closure as a selector.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(usize, &FrameHeader) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    pub fn matches(&self, index: usize, header: &FrameHeader, offset: usize) -> bool {
        match self {
            Self::Index(i) => *i == index,
            Self::Offset(o) => *o == offset,
            Self::Type(t) => header.frame_type == *t,
            Self::Stream(s) => header.stream_id == *s,
            Self::Any => true,
            Self::Never => false,
            Self::Custom(f) => f(index, header),
        }
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(i) => f.debug_tuple("Index").field(i).finish(),
            Self::Offset(o) => f.debug_tuple("Offset").field(o).finish(),
            Self::Type(t) => f.debug_tuple("Type").field(t).finish(),
            Self::Stream(s) => f.debug_tuple("Stream").field(s).finish(),
            Self::Any => write!(f, "Any"),
            Self::Never => write!(f, "Never"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(i) => write!(f, "frame #{i}"),
            Self::Offset(o) => write!(f, "frame at byte {o}"),
            Self::Type(t) => write!(f, "{t} frames"),
            Self::Stream(s) => write!(f, "frames on stream {s}"),
            Self::Any => write!(f, "every frame"),
            Self::Never => write!(f, "no frame"),
            Self::Custom(_) => write!(f, "custom predicate"),
        }
    }
}

/// What happens to a selected frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationAction {
    /// Rebuild the frame from the original with the given overrides
    Rewrite {
        header:  HeaderOverride,
        payload: PayloadOverride,
    },
    /// Drop a selected DATA frame and emit a synthetic frame in its place.
    /// Selected frames of other types are relayed unchanged.
    Intercept {
        template: FrameTemplate,
        payload:  PayloadOverride,
    },
}

/// Declarative description of how frames in a stream are corrupted.
#[derive(Debug, Clone)]
pub struct MutationRule {
    pub selector:      Selector,
    pub action:        MutationAction,
    /// Maximum number of frames this rule rewrites per connection direction
    pub limit:         Option<usize>,
    /// Treat a pass that rewrites nothing as an error
    pub require_match: bool,
}

impl MutationRule {
    pub fn new(selector: Selector, action: MutationAction) -> Self {
        Self {
            selector,
            action,
            limit: None,
            require_match: false,
        }
    }

    /// A rule that selects nothing.
    pub fn identity() -> Self {
        Self::new(
            Selector::Never,
            MutationAction::Rewrite {
                header:  HeaderOverride::default(),
                payload: PayloadOverride::PassThrough,
            },
        )
    }

    pub fn rewrite(selector: Selector, header: HeaderOverride, payload: PayloadOverride) -> Self {
        Self::new(selector, MutationAction::Rewrite { header, payload })
    }

    pub fn intercept(selector: Selector, template: FrameTemplate, payload: PayloadOverride) -> Self {
        Self::new(selector, MutationAction::Intercept { template, payload })
    }

    /// Keep the header, replace the payload with zeros of the given size
    /// class.
    pub fn oversize(selector: Selector, class: SizeClass) -> Self {
        Self::rewrite(
            selector,
            HeaderOverride::default(),
            PayloadOverride::oversize(class),
        )
    }

    /// Fire on the first selected frame only.
    pub fn first(self) -> Self {
        self.with_limit(1)
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn require_match(mut self) -> Self {
        self.require_match = true;
        self
    }

    fn exhausted(&self, applied: usize) -> bool {
        self.limit.is_some_and(|limit| applied >= limit)
    }

    fn selects(&self, index: usize, header: &FrameHeader, offset: usize) -> bool {
        if !self.selector.matches(index, header, offset) {
            return false;
        }
        match self.action {
            MutationAction::Rewrite { .. } => true,
            MutationAction::Intercept { .. } => header.frame_type == FrameType::Data,
        }
    }

    fn build(&self, buffer: &Bytes, span: &FrameSpan, max_frame_size: u32) -> Result<Frame, MangleError> {
        let original = span.header;
        let original_payload = buffer.slice(span.payload_range());
        match &self.action {
            MutationAction::Rewrite { header, payload } => {
                let stream_id = header.stream_id.unwrap_or(original.stream_id);
                Frame::new(
                    header.frame_type.unwrap_or(original.frame_type),
                    header.flags.unwrap_or(original.flags),
                    stream_id,
                    payload.build(original_payload, max_frame_size, stream_id)?,
                )
            },
            MutationAction::Intercept { template, payload } => Frame::new(
                template.frame_type,
                template.flags,
                template.stream_id,
                payload.build(original_payload, max_frame_size, template.stream_id)?,
            ),
        }
    }
}

impl std::fmt::Display for MutationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.action {
            MutationAction::Rewrite { header, payload } => {
                write!(f, "rewrite {} ({header:?}, {payload:?})", self.selector)?
            },
            MutationAction::Intercept { template, payload } => {
                write!(f, "intercept {} as {template:?} ({payload:?})", self.selector)?
            },
        }
        if let Some(limit) = self.limit {
            write!(f, " limit {limit}")?;
        }
        Ok(())
    }
}

/// One frame rewritten by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationRecord {
    pub index:       usize,
    pub offset:      usize,
    pub original:    FrameHeader,
    pub replacement: FrameHeader,
    pub intercepted: bool,
}

/// Progress of a rule over one connection direction.
#[derive(Debug, Clone, Default)]
pub struct RuleState {
    /// Frames seen so far (index of the next frame)
    pub frames_seen: usize,
    /// Direction offset of the buffer passed to the next `apply`
    pub base_offset: usize,
    /// Frames rewritten so far
    pub applied:     usize,
    records:         Vec<MutationRecord>,
}

impl RuleState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the records of rewrites performed since the last call.
    pub fn drain_records(&mut self) -> Vec<MutationRecord> {
        std::mem::take(&mut self.records)
    }
}

/// Apply `rule` to the frames `spans` read from `buffer`, in order.
///
/// Unselected frames come back as zero-copy slices of `buffer`. Advances
/// `state` past the spans (`base_offset` advances by the bytes the spans
/// cover). Fails with `NoMatch` when the rule requires a match and has never
/// fired, and with `FieldOverflow` when a requested payload cannot be framed.
/// A failed pass leaves `state` as it was.
pub fn apply(
    buffer: &Bytes,
    spans: &[FrameSpan],
    rule: &MutationRule,
    state: &mut RuleState,
    max_frame_size: u32,
) -> Result<Vec<Frame>, MangleError> {
    let frames = apply_lenient(buffer, spans, rule, state, max_frame_size)?;
    if rule.require_match && state.applied == 0 {
        return Err(MangleError::new(MangleErrorKind::NoMatch));
    }
    Ok(frames)
}

/// Like [`apply`] but never fails with `NoMatch`; used where a match may
/// still arrive in a later pass.
pub(crate) fn apply_lenient(
    buffer: &Bytes,
    spans: &[FrameSpan],
    rule: &MutationRule,
    state: &mut RuleState,
    max_frame_size: u32,
) -> Result<Vec<Frame>, MangleError> {
    let mut frames = Vec::with_capacity(spans.len());
    let mut records = Vec::new();
    let mut frames_seen = state.frames_seen;
    let mut applied = state.applied;
    let mut consumed = 0;

    for span in spans {
        let index = frames_seen;
        let offset = state.base_offset + span.offset;
        frames_seen += 1;
        consumed = span.frame_range().end;

        if rule.exhausted(applied) || !rule.selects(index, &span.header, offset) {
            frames.push(Frame::from_span(buffer, span));
            continue;
        }

        let frame = rule.build(buffer, span, max_frame_size)?;
        crate::trace_debug!("mutating frame #{index} ({}) into ({})", span.header, frame.header());
        records.push(MutationRecord {
            index,
            offset,
            original: span.header,
            replacement: *frame.header(),
            intercepted: matches!(rule.action, MutationAction::Intercept { .. }),
        });
        applied += 1;
        frames.push(frame);
    }

    // Only a pass that produced every frame counts
    state.frames_seen = frames_seen;
    state.applied = applied;
    state.records.extend(records);
    state.base_offset += consumed;
    Ok(frames)
}
