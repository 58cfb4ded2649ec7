// HTTP/2 frame mangling crate
// Parses valid HTTP/2 byte streams into frames and rewrites selected frames
// so that they violate the peer's negotiated frame size

mod frame;
mod mutate;
mod reader;
mod serialize;
mod session;
mod state;

#[cfg(test)]
mod tests;

#[cfg(feature = "tracing")]
macro_rules! trace_warn {
    ($($arg:tt)*) => { ::tracing::warn!($($arg)*) }
}
#[cfg(not(feature = "tracing"))]
macro_rules! trace_warn {
    ($($arg:tt)*) => {{}};
}
pub(crate) use trace_warn;

#[cfg(feature = "tracing")]
macro_rules! trace_debug {
    ($($arg:tt)*) => { ::tracing::debug!($($arg)*) }
}
#[cfg(not(feature = "tracing"))]
macro_rules! trace_debug {
    ($($arg:tt)*) => {{}};
}
pub(crate) use trace_debug;

pub use frame::{
    CONNECTION_PREFACE, DEFAULT_MAX_FRAME_SIZE, FLAG_ACK, FLAG_END_HEADERS, FLAG_END_STREAM,
    FLAG_PADDED, FLAG_PRIORITY, FRAME_HEADER_SIZE, FrameHeader, FrameType,
    MAX_FRAME_PAYLOAD_LENGTH, decode_header, encode_header, is_http2_preface,
    looks_like_http2_frame,
};
pub use mutate::{
    FrameTemplate, HeaderOverride, MutationAction, MutationRecord, MutationRule, PayloadOverride,
    PayloadSize, RuleState, Selector, SizeClass, apply,
};
pub use reader::{Cursor, FrameReader, FrameSpan, ReadEnd, parse_all};
pub use serialize::{Frame, serialize, write_frame};
pub use session::{
    ConnectionContext, FinishedConnection, ProtocolEvent, SessionDriver, SettingsUpdate, Verdict,
    mutate, mutate_with_max_frame_size,
};
pub use state::{ErrorCode, HeaderField, MangleError, MangleErrorKind, MangleLimits, StreamId};
