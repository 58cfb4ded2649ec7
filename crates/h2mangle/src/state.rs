/// Newtype for HTTP/2 stream identifiers (RFC 9113 §5.1.1: 31-bit unsigned
/// integer).
///
/// The wrapped value is not masked on construction; a value above
/// [`StreamId::MAX`] is representable so that encoding can report it as a
/// field overflow instead of silently truncating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Stream 0, reserved for connection-level frames.
    pub const CONNECTION: StreamId = StreamId(0);
    /// Largest representable stream identifier (2^31 - 1).
    pub const MAX: u32 = (1 << 31) - 1;

    /// Returns true for the connection-level stream 0.
    pub fn is_connection(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for StreamId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<StreamId> for u32 {
    fn from(v: StreamId) -> Self {
        v.0
    }
}

/// HTTP/2 error code carried by RST_STREAM and GOAWAY (RFC 9113 §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const NO_ERROR: ErrorCode = ErrorCode(0x0);
    pub const PROTOCOL_ERROR: ErrorCode = ErrorCode(0x1);
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(0x2);
    pub const FLOW_CONTROL_ERROR: ErrorCode = ErrorCode(0x3);
    pub const SETTINGS_TIMEOUT: ErrorCode = ErrorCode(0x4);
    pub const STREAM_CLOSED: ErrorCode = ErrorCode(0x5);
    pub const FRAME_SIZE_ERROR: ErrorCode = ErrorCode(0x6);
    pub const REFUSED_STREAM: ErrorCode = ErrorCode(0x7);
    pub const CANCEL: ErrorCode = ErrorCode(0x8);
    pub const COMPRESSION_ERROR: ErrorCode = ErrorCode(0x9);
    pub const CONNECT_ERROR: ErrorCode = ErrorCode(0xa);
    pub const ENHANCE_YOUR_CALM: ErrorCode = ErrorCode(0xb);
    pub const INADEQUATE_SECURITY: ErrorCode = ErrorCode(0xc);
    pub const HTTP_1_1_REQUIRED: ErrorCode = ErrorCode(0xd);

    /// Registered name of the code, if it has one.
    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            0x0 => "NO_ERROR",
            0x1 => "PROTOCOL_ERROR",
            0x2 => "INTERNAL_ERROR",
            0x3 => "FLOW_CONTROL_ERROR",
            0x4 => "SETTINGS_TIMEOUT",
            0x5 => "STREAM_CLOSED",
            0x6 => "FRAME_SIZE_ERROR",
            0x7 => "REFUSED_STREAM",
            0x8 => "CANCEL",
            0x9 => "COMPRESSION_ERROR",
            0xa => "CONNECT_ERROR",
            0xb => "ENHANCE_YOUR_CALM",
            0xc => "INADEQUATE_SECURITY",
            0xd => "HTTP_1_1_REQUIRED",
            _ => return None,
        };
        Some(name)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "0x{:x}", self.0),
        }
    }
}

/// Configurable limits for incremental frame handling.
///
/// These bound the per-direction buffers a [`ConnectionContext`] keeps while
/// waiting for the rest of a partially written frame.
///
/// [`ConnectionContext`]: crate::ConnectionContext
#[derive(Debug, Clone)]
pub struct MangleLimits {
    /// Maximum bytes buffered per direction while a frame is incomplete
    /// (default: 4 MiB).
    pub max_buffer_size:        usize,
    /// Peer SETTINGS_MAX_FRAME_SIZE assumed until the peer advertises one
    /// (default: 16384, RFC 9113 initial value)
    pub default_max_frame_size: u32,
}

impl Default for MangleLimits {
    fn default() -> Self {
        Self {
            max_buffer_size:        4 * 1024 * 1024, // 4 MiB
            default_max_frame_size: crate::frame::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Header field that could not be represented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    /// 24-bit payload length
    Length,
    /// 31-bit stream identifier
    StreamId,
}

impl std::fmt::Display for HeaderField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Length => write!(f, "length"),
            Self::StreamId => write!(f, "stream_id"),
        }
    }
}

/// Classification of mangling errors (public API)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MangleErrorKind {
    /// A frame header needs 9 bytes but fewer were supplied
    MalformedHeader { available: usize },
    /// The header declares more payload than the buffer holds
    TruncatedPayload { declared: usize, available: usize },
    /// A header field value does not fit its wire width
    FieldOverflow { field: HeaderField, value: u64 },
    /// The rule requires a match but no frame in the pass was selected
    NoMatch,
    /// A per-direction buffer would exceed `max_buffer_size`
    BufferTooLarge { limit: usize },
}

impl std::fmt::Display for MangleErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedHeader { available } => {
                write!(f, "HTTP/2 frame header needs 9 bytes, got {available}")
            },
            Self::TruncatedPayload {
                declared,
                available,
            } => write!(
                f,
                "HTTP/2 frame declares {declared} payload bytes but only {available} are available"
            ),
            Self::FieldOverflow { field, value } => {
                write!(f, "HTTP/2 frame header field {field} cannot encode {value}")
            },
            Self::NoMatch => write!(f, "mutation rule matched no frame"),
            Self::BufferTooLarge { limit } => {
                write!(f, "pending frame buffer exceeds {limit} bytes")
            },
        }
    }
}

/// Mangling error with optional stream context (public API)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MangleError {
    /// What went wrong
    pub kind:      MangleErrorKind,
    /// The stream of the frame being handled, if known
    pub stream_id: Option<StreamId>,
}

impl MangleError {
    /// Create an error without stream context.
    pub fn new(kind: MangleErrorKind) -> Self {
        Self {
            kind,
            stream_id: None,
        }
    }

    /// Create an error tied to the frame on `stream_id`.
    pub fn with_stream(kind: MangleErrorKind, stream_id: StreamId) -> Self {
        Self {
            kind,
            stream_id: Some(stream_id),
        }
    }
}

impl std::fmt::Display for MangleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(sid) = self.stream_id {
            write!(f, "[stream {sid}] {}", self.kind)
        } else {
            write!(f, "{}", self.kind)
        }
    }
}

impl std::error::Error for MangleError {}
