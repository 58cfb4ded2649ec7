use crate::state::{HeaderField, MangleError, MangleErrorKind, StreamId};


/// HTTP/2 connection preface: "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Frame flags
pub const FLAG_END_STREAM: u8 = 0x01;
pub const FLAG_ACK: u8 = 0x01;
pub const FLAG_END_HEADERS: u8 = 0x04;
pub const FLAG_PADDED: u8 = 0x08;
pub const FLAG_PRIORITY: u8 = 0x20;

/// Frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum encodable frame payload length (2^24 - 1, RFC 9113 §4.1)
pub const MAX_FRAME_PAYLOAD_LENGTH: u32 = (1 << 24) - 1;

/// Initial SETTINGS_MAX_FRAME_SIZE (2^14, RFC 9113 §6.5.2)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1 << 14;

/// HTTP/2 frame type.
///
/// Types outside the registered set decode as [`FrameType::Unknown`] so that
/// they can be carried through and produced on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl FrameType {
    /// Wire value of this type.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Data => 0x0,
            Self::Headers => 0x1,
            Self::Priority => 0x2,
            Self::RstStream => 0x3,
            Self::Settings => 0x4,
            Self::PushPromise => 0x5,
            Self::Ping => 0x6,
            Self::GoAway => 0x7,
            Self::WindowUpdate => 0x8,
            Self::Continuation => 0x9,
            Self::Unknown(t) => t,
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            t => Self::Unknown(t),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(v: FrameType) -> Self {
        v.as_u8()
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => write!(f, "DATA"),
            Self::Headers => write!(f, "HEADERS"),
            Self::Priority => write!(f, "PRIORITY"),
            Self::RstStream => write!(f, "RST_STREAM"),
            Self::Settings => write!(f, "SETTINGS"),
            Self::PushPromise => write!(f, "PUSH_PROMISE"),
            Self::Ping => write!(f, "PING"),
            Self::GoAway => write!(f, "GOAWAY"),
            Self::WindowUpdate => write!(f, "WINDOW_UPDATE"),
            Self::Continuation => write!(f, "CONTINUATION"),
            Self::Unknown(t) => write!(f, "UNKNOWN(0x{t:02x})"),
        }
    }
}

/// Parsed HTTP/2 frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length:     u32,
    pub frame_type: FrameType,
    pub flags:      u8,
    pub stream_id:  StreamId,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, flags: u8, stream_id: StreamId, length: u32) -> Self {
        Self {
            length,
            frame_type,
            flags,
            stream_id,
        }
    }

    /// Check if the header has a specific flag set.
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

impl std::fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} len={} flags=0x{:02x} stream={}",
            self.frame_type, self.length, self.flags, self.stream_id
        )
    }
}

/// Check if buffer starts with HTTP/2 connection preface
pub fn is_http2_preface(buffer: &[u8]) -> bool {
    buffer.len() >= CONNECTION_PREFACE.len() && buffer.starts_with(CONNECTION_PREFACE)
}

/// Heuristic check if buffer looks like an HTTP/2 frame header.
/// Checks for valid frame type and reasonable length.
pub fn looks_like_http2_frame(buffer: &[u8]) -> bool {
    let Ok(header) = decode_header(buffer) else {
        return false;
    };

    // Registered types only; the reader itself accepts any type
    if !header.frame_type.is_known() {
        return false;
    }

    // SETTINGS frames on stream 0 carry 6-byte entries
    if header.frame_type == FrameType::Settings
        && header.stream_id.is_connection()
        && !header.length.is_multiple_of(6)
    {
        return false;
    }

    true
}

/// Decode the 9-byte frame header at the start of `buffer`.
///
/// Zero-length frames are valid (SETTINGS ACK, empty DATA with END_STREAM).
/// The reserved bit is ignored.
pub fn decode_header(buffer: &[u8]) -> Result<FrameHeader, MangleError> {
    let Some(bytes) = buffer.first_chunk::<FRAME_HEADER_SIZE>() else {
        return Err(MangleError::new(MangleErrorKind::MalformedHeader {
            available: buffer.len(),
        }));
    };

    let length = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
    let frame_type = FrameType::from(bytes[3]);
    let flags = bytes[4];
    let stream_id = StreamId(u32::from_be_bytes([
        bytes[5] & 0x7F,
        bytes[6],
        bytes[7],
        bytes[8],
    ]));

    Ok(FrameHeader {
        length,
        frame_type,
        flags,
        stream_id,
    })
}

/// Encode a frame header into its 9-byte wire form.
///
/// The reserved bit is always written as zero. Fails with `FieldOverflow`
/// when `length` exceeds 24 bits or `stream_id` exceeds 31 bits.
pub fn encode_header(header: &FrameHeader) -> Result<[u8; FRAME_HEADER_SIZE], MangleError> {
    if header.length > MAX_FRAME_PAYLOAD_LENGTH {
        return Err(MangleError::with_stream(
            MangleErrorKind::FieldOverflow {
                field: HeaderField::Length,
                value: u64::from(header.length),
            },
            header.stream_id,
        ));
    }
    if header.stream_id.0 > StreamId::MAX {
        return Err(MangleError::new(MangleErrorKind::FieldOverflow {
            field: HeaderField::StreamId,
            value: u64::from(header.stream_id.0),
        }));
    }

    let [_, l0, l1, l2] = header.length.to_be_bytes();
    let [s0, s1, s2, s3] = header.stream_id.0.to_be_bytes();
    Ok([
        l0,
        l1,
        l2,
        header.frame_type.as_u8(),
        header.flags,
        s0 & 0x7F,
        s1,
        s2,
        s3,
    ])
}
