#![allow(dead_code)]
//! Raw HTTP/2 frame builders for tests
//!
//! Frames are built byte by byte, independent of the crate's own encoder, so
//! tests can compare the crate's output against a second opinion.

pub const FRAME_TYPE_DATA: u8 = 0x00;
pub const FRAME_TYPE_HEADERS: u8 = 0x01;
pub const FRAME_TYPE_RST_STREAM: u8 = 0x03;
pub const FRAME_TYPE_SETTINGS: u8 = 0x04;
pub const FRAME_TYPE_PING: u8 = 0x06;
pub const FRAME_TYPE_GOAWAY: u8 = 0x07;
pub const FRAME_TYPE_WINDOW_UPDATE: u8 = 0x08;

pub const FLAG_END_STREAM: u8 = 0x01;
pub const FLAG_END_HEADERS: u8 = 0x04;
pub const FLAG_ACK: u8 = 0x01; // For SETTINGS and PING

/// HTTP/2 connection preface
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// SETTINGS_HEADER_TABLE_SIZE
pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x01;
/// SETTINGS_MAX_FRAME_SIZE
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x05;

/// Build a raw HTTP/2 frame header (9 bytes)
pub fn build_frame_header(length: u32, frame_type: u8, flags: u8, stream_id: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(9);
    // Length (24-bit)
    header.push((length >> 16) as u8);
    header.push((length >> 8) as u8);
    header.push(length as u8);
    header.push(frame_type);
    header.push(flags);
    // Stream ID (31-bit, high bit reserved)
    header.push((stream_id >> 24) as u8 & 0x7F);
    header.push((stream_id >> 16) as u8);
    header.push((stream_id >> 8) as u8);
    header.push(stream_id as u8);
    header
}

/// Build a frame of any type with the given payload
pub fn build_frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = build_frame_header(payload.len() as u32, frame_type, flags, stream_id);
    frame.extend_from_slice(payload);
    frame
}

/// Build a DATA frame
pub fn build_data_frame(stream_id: u32, data: &[u8], end_stream: bool) -> Vec<u8> {
    let flags = if end_stream { FLAG_END_STREAM } else { 0 };
    build_frame(FRAME_TYPE_DATA, flags, stream_id, data)
}

/// Build a HEADERS frame
pub fn build_headers_frame(stream_id: u32, hpack_block: &[u8], flags: u8) -> Vec<u8> {
    build_frame(FRAME_TYPE_HEADERS, flags, stream_id, hpack_block)
}

/// Build a SETTINGS frame from (identifier, value) pairs
pub fn build_settings_frame(settings: &[(u16, u32)]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(settings.len() * 6);
    for (id, value) in settings {
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
    }
    build_frame(FRAME_TYPE_SETTINGS, 0, 0, &payload)
}

/// Build a SETTINGS ACK frame
pub fn build_settings_ack_frame() -> Vec<u8> {
    build_frame_header(0, FRAME_TYPE_SETTINGS, FLAG_ACK, 0)
}

/// Build a WINDOW_UPDATE frame
pub fn build_window_update_frame(stream_id: u32, increment: u32) -> Vec<u8> {
    build_frame(
        FRAME_TYPE_WINDOW_UPDATE,
        0,
        stream_id,
        &(increment & 0x7FFFFFFF).to_be_bytes(),
    )
}

/// Build a PING frame
pub fn build_ping_frame(data: &[u8; 8], ack: bool) -> Vec<u8> {
    let flags = if ack { FLAG_ACK } else { 0 };
    build_frame(FRAME_TYPE_PING, flags, 0, data)
}

/// Build a GOAWAY frame
pub fn build_goaway_frame(last_stream_id: u32, error_code: u32) -> Vec<u8> {
    let mut payload = (last_stream_id & 0x7FFFFFFF).to_be_bytes().to_vec();
    payload.extend_from_slice(&error_code.to_be_bytes());
    build_frame(FRAME_TYPE_GOAWAY, 0, 0, &payload)
}

/// Build a RST_STREAM frame
pub fn build_rst_stream_frame(stream_id: u32, error_code: u32) -> Vec<u8> {
    build_frame(FRAME_TYPE_RST_STREAM, 0, stream_id, &error_code.to_be_bytes())
}

/// HPACK block for `GET /` over https using static table entries only
pub fn hpack_get_root() -> Vec<u8> {
    // :method GET, :scheme https, :path /
    vec![0x82, 0x87, 0x84]
}

/// HPACK block for `:status 200`
pub fn hpack_status_200() -> Vec<u8> {
    vec![0x88]
}

/// The first flight a client sends: preface plus its SETTINGS
pub fn client_connection_start(settings: &[(u16, u32)]) -> Vec<u8> {
    let mut buf = PREFACE.to_vec();
    buf.extend(build_settings_frame(settings));
    buf
}

/// A GET request on `stream_id` carrying a one-byte body
pub fn build_get_with_body(stream_id: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = build_headers_frame(stream_id, &hpack_get_root(), FLAG_END_HEADERS);
    buf.extend(build_data_frame(stream_id, body, true));
    buf
}
