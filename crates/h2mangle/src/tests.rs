use super::*;
use bytes::Bytes;
use rstest::rstest;

// Helper to create a SETTINGS frame carrying the given (id, value) entries
fn create_settings_frame(entries: &[(u16, u32)]) -> Vec<u8> {
    let len = entries.len() * 6;
    let mut frame = vec![
        0x00,
        (len >> 8) as u8,
        len as u8, // Length
        0x04,      // Type: SETTINGS
        0x00,      // Flags: none
        0x00,
        0x00,
        0x00,
        0x00, // Stream ID: 0
    ];
    for (id, value) in entries {
        frame.extend_from_slice(&id.to_be_bytes());
        frame.extend_from_slice(&value.to_be_bytes());
    }
    frame
}

// Helper to create a frame with an arbitrary header and payload
fn create_frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = vec![
        (len >> 16) as u8,
        (len >> 8) as u8,
        len as u8,
        frame_type,
        flags,
        (stream_id >> 24) as u8 & 0x7F,
        (stream_id >> 16) as u8,
        (stream_id >> 8) as u8,
        stream_id as u8,
    ];
    frame.extend_from_slice(payload);
    frame
}

fn create_goaway_frame(last_stream_id: u32, error_code: u32, debug: &[u8]) -> Vec<u8> {
    let mut payload = last_stream_id.to_be_bytes().to_vec();
    payload.extend_from_slice(&error_code.to_be_bytes());
    payload.extend_from_slice(debug);
    create_frame(0x07, 0x00, 0, &payload)
}

fn first_data_rule(class: SizeClass) -> MutationRule {
    MutationRule::oversize(Selector::Type(FrameType::Data), class).first()
}

// =========================================================================
// One-shot mutate()
// =========================================================================

#[test]
fn test_mutate_identity_is_byte_identical() {
    let mut input = CONNECTION_PREFACE.to_vec();
    input.extend(create_settings_frame(&[(0x01, 4096)]));
    input.extend(create_frame(0x01, 0x04, 1, b"\x82\x84"));
    input.extend(create_frame(0x00, 0x01, 1, b"a"));
    let input = Bytes::from(input);

    let output = mutate(input.clone(), &MutationRule::identity()).unwrap();
    assert_eq!(output, input);
}

#[test]
fn test_mutate_passes_trailing_partial_frame_through() {
    let mut input = create_frame(0x00, 0x00, 1, b"abc");
    // Truncated DATA frame: declares 10 bytes, carries 2
    input.extend_from_slice(&[0x00, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, b'x', b'y']);
    let input = Bytes::from(input);

    let output = mutate(input.clone(), &MutationRule::identity()).unwrap();
    assert_eq!(output, input);
}

#[rstest]
#[case::one_over(SizeClass::OneOver, 16385)]
#[case::doubled(SizeClass::Doubled, 32769)]
fn test_mutate_size_classes(#[case] class: SizeClass, #[case] expected: u32) {
    let input = Bytes::from(create_frame(0x00, 0x01, 1, b"a"));
    let output = mutate(input, &first_data_rule(class)).unwrap();

    let header = decode_header(&output).unwrap();
    assert_eq!(header.length, expected);
    assert!(header.length > DEFAULT_MAX_FRAME_SIZE);
    assert_eq!(output.len(), FRAME_HEADER_SIZE + expected as usize);
    assert!(output[FRAME_HEADER_SIZE..].iter().all(|&b| b == 0));
}

#[test]
fn test_mutate_size_follows_max_frame_size() {
    let input = Bytes::from(create_frame(0x00, 0x00, 1, b"a"));
    let output =
        mutate_with_max_frame_size(input, &first_data_rule(SizeClass::OneOver), 32768).unwrap();
    assert_eq!(decode_header(&output).unwrap().length, 32769);
}

#[test]
fn test_mutate_require_match_reports_no_match() {
    let input = Bytes::from(create_settings_frame(&[]));
    let rule = first_data_rule(SizeClass::OneOver).require_match();
    let err = mutate(input, &rule).unwrap_err();
    assert_eq!(err.kind, MangleErrorKind::NoMatch);
}

#[test]
fn test_mutate_by_offset_after_preface() {
    // Offsets count from the start of the direction, preface included
    let mut input = CONNECTION_PREFACE.to_vec();
    input.extend(create_settings_frame(&[]));
    input.extend(create_frame(0x08, 0x00, 0, &[0x00, 0x00, 0xFF, 0xFF]));
    let input = Bytes::from(input);

    let rule = MutationRule::oversize(Selector::Offset(24 + 9), SizeClass::OneOver);
    let output = mutate(input, &rule).unwrap();

    assert!(output.starts_with(CONNECTION_PREFACE));
    let spans: Vec<_> = parse_all(&output[24..]).collect::<Result<_, _>>().unwrap();
    assert_eq!(spans.len(), 2);
    assert_eq!(spans[0].header.length, 0);
    assert_eq!(spans[1].header.frame_type, FrameType::WindowUpdate);
    assert_eq!(spans[1].header.length, 16385);
}

// =========================================================================
// ConnectionContext: outbound
// =========================================================================

#[test]
fn test_context_buffers_partial_frames_across_writes() {
    let mut ctx = ConnectionContext::new(first_data_rule(SizeClass::OneOver));
    let data = create_frame(0x00, 0x01, 1, b"hello");

    // Header split mid-way, then payload split
    assert!(ctx.outbound(&data[..4]).unwrap().is_empty());
    assert_eq!(ctx.pending_outbound(), 4);
    assert!(ctx.outbound(&data[4..11]).unwrap().is_empty());
    let out = ctx.outbound(&data[11..]).unwrap();

    assert_eq!(ctx.pending_outbound(), 0);
    assert_eq!(decode_header(&out).unwrap().length, 16385);
    assert_eq!(ctx.mutations(), 1);
}

#[test]
fn test_context_preface_split_across_writes() {
    let mut ctx = ConnectionContext::new(MutationRule::identity());
    let mut data = CONNECTION_PREFACE.to_vec();
    data.extend(create_settings_frame(&[(0x04, 65535)]));

    let first = ctx.outbound(&data[..10]).unwrap();
    assert!(first.is_empty(), "preface prefix must be held back");
    let rest = ctx.outbound(&data[10..]).unwrap();
    assert_eq!(&rest[..], &data[..]);
}

#[test]
fn test_context_first_data_fires_once_across_cycles() {
    let mut ctx = ConnectionContext::new(first_data_rule(SizeClass::OneOver));

    let first = ctx.outbound(&create_frame(0x00, 0x00, 1, b"a")).unwrap();
    assert_eq!(decode_header(&first).unwrap().length, 16385);

    let second_in = create_frame(0x00, 0x01, 1, b"b");
    let second = ctx.outbound(&second_in).unwrap();
    assert_eq!(&second[..], &second_in[..]);

    let records = ctx.drain_mutations();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].index, 0);
    assert_eq!(records[0].original.length, 1);
    assert_eq!(records[0].replacement.length, 16385);
}

#[test]
fn test_context_index_counts_across_cycles() {
    let rule = MutationRule::rewrite(
        Selector::Index(2),
        HeaderOverride::default().flags(0xFF),
        PayloadOverride::PassThrough,
    );
    let mut ctx = ConnectionContext::new(rule);
    let a = create_frame(0x06, 0x00, 0, &[0; 8]);
    let b = create_frame(0x06, 0x01, 0, &[0; 8]);

    assert_eq!(&ctx.outbound(&a).unwrap()[..], &a[..]);
    assert_eq!(&ctx.outbound(&a).unwrap()[..], &a[..]);
    let out = ctx.outbound(&b).unwrap();
    assert_eq!(decode_header(&out).unwrap().flags, 0xFF);
}

#[test]
fn test_context_buffer_limit() {
    let limits = MangleLimits {
        max_buffer_size: 16,
        ..MangleLimits::default()
    };
    let mut ctx = ConnectionContext::with_limits(MutationRule::identity(), limits);
    // Partial frame that can never complete within the limit
    let header = [0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01];
    assert!(ctx.outbound(&header).unwrap().is_empty());
    let err = ctx.outbound(&[0u8; 8]).unwrap_err();
    assert_eq!(err.kind, MangleErrorKind::BufferTooLarge { limit: 16 });
}

#[test]
fn test_mutate_unframeable_length_is_an_error() {
    let rule = MutationRule::rewrite(
        Selector::Any,
        HeaderOverride::default(),
        PayloadOverride::Repeat {
            byte: 0,
            size: PayloadSize::Exact(usize::MAX),
        },
    );
    let err = mutate(Bytes::from(create_frame(0x00, 0x01, 1, b"a")), &rule).unwrap_err();
    assert_eq!(
        err.kind,
        MangleErrorKind::FieldOverflow {
            field: HeaderField::Length,
            value: u64::MAX,
        }
    );
}

#[test]
fn test_context_keeps_batch_after_failed_rewrite() {
    let rule = MutationRule::rewrite(
        Selector::Stream(StreamId(3)),
        HeaderOverride::default(),
        PayloadOverride::Repeat {
            byte: 0,
            size: PayloadSize::Exact(1 << 24),
        },
    );
    let mut ctx = ConnectionContext::new(rule);
    let mut data = CONNECTION_PREFACE.to_vec();
    data.extend(create_frame(0x00, 0x00, 1, b"keep"));
    data.extend(create_frame(0x00, 0x01, 3, b"x"));

    let err = ctx.outbound(&data).unwrap_err();
    assert!(matches!(err.kind, MangleErrorKind::FieldOverflow { .. }));
    assert_eq!(err.stream_id, Some(StreamId(3)));
    assert_eq!(ctx.pending_outbound(), data.len());
    assert_eq!(ctx.mutations(), 0);
    assert!(ctx.drain_mutations().is_empty());

    // The driver chooses to carry on without the rewrite
    ctx.set_rule(MutationRule::identity());
    let out = ctx.outbound(&[]).unwrap();
    assert_eq!(&out[..], &data[..]);
    assert_eq!(ctx.pending_outbound(), 0);

    let summary = ctx.finish().unwrap();
    assert_eq!(summary.frames_seen, 2);
    assert_eq!(summary.mutations, 0);
    assert_eq!(summary.dropped_pending, 0);
}

#[test]
fn test_context_finish_reports_unmatched_required_rule() {
    let ctx = ConnectionContext::new(first_data_rule(SizeClass::OneOver).require_match());
    let err = ctx.finish().unwrap_err();
    assert_eq!(err.kind, MangleErrorKind::NoMatch);

    let mut ctx = ConnectionContext::new(first_data_rule(SizeClass::OneOver).require_match());
    ctx.outbound(&create_frame(0x00, 0x00, 1, b"a")).unwrap();
    ctx.outbound(&[0x00, 0x00]).unwrap();
    let summary = ctx.finish().unwrap();
    assert_eq!(summary.mutations, 1);
    assert_eq!(summary.frames_seen, 1);
    assert_eq!(summary.dropped_pending, 2);
}

// =========================================================================
// ConnectionContext: inbound observation
// =========================================================================

#[test]
fn test_inbound_settings_update_max_frame_size() {
    let mut ctx = ConnectionContext::new(first_data_rule(SizeClass::OneOver));
    let events = ctx
        .inbound(&create_settings_frame(&[(0x03, 100), (0x05, 32768)]))
        .unwrap();
    assert_eq!(events.len(), 1);
    let ProtocolEvent::RemoteSettingsChanged(update) = &events[0] else {
        panic!("expected settings event, got {events:?}");
    };
    assert_eq!(update.max_concurrent_streams, Some(100));
    assert_eq!(update.max_frame_size, Some(32768));
    assert_eq!(ctx.peer_max_frame_size(), 32768);

    // Oversize target now follows the advertised limit
    let out = ctx.outbound(&create_frame(0x00, 0x00, 1, b"a")).unwrap();
    assert_eq!(decode_header(&out).unwrap().length, 32769);
}

#[test]
fn test_inbound_ignores_invalid_max_frame_size() {
    let mut ctx = ConnectionContext::new(MutationRule::identity());
    ctx.inbound(&create_settings_frame(&[(0x05, 100)])).unwrap();
    assert_eq!(ctx.peer_max_frame_size(), DEFAULT_MAX_FRAME_SIZE);
}

#[test]
fn test_inbound_skips_client_preface() {
    let mut ctx = ConnectionContext::new(MutationRule::identity());
    let mut data = CONNECTION_PREFACE.to_vec();
    data.extend(create_frame(0x04, 0x01, 0, &[]));
    let events = ctx.inbound(&data).unwrap();
    assert_eq!(events, vec![ProtocolEvent::SettingsAcknowledged]);
}

#[test]
fn test_inbound_stream_events() {
    let mut ctx = ConnectionContext::new(MutationRule::identity());
    let mut data = create_frame(0x01, 0x04, 1, b"\x88");
    data.extend(create_frame(0x00, 0x00, 1, b"abc"));
    data.extend(create_frame(0x00, 0x01, 1, b"de"));
    data.extend(create_frame(0x03, 0x00, 3, &[0x00, 0x00, 0x00, 0x08]));

    let events = ctx.inbound(&data).unwrap();
    assert_eq!(
        events,
        vec![
            ProtocolEvent::HeadersReceived {
                stream_id:  StreamId(1),
                end_stream: false,
            },
            ProtocolEvent::DataReceived {
                stream_id: StreamId(1),
                length:    3,
            },
            ProtocolEvent::DataReceived {
                stream_id: StreamId(1),
                length:    2,
            },
            ProtocolEvent::StreamEnded {
                stream_id: StreamId(1),
            },
            ProtocolEvent::StreamReset {
                stream_id:  StreamId(3),
                error_code: ErrorCode::CANCEL,
            },
        ]
    );
    assert!(!ctx.is_terminated());
}

#[test]
fn test_inbound_goaway_terminates() {
    let mut ctx = ConnectionContext::new(MutationRule::identity());
    let data = create_goaway_frame(1, 0x6, b"frame too large");
    // Deliver in two pieces to exercise inbound buffering
    assert!(ctx.inbound(&data[..12]).unwrap().is_empty());
    let events = ctx.inbound(&data[12..]).unwrap();
    assert_eq!(
        events,
        vec![ProtocolEvent::ConnectionTerminated {
            error_code:      ErrorCode::FRAME_SIZE_ERROR,
            last_stream_id:  StreamId(1),
            additional_data: Bytes::from_static(b"frame too large"),
        }]
    );
    assert!(ctx.is_terminated());
}

// =========================================================================
// Verdict
// =========================================================================

#[rstest]
#[case::goaway_frame_size(
    vec![ProtocolEvent::ConnectionTerminated {
        error_code: ErrorCode::FRAME_SIZE_ERROR,
        last_stream_id: StreamId(0),
        additional_data: Bytes::new(),
    }],
    Verdict::Enforced { stream_id: None },
)]
#[case::reset_frame_size(
    vec![ProtocolEvent::StreamReset { stream_id: StreamId(1), error_code: ErrorCode::FRAME_SIZE_ERROR }],
    Verdict::Enforced { stream_id: Some(StreamId(1)) },
)]
#[case::goaway_protocol_error(
    vec![ProtocolEvent::ConnectionTerminated {
        error_code: ErrorCode::PROTOCOL_ERROR,
        last_stream_id: StreamId(0),
        additional_data: Bytes::new(),
    }],
    Verdict::RejectedOther { error_code: ErrorCode::PROTOCOL_ERROR },
)]
#[case::response_completed(
    vec![
        ProtocolEvent::HeadersReceived { stream_id: StreamId(1), end_stream: false },
        ProtocolEvent::StreamEnded { stream_id: StreamId(1) },
    ],
    Verdict::Accepted,
)]
#[case::nothing(vec![ProtocolEvent::SettingsAcknowledged], Verdict::Inconclusive)]
fn test_verdict_from_events(#[case] events: Vec<ProtocolEvent>, #[case] expected: Verdict) {
    assert_eq!(Verdict::from_events(&events, 1), expected);
}

#[test]
fn test_verdict_without_mutation_is_inconclusive() {
    let events = vec![ProtocolEvent::ConnectionTerminated {
        error_code:      ErrorCode::FRAME_SIZE_ERROR,
        last_stream_id:  StreamId(0),
        additional_data: Bytes::new(),
    }];
    assert_eq!(Verdict::from_events(&events, 0), Verdict::Inconclusive);
}

#[test]
fn test_error_display_includes_stream() {
    let err = MangleError::with_stream(
        MangleErrorKind::TruncatedPayload {
            declared:  10,
            available: 2,
        },
        StreamId(7),
    );
    assert_eq!(
        err.to_string(),
        "[stream 7] HTTP/2 frame declares 10 payload bytes but only 2 are available"
    );
    assert_eq!(ErrorCode::FRAME_SIZE_ERROR.to_string(), "FRAME_SIZE_ERROR");
    assert_eq!(ErrorCode(0x42).to_string(), "0x42");
}
