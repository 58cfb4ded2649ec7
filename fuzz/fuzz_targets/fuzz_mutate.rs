//! Fuzz target: structured mutation
//!
//! Builds well-formed frame streams and arbitrary rules with the Arbitrary
//! trait, then runs them through one-shot `mutate` and through a connection
//! context fed in odd-sized chunks. Both paths must agree.

#![no_main]

use arbitrary::Arbitrary;
use bytes::{Bytes, BytesMut};
use h2mangle::{
    CONNECTION_PREFACE, ConnectionContext, Frame, FrameTemplate, FrameType, HeaderOverride,
    MangleLimits, MutationRule, PayloadOverride, PayloadSize, Selector, SizeClass, StreamId,
    mutate, write_frame,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct FuzzFrame {
    frame_type: u8,
    flags:      u8,
    stream_id:  u32,
    payload:    Vec<u8>,
}

#[derive(Debug, Arbitrary)]
enum FuzzSelector {
    Index(u8),
    Offset(u16),
    Type(u8),
    Stream(u8),
    Any,
    Never,
}

#[derive(Debug, Arbitrary)]
enum FuzzSize {
    OneOver,
    Doubled,
    Exact(u16),
    Pass,
}

#[derive(Debug, Arbitrary)]
struct FuzzRule {
    selector:      FuzzSelector,
    size:          FuzzSize,
    fill:          u8,
    flags:         Option<u8>,
    frame_type:    Option<u8>,
    intercept:     bool,
    limit:         Option<u8>,
    require_match: bool,
}

#[derive(Debug, Arbitrary)]
struct FuzzConnection {
    include_preface: bool,
    frames:          Vec<FuzzFrame>,
    rule:            FuzzRule,
    chunk:           u8,
}

impl FuzzRule {
    fn build(&self) -> MutationRule {
        let selector = match self.selector {
            FuzzSelector::Index(i) => Selector::Index(usize::from(i)),
            FuzzSelector::Offset(o) => Selector::Offset(usize::from(o)),
            FuzzSelector::Type(t) => Selector::Type(FrameType::from(t)),
            FuzzSelector::Stream(s) => Selector::Stream(StreamId(u32::from(s))),
            FuzzSelector::Any => Selector::Any,
            FuzzSelector::Never => Selector::Never,
        };
        let payload = match self.size {
            FuzzSize::OneOver => PayloadOverride::Repeat {
                byte: self.fill,
                size: PayloadSize::Oversize(SizeClass::OneOver),
            },
            FuzzSize::Doubled => PayloadOverride::Repeat {
                byte: self.fill,
                size: PayloadSize::Oversize(SizeClass::Doubled),
            },
            FuzzSize::Exact(n) => PayloadOverride::Repeat {
                byte: self.fill,
                size: PayloadSize::Exact(usize::from(n)),
            },
            FuzzSize::Pass => PayloadOverride::PassThrough,
        };

        let mut rule = if self.intercept {
            let template = FrameTemplate {
                frame_type: FrameType::Data,
                flags:      self.flags.unwrap_or(0x01),
                stream_id:  StreamId(1),
            };
            MutationRule::intercept(selector, template, payload)
        } else {
            let mut header = HeaderOverride::default();
            if let Some(flags) = self.flags {
                header = header.flags(flags);
            }
            if let Some(t) = self.frame_type {
                header = header.frame_type(FrameType::from(t));
            }
            MutationRule::rewrite(selector, header, payload)
        };
        if let Some(limit) = self.limit {
            rule = rule.with_limit(usize::from(limit));
        }
        if self.require_match {
            rule = rule.require_match();
        }
        rule
    }
}

impl FuzzConnection {
    fn to_bytes(&self) -> Bytes {
        let mut data = BytesMut::new();
        if self.include_preface {
            data.extend_from_slice(CONNECTION_PREFACE);
        }
        for f in &self.frames {
            let mut payload = f.payload.clone();
            payload.truncate(16384);
            let frame = Frame::new(
                FrameType::from(f.frame_type),
                f.flags,
                StreamId(f.stream_id & StreamId::MAX),
                Bytes::from(payload),
            );
            if let Ok(frame) = frame {
                let _ = write_frame(&frame, &mut data);
            }
        }
        data.freeze()
    }
}

fuzz_target!(|conn: FuzzConnection| {
    let data = conn.to_bytes();
    let rule = conn.rule.build();
    let oneshot = mutate(data.clone(), &rule);

    // Same stream through a context, a few bytes at a time
    let limits = MangleLimits {
        max_buffer_size: 1 << 20,
        ..MangleLimits::default()
    };
    let mut context = ConnectionContext::with_limits(rule, limits);
    let chunk = usize::from(conn.chunk).max(1);
    let mut streamed = BytesMut::new();
    for piece in data.chunks(chunk) {
        match context.outbound(piece) {
            Ok(out) => streamed.extend_from_slice(&out),
            Err(_) => return,
        }
    }
    let finished = context.finish();

    // One-shot require_match failures have no streaming counterpart until finish
    if let (Ok(oneshot), Ok(_)) = (oneshot, finished) {
        assert_eq!(&oneshot[..], &streamed[..]);
    }
});
