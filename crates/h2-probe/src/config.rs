//! Command line configuration.
//!
//! Every mode shares the rule flags in [`RuleArgs`]; each mode supplies the
//! selector and flags it falls back to when none are given.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use h2mangle::{
    FLAG_ACK, FLAG_END_STREAM, FrameTemplate, FrameType, HeaderOverride, MutationRule,
    PayloadOverride, PayloadSize, Selector, SizeClass, StreamId,
};

use crate::error::ProbeError;

#[derive(Debug, Parser)]
#[command(name = "h2-probe", version, about = "Probe HTTP/2 peers with oversized frames")]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Debug, Subcommand)]
pub enum Mode {
    /// Connect to a server and oversize a frame of our request
    Client(ClientArgs),
    /// Accept clients and oversize a frame of our responses
    Serve(ServeArgs),
    /// Sit between a client and a server and oversize relayed frames
    Relay(RelayArgs),
}

#[derive(Debug, Args)]
pub struct ClientArgs {
    /// Server host name (also used for SNI and :authority)
    #[arg(long)]
    pub authority: String,

    #[arg(long, default_value_t = 443)]
    pub port: u16,

    #[arg(long, default_value = "/")]
    pub path: String,

    /// PEM bundle of trusted roots instead of the built-in web PKI roots
    #[arg(long)]
    pub ca_file: Option<PathBuf>,

    /// Speak HTTP/2 with prior knowledge over plain TCP
    #[arg(long)]
    pub plaintext: bool,

    /// Send SETTINGS_HEADER_TABLE_SIZE with this value
    #[arg(long)]
    pub header_table_size: Option<u32>,

    /// Request body sent with the GET
    #[arg(long, default_value = "a")]
    pub body: String,

    #[command(flatten)]
    pub rule: RuleArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:8443")]
    pub listen: SocketAddr,

    /// PEM certificate chain
    #[arg(long, required_unless_present = "plaintext")]
    pub cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, required_unless_present = "plaintext")]
    pub key: Option<PathBuf>,

    #[arg(long)]
    pub plaintext: bool,

    /// Exit after the first connection
    #[arg(long)]
    pub once: bool,

    /// Response body for every request
    #[arg(long, default_value = "ok")]
    pub body: String,

    #[command(flatten)]
    pub rule: RuleArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

/// Which relayed direction is rewritten; the other is only observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Direction {
    ToUpstream,
    ToClient,
}

#[derive(Debug, Args)]
pub struct RelayArgs {
    #[arg(long, default_value = "127.0.0.1:8443")]
    pub listen: SocketAddr,

    /// Upstream server as HOST[:PORT]
    #[arg(long)]
    pub upstream: String,

    #[arg(long)]
    pub ca_file: Option<PathBuf>,

    /// Reach the upstream over plain TCP
    #[arg(long)]
    pub upstream_plaintext: bool,

    /// Certificate for client-facing TLS; clients are accepted in plaintext
    /// without one
    #[arg(long, requires = "key")]
    pub cert: Option<PathBuf>,

    #[arg(long, requires = "cert")]
    pub key: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Direction::ToUpstream)]
    pub direction: Direction,

    /// Exit after the first connection
    #[arg(long)]
    pub once: bool,

    #[command(flatten)]
    pub rule: RuleArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

impl RelayArgs {
    /// Rule fallbacks: the client's request going up, the server's
    /// SETTINGS coming down.
    pub fn rule_defaults(&self) -> RuleDefaults {
        match self.direction {
            Direction::ToUpstream => RuleDefaults::CLIENT,
            Direction::ToClient => RuleDefaults::SERVER,
        }
    }

    /// Upstream host and port (443 when no port is given).
    pub fn upstream_addr(&self) -> Result<(String, u16), ProbeError> {
        match self.upstream.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    ProbeError::InvalidArgument(format!("bad upstream port in {}", self.upstream))
                })?;
                Ok((host.to_string(), port))
            },
            None => Ok((self.upstream.clone(), 443)),
        }
    }
}

#[derive(Debug, Args)]
pub struct OutputArgs {
    /// Seconds to wait for the peer to react
    #[arg(long, default_value_t = 10)]
    pub timeout_secs: u64,

    /// Write a JSON report here
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl OutputArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Which frames the rule picks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectArg {
    FirstData,
    FirstSettings,
    /// The first SETTINGS frame acknowledging the peer's settings
    SettingsAck,
    FirstHeaders,
    Index(usize),
    Offset(usize),
    Type(u8),
    Stream(u32),
    None,
}

impl SelectArg {
    fn selector(self) -> (Selector, Option<usize>) {
        match self {
            Self::FirstData => (Selector::Type(FrameType::Data), Some(1)),
            Self::FirstSettings => (Selector::Type(FrameType::Settings), Some(1)),
            Self::SettingsAck => (
                Selector::custom(|_, h| h.frame_type == FrameType::Settings && h.has_flag(FLAG_ACK)),
                Some(1),
            ),
            Self::FirstHeaders => (Selector::Type(FrameType::Headers), Some(1)),
            Self::Index(n) => (Selector::Index(n), None),
            Self::Offset(n) => (Selector::Offset(n), None),
            Self::Type(t) => (Selector::Type(FrameType::from(t)), None),
            Self::Stream(s) => (Selector::Stream(StreamId(s)), None),
            Self::None => (Selector::Never, None),
        }
    }
}

impl FromStr for SelectArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-data" => return Ok(Self::FirstData),
            "first-settings" => return Ok(Self::FirstSettings),
            "settings-ack" => return Ok(Self::SettingsAck),
            "first-headers" => return Ok(Self::FirstHeaders),
            "none" => return Ok(Self::None),
            _ => {},
        }
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| format!("unknown selector {s:?}"))?;
        match kind {
            "index" => parse_number(value).map(Self::Index),
            "offset" => parse_number(value).map(Self::Offset),
            "type" => parse_byte(value).map(Self::Type),
            "stream" => parse_number(value).map(Self::Stream),
            _ => Err(format!("unknown selector {s:?}")),
        }
    }
}

/// Payload length of rewritten frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeArg {
    OneOver,
    Doubled,
    Exact(usize),
    Pass,
}

impl FromStr for SizeArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one-over" => Ok(Self::OneOver),
            "doubled" => Ok(Self::Doubled),
            "pass" => Ok(Self::Pass),
            _ => match s.strip_prefix("exact:") {
                Some(n) => parse_number(n).map(Self::Exact),
                None => Err(format!("unknown size {s:?}")),
            },
        }
    }
}

/// Accepts decimal or `0x`-prefixed hex.
fn parse_number<T: TryFrom<u64>>(s: &str) -> Result<T, String> {
    let value = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("{s:?}: {e}"))?;
    T::try_from(value).map_err(|_| format!("{s:?} is out of range"))
}

fn parse_byte(s: &str) -> Result<u8, String> {
    parse_number(s)
}

/// Rule flags shared by every mode.
#[derive(Debug, Clone, Args)]
pub struct RuleArgs {
    /// first-data | first-settings | settings-ack | first-headers | index:N |
    /// offset:N | type:N | stream:N | none
    #[arg(long)]
    pub select: Option<SelectArg>,

    /// one-over | doubled | exact:N | pass
    #[arg(long, default_value = "one-over")]
    pub size: SizeArg,

    /// Byte repeated in generated payloads
    #[arg(long, value_parser = parse_byte, default_value = "0")]
    pub fill: u8,

    /// Override the flags byte
    #[arg(long, value_parser = parse_byte)]
    pub flags: Option<u8>,

    /// Override the frame type byte
    #[arg(long, value_parser = parse_byte)]
    pub frame_type: Option<u8>,

    /// Override the stream id
    #[arg(long, value_parser = parse_number::<u32>)]
    pub stream_id: Option<u32>,

    /// Replace selected DATA frames with a synthetic frame
    #[arg(long)]
    pub intercept: bool,

    /// Maximum number of frames to rewrite
    #[arg(long)]
    pub limit: Option<usize>,

    /// Fail when the rule never fires
    #[arg(long)]
    pub require_match: bool,
}

/// What a mode uses for flags the user left unset.
#[derive(Debug, Clone, Copy)]
pub struct RuleDefaults {
    pub select: SelectArg,
    pub flags:  Option<u8>,
}

impl RuleDefaults {
    /// The client oversizes the first DATA frame of its request.
    pub const CLIENT: Self = Self {
        select: SelectArg::FirstData,
        flags:  None,
    };
    /// The server sends its own SETTINGS untouched and oversizes the ACK of
    /// the client's SETTINGS.
    pub const SERVER: Self = Self {
        select: SelectArg::SettingsAck,
        flags:  Some(FLAG_ACK),
    };
}

impl RuleArgs {
    pub fn build(&self, defaults: RuleDefaults) -> Result<MutationRule, ProbeError> {
        if let Some(id) = self.stream_id
            && id > StreamId::MAX
        {
            return Err(ProbeError::InvalidArgument(format!(
                "stream id {id} does not fit in 31 bits"
            )));
        }

        let (selector, implicit_limit) = self.select.unwrap_or(defaults.select).selector();
        let flags = self.flags.or(defaults.flags);
        let payload = match self.size {
            SizeArg::Pass => PayloadOverride::PassThrough,
            SizeArg::OneOver => PayloadOverride::Repeat {
                byte: self.fill,
                size: PayloadSize::Oversize(SizeClass::OneOver),
            },
            SizeArg::Doubled => PayloadOverride::Repeat {
                byte: self.fill,
                size: PayloadSize::Oversize(SizeClass::Doubled),
            },
            SizeArg::Exact(n) => PayloadOverride::Repeat {
                byte: self.fill,
                size: PayloadSize::Exact(n),
            },
        };

        let mut rule = if self.intercept {
            let template = FrameTemplate {
                frame_type: self.frame_type.map_or(FrameType::Data, FrameType::from),
                flags:      flags.unwrap_or(FLAG_END_STREAM),
                stream_id:  StreamId(self.stream_id.unwrap_or(1)),
            };
            MutationRule::intercept(selector, template, payload)
        } else {
            let header = HeaderOverride {
                frame_type: self.frame_type.map(FrameType::from),
                flags,
                stream_id: self.stream_id.map(StreamId),
            };
            MutationRule::rewrite(selector, header, payload)
        };

        rule.limit = self.limit.or(implicit_limit);
        rule.require_match = self.require_match;
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use h2mangle::{FrameHeader, MutationAction};
    use rstest::rstest;

    fn rule_args(args: &[&str]) -> RuleArgs {
        let mut argv = vec!["h2-probe", "client", "--authority", "example.com"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().mode {
            Mode::Client(client) => client.rule,
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[rstest]
    #[case("first-data", SelectArg::FirstData)]
    #[case("settings-ack", SelectArg::SettingsAck)]
    #[case("none", SelectArg::None)]
    #[case("index:3", SelectArg::Index(3))]
    #[case("offset:0x21", SelectArg::Offset(33))]
    #[case("type:0x4", SelectArg::Type(4))]
    #[case("stream:5", SelectArg::Stream(5))]
    fn test_select_parsing(#[case] input: &str, #[case] expected: SelectArg) {
        assert_eq!(input.parse::<SelectArg>().unwrap(), expected);
    }

    #[rstest]
    #[case("bogus")]
    #[case("index:")]
    #[case("type:256")]
    #[case("color:1")]
    fn test_select_parsing_rejects(#[case] input: &str) {
        assert!(input.parse::<SelectArg>().is_err());
    }

    #[rstest]
    #[case("one-over", SizeArg::OneOver)]
    #[case("doubled", SizeArg::Doubled)]
    #[case("pass", SizeArg::Pass)]
    #[case("exact:100", SizeArg::Exact(100))]
    fn test_size_parsing(#[case] input: &str, #[case] expected: SizeArg) {
        assert_eq!(input.parse::<SizeArg>().unwrap(), expected);
    }

    #[test]
    fn test_client_default_rule() {
        let rule = rule_args(&[]).build(RuleDefaults::CLIENT).unwrap();
        assert!(matches!(rule.selector, Selector::Type(FrameType::Data)));
        assert_eq!(rule.limit, Some(1));
        assert!(!rule.require_match);
        assert_eq!(
            rule.action,
            MutationAction::Rewrite {
                header:  HeaderOverride::default(),
                payload: PayloadOverride::oversize(SizeClass::OneOver),
            }
        );
    }

    #[test]
    fn test_server_default_rule_targets_settings_ack() {
        let rule = rule_args(&[]).build(RuleDefaults::SERVER).unwrap();
        let preface_settings = FrameHeader::new(FrameType::Settings, 0x00, StreamId(0), 0);
        let ack = FrameHeader::new(FrameType::Settings, FLAG_ACK, StreamId(0), 0);
        assert!(!rule.selector.matches(0, &preface_settings, 0));
        assert!(rule.selector.matches(1, &ack, 9));
        assert_eq!(rule.limit, Some(1));
        let MutationAction::Rewrite { header, .. } = rule.action else {
            panic!("expected rewrite");
        };
        assert_eq!(header.flags, Some(FLAG_ACK));
    }

    #[test]
    fn test_huge_exact_size_fails_without_allocating() {
        let rule = rule_args(&["--size", "exact:0xffffffffffffffff"])
            .build(RuleDefaults::CLIENT)
            .unwrap();
        let frame = [0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, b'a'];
        let err = h2mangle::mutate(bytes::Bytes::copy_from_slice(&frame), &rule).unwrap_err();
        assert!(matches!(
            err.kind,
            h2mangle::MangleErrorKind::FieldOverflow {
                field: h2mangle::HeaderField::Length,
                ..
            }
        ));
    }

    #[test]
    fn test_intercept_template() {
        let rule = rule_args(&["--intercept", "--size", "doubled", "--fill", "0x61", "--limit", "2"])
            .build(RuleDefaults::CLIENT)
            .unwrap();
        assert_eq!(rule.limit, Some(2));
        assert_eq!(
            rule.action,
            MutationAction::Intercept {
                template: FrameTemplate {
                    frame_type: FrameType::Data,
                    flags:      FLAG_END_STREAM,
                    stream_id:  StreamId(1),
                },
                payload:  PayloadOverride::Repeat {
                    byte: 0x61,
                    size: PayloadSize::Oversize(SizeClass::Doubled),
                },
            }
        );
    }

    #[test]
    fn test_stream_id_out_of_range() {
        let err = rule_args(&["--stream-id", "0x80000000"])
            .build(RuleDefaults::CLIENT)
            .unwrap_err();
        assert!(matches!(err, ProbeError::InvalidArgument(_)));
    }

    #[test]
    fn test_serve_requires_cert_unless_plaintext() {
        assert!(Cli::try_parse_from(["h2-probe", "serve"]).is_err());
        assert!(Cli::try_parse_from(["h2-probe", "serve", "--plaintext"]).is_ok());
    }

    #[test]
    fn test_upstream_addr() {
        let Mode::Relay(relay) =
            Cli::try_parse_from(["h2-probe", "relay", "--upstream", "example.com:8443"])
                .unwrap()
                .mode
        else {
            panic!("expected relay");
        };
        assert_eq!(relay.upstream_addr().unwrap(), ("example.com".to_string(), 8443));
        assert_eq!(relay.direction, Direction::ToUpstream);
    }
}
