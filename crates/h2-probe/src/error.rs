use h2mangle::MangleError;

/// Errors raised while driving a probe session.
#[derive(Debug)]
pub enum ProbeError {
    /// Socket or file I/O failed
    Io(std::io::Error),
    /// TLS configuration or handshake failed
    Tls(rustls::Error),
    /// The HTTP/2 engine reported a local failure
    H2(h2::Error),
    /// The mutation core rejected the traffic or the rule
    Mangle(MangleError),
    /// The peer did not negotiate `h2` over ALPN
    Alpn { negotiated: Option<Vec<u8>> },
    /// A command line value could not be used
    InvalidArgument(String),
    /// The JSON report could not be written
    Report(serde_json::Error),
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Tls(e) => write!(f, "TLS error: {e}"),
            Self::H2(e) => write!(f, "HTTP/2 error: {e}"),
            Self::Mangle(e) => write!(f, "mutation error: {e}"),
            Self::Alpn { negotiated: None } => write!(f, "peer did not negotiate a protocol over ALPN"),
            Self::Alpn {
                negotiated: Some(proto),
            } => write!(
                f,
                "peer negotiated {:?} instead of h2",
                String::from_utf8_lossy(proto)
            ),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Report(e) => write!(f, "failed to write report: {e}"),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Tls(e) => Some(e),
            Self::H2(e) => Some(e),
            Self::Mangle(e) => Some(e),
            Self::Report(e) => Some(e),
            Self::Alpn { .. } | Self::InvalidArgument(_) => None,
        }
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<rustls::Error> for ProbeError {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e)
    }
}

impl From<h2::Error> for ProbeError {
    fn from(e: h2::Error) -> Self {
        Self::H2(e)
    }
}

impl From<MangleError> for ProbeError {
    fn from(e: MangleError) -> Self {
        Self::Mangle(e)
    }
}

impl From<serde_json::Error> for ProbeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Report(e)
    }
}

impl From<http::Error> for ProbeError {
    fn from(e: http::Error) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use h2mangle::{HeaderField, MangleErrorKind, StreamId};
    use std::error::Error;

    #[test]
    fn test_mangle_error_keeps_source() {
        let err = ProbeError::from(MangleError::with_stream(
            MangleErrorKind::FieldOverflow {
                field: HeaderField::Length,
                value: 1 << 24,
            },
            StreamId(1),
        ));
        assert!(err.to_string().starts_with("mutation error: "));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_alpn_display() {
        let err = ProbeError::Alpn {
            negotiated: Some(b"http/1.1".to_vec()),
        };
        assert_eq!(err.to_string(), "peer negotiated \"http/1.1\" instead of h2");
        assert!(err.source().is_none());
        let err = ProbeError::Alpn { negotiated: None };
        assert_eq!(err.to_string(), "peer did not negotiate a protocol over ALPN");
    }
}
