//! TLS setup with ALPN `h2`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsAcceptor, TlsConnector, client, server};
use tracing::debug;

use crate::error::ProbeError;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProbeError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ProbeError::InvalidArgument(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProbeError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        ProbeError::InvalidArgument(format!("no private key found in {}", path.display()))
    })
}

/// Client configuration offering only `h2`, trusting `ca_file` or the web
/// PKI roots.
pub fn client_config(ca_file: Option<&Path>) -> Result<Arc<ClientConfig>, ProbeError> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            for cert in load_certs(path)? {
                roots.add(cert)?;
            }
        },
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(Arc::new(config))
}

/// Server configuration advertising `h2` and `http/1.1`; connections that
/// pick the latter are refused after the handshake.
pub fn server_config(cert: &Path, key: &Path) -> Result<Arc<ServerConfig>, ProbeError> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(cert)?, load_key(key)?)?;
    config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()];
    Ok(Arc::new(config))
}

fn require_h2(negotiated: Option<&[u8]>) -> Result<(), ProbeError> {
    match negotiated {
        Some(proto) if proto == ALPN_H2 => Ok(()),
        other => Err(ProbeError::Alpn {
            negotiated: other.map(<[u8]>::to_vec),
        }),
    }
}

/// Handshake as a client over `io` and insist on `h2`.
pub async fn connect<IO>(
    config: Arc<ClientConfig>,
    host: &str,
    io: IO,
) -> Result<client::TlsStream<IO>, ProbeError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let name = ServerName::try_from(host.to_string())
        .map_err(|e| ProbeError::InvalidArgument(format!("{host:?} is not a server name: {e}")))?;
    let stream = TlsConnector::from(config).connect(name, io).await?;
    require_h2(stream.get_ref().1.alpn_protocol())?;
    debug!("TLS established with {host}, ALPN h2");
    Ok(stream)
}

/// Handshake as a server over `io` and insist on `h2`.
pub async fn accept<IO>(
    acceptor: &TlsAcceptor,
    io: IO,
) -> Result<server::TlsStream<IO>, ProbeError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let stream = acceptor.accept(io).await?;
    require_h2(stream.get_ref().1.alpn_protocol())?;
    Ok(stream)
}
