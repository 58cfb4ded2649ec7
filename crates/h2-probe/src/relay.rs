//! Relay mode: forward a client's connection to an upstream server, rewriting
//! one direction and observing the other.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use h2mangle::{ConnectionContext, MutationRule};

use crate::config::{Direction, RelayArgs};
use crate::error::ProbeError;
use crate::io::{IoEvent, Observations};
use crate::report::ProbeReport;
use crate::tls;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Pass `data` on to `dst`, rewriting it when this is the mutated direction.
async fn forward<W>(
    context: &mut ConnectionContext,
    observations: &mut Observations,
    rewrite: bool,
    data: &[u8],
    dst: &mut W,
) -> Result<(), ProbeError>
where
    W: AsyncWrite + Unpin,
{
    if rewrite {
        let out = context.outbound(data)?;
        for record in context.drain_mutations() {
            info!(
                index = record.index,
                offset = record.offset,
                "rewrote {} into {}",
                record.original,
                record.replacement
            );
            observations.push(IoEvent::Mutated(record));
        }
        dst.write_all(&out).await?;
    } else {
        match context.inbound(data) {
            Ok(events) => {
                for event in events {
                    debug!("observed: {event}");
                    observations.push(IoEvent::Protocol(event));
                }
            },
            Err(e) => warn!("stopped observing relayed traffic: {e}"),
        }
        dst.write_all(data).await?;
    }
    dst.flush().await?;
    Ok(())
}

/// Relay between `client` and `upstream` until either side closes or `wait`
/// elapses.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    mut context: ConnectionContext,
    direction: Direction,
    wait: Duration,
) -> Result<Observations, ProbeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);
    let mut client_buf = vec![0u8; READ_BUFFER_SIZE];
    let mut upstream_buf = vec![0u8; READ_BUFFER_SIZE];
    let mut observations = Observations::default();

    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            read = client_rd.read(&mut client_buf) => {
                let n = read?;
                if n == 0 {
                    debug!("client closed");
                    break;
                }
                let rewrite = direction == Direction::ToUpstream;
                forward(&mut context, &mut observations, rewrite, &client_buf[..n], &mut upstream_wr).await?;
            },
            read = upstream_rd.read(&mut upstream_buf) => {
                let n = read?;
                if n == 0 {
                    debug!("upstream closed");
                    break;
                }
                let rewrite = direction == Direction::ToClient;
                forward(&mut context, &mut observations, rewrite, &upstream_buf[..n], &mut client_wr).await?;
            },
            () = &mut deadline => {
                warn!("relay still open after {wait:?}");
                break;
            },
        }
    }

    // Best effort; either side may already be gone
    let _ = upstream_wr.shutdown().await;
    let _ = client_wr.shutdown().await;
    Ok(observations)
}

struct Upstream {
    host: String,
    port: u16,
    /// `None` for plain TCP
    tls:  Option<Arc<rustls::ClientConfig>>,
}

async fn relay_to_upstream<C>(
    client: C,
    upstream: &Upstream,
    context: ConnectionContext,
    direction: Direction,
    wait: Duration,
) -> Result<Observations, ProbeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let tcp = TcpStream::connect((upstream.host.as_str(), upstream.port)).await?;
    match &upstream.tls {
        Some(config) => {
            let stream = tls::connect(config.clone(), &upstream.host, tcp).await?;
            relay(client, stream, context, direction, wait).await
        },
        None => relay(client, tcp, context, direction, wait).await,
    }
}

async fn handle(
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    upstream: Arc<Upstream>,
    rule: MutationRule,
    direction: Direction,
    wait: Duration,
) -> Result<ProbeReport, ProbeError> {
    let description = rule.to_string();
    let context = ConnectionContext::new(rule);
    let observations = match acceptor {
        Some(acceptor) => {
            let stream = tls::accept(&acceptor, tcp).await?;
            relay_to_upstream(stream, &upstream, context, direction, wait).await?
        },
        None => relay_to_upstream(tcp, &upstream, context, direction, wait).await?,
    };

    info!("{peer} -> {}:{}: {}", upstream.host, upstream.port, observations.verdict());
    let target = format!("{}:{}", upstream.host, upstream.port);
    Ok(ProbeReport::new("relay", target, description, &observations))
}

/// Run relay mode from the command line. Without `--once` this only returns
/// on a listener error.
pub async fn run(args: &RelayArgs) -> Result<ProbeReport, ProbeError> {
    let rule = args.rule.build(args.rule_defaults())?;
    let (host, port) = args.upstream_addr()?;
    let upstream = Arc::new(Upstream {
        host,
        port,
        tls: if args.upstream_plaintext {
            None
        } else {
            Some(tls::client_config(args.ca_file.as_deref())?)
        },
    });
    let acceptor = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => Some(TlsAcceptor::from(tls::server_config(cert, key)?)),
        _ => None,
    };
    let wait = args.output.timeout();

    let listener = TcpListener::bind(args.listen).await?;
    info!(
        "relaying {} to {}:{} ({:?}) with {rule}",
        listener.local_addr()?,
        upstream.host,
        upstream.port,
        args.direction
    );

    loop {
        let (tcp, peer) = listener.accept().await?;
        debug!("accepted {peer}");

        let task = handle(
            tcp,
            peer,
            acceptor.clone(),
            upstream.clone(),
            rule.clone(),
            args.direction,
            wait,
        );
        if args.once {
            return task.await;
        }
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!("{peer}: {e}");
            }
        });
    }
}
