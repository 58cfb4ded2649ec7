//! Server mode: answer clients normally while oversizing one of our frames.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use h2::server;
use http::{Response, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use h2mangle::{ConnectionContext, MutationRule};

use crate::config::{RuleDefaults, ServeArgs};
use crate::error::ProbeError;
use crate::io::{InterceptIo, Observations};
use crate::report::ProbeReport;
use crate::tls;

/// What happened on one accepted connection.
#[derive(Debug)]
pub struct ServerOutcome {
    pub observations: Observations,
    pub requests:     usize,
    /// Error the connection ended with, if any
    pub error:        Option<h2::Error>,
}

/// Serve one connection over `io`, mutating our side with `context`.
pub async fn serve_connection<T>(
    io: T,
    context: ConnectionContext,
    body: Bytes,
    wait: Duration,
) -> Result<ServerOutcome, ProbeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let io = InterceptIo::new(io, context, tx);

    let mut requests = 0;
    let served = timeout(wait, async {
        let mut connection = server::handshake(io).await?;
        while let Some(accepted) = connection.accept().await {
            let (request, mut respond) = accepted?;
            requests += 1;
            info!("{} {}", request.method(), request.uri());

            let response = Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain")
                .body(())?;
            let mut send = respond.send_response(response, body.is_empty())?;
            if !body.is_empty() {
                send.send_data(body.clone(), true)?;
            }
        }
        Ok::<_, ProbeError>(())
    })
    .await;

    let error = match served {
        Ok(Ok(())) => None,
        Ok(Err(ProbeError::H2(e))) => {
            debug!("connection ended: {e}");
            Some(e)
        },
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            warn!("connection still open after {wait:?}");
            None
        },
    };

    let mut observations = Observations::default();
    observations.drain(&mut rx);
    Ok(ServerOutcome {
        observations,
        requests,
        error,
    })
}

async fn handle(
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    rule: MutationRule,
    body: Bytes,
    wait: Duration,
) -> Result<ProbeReport, ProbeError> {
    let description = rule.to_string();
    let context = ConnectionContext::new(rule);
    let outcome = match acceptor {
        Some(acceptor) => {
            let stream = tls::accept(&acceptor, tcp).await?;
            serve_connection(stream, context, body, wait).await?
        },
        None => serve_connection(tcp, context, body, wait).await?,
    };

    info!(
        requests = outcome.requests,
        "{peer}: {}",
        outcome.observations.verdict()
    );
    Ok(ProbeReport::new("serve", peer.to_string(), description, &outcome.observations)
        .with_error(outcome.error.as_ref()))
}

/// Run server mode from the command line. Without `--once` this only
/// returns on a listener error.
pub async fn run(args: &ServeArgs) -> Result<ProbeReport, ProbeError> {
    let rule = args.rule.build(RuleDefaults::SERVER)?;
    let acceptor = match (&args.cert, &args.key, args.plaintext) {
        (_, _, true) => None,
        (Some(cert), Some(key), false) => Some(TlsAcceptor::from(tls::server_config(cert, key)?)),
        _ => {
            return Err(ProbeError::InvalidArgument(
                "--cert and --key are required unless --plaintext is given".into(),
            ));
        },
    };
    let body = Bytes::from(args.body.clone().into_bytes());
    let wait = args.output.timeout();

    let listener = TcpListener::bind(args.listen).await?;
    info!("listening on {} with {rule}", listener.local_addr()?);

    loop {
        let (tcp, peer) = listener.accept().await?;
        debug!("accepted {peer}");

        let task = handle(tcp, peer, acceptor.clone(), rule.clone(), body.clone(), wait);
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
