//! Client mode: send a GET with a small body and oversize part of it.

use bytes::Bytes;
use h2::client;
use http::{Method, Request};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use h2mangle::ConnectionContext;

use crate::config::{ClientArgs, RuleDefaults};
use crate::error::ProbeError;
use crate::io::{InterceptIo, Observations};
use crate::report::ProbeReport;
use crate::tls;

/// The request the client sends.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub scheme:            &'static str,
    pub authority:         String,
    pub path:              String,
    pub body:              Bytes,
    pub header_table_size: Option<u32>,
}

/// What came back.
#[derive(Debug)]
pub struct ClientOutcome {
    pub observations: Observations,
    /// Status of the response, if one completed
    pub status:       Option<u16>,
    /// Error the connection or stream ended with, if any
    pub error:        Option<h2::Error>,
}

/// Drive one request over `io`, mutating our side with `context`.
pub async fn probe<T>(
    io: T,
    context: ConnectionContext,
    request: &ClientRequest,
    wait: std::time::Duration,
) -> Result<ClientOutcome, ProbeError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let io = InterceptIo::new(io, context, tx);

    let mut builder = client::Builder::new();
    if let Some(size) = request.header_table_size {
        builder.header_table_size(size);
    }
    let (send_request, connection) = builder.handshake::<_, Bytes>(io).await?;
    let connection = tokio::spawn(connection);

    let uri = format!("{}://{}{}", request.scheme, request.authority, request.path);
    let req = Request::builder().method(Method::GET).uri(uri).body(())?;
    let outcome = timeout(wait, exchange(send_request, req, request.body.clone())).await;
    let (status, mut error) = match outcome {
        Ok(Ok(status)) => (Some(status), None),
        Ok(Err(e)) => (None, Some(e)),
        Err(_) => {
            warn!("no response after {wait:?}");
            (None, None)
        },
    };

    // The connection task holds the adapter; give it a moment to take in the
    // peer's last frames before reading what was observed
    match timeout(wait, connection).await {
        Ok(Ok(Err(e))) => {
            debug!("connection ended: {e}");
            error.get_or_insert(e);
        },
        Ok(Ok(Ok(()))) => {},
        Ok(Err(join)) => warn!("connection task failed: {join}"),
        Err(_) => debug!("connection still open after response"),
    }

    let mut observations = Observations::default();
    observations.drain(&mut rx);
    Ok(ClientOutcome {
        observations,
        status,
        error,
    })
}

async fn exchange(
    send_request: client::SendRequest<Bytes>,
    req: Request<()>,
    body: Bytes,
) -> Result<u16, h2::Error> {
    let mut send_request = send_request.ready().await?;

    let end_of_stream = body.is_empty();
    let (response, mut stream) = send_request.send_request(req, end_of_stream)?;
    if !end_of_stream {
        stream.send_data(body, true)?;
    }

    let response = response.await?;
    let status = response.status().as_u16();
    info!("response status {status}");

    let mut body = response.into_body();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        debug!("received {} body bytes", chunk.len());
        let _ = body.flow_control().release_capacity(chunk.len());
    }
    Ok(status)
}

/// Run client mode from the command line.
pub async fn run(args: &ClientArgs) -> Result<ProbeReport, ProbeError> {
    let rule = args.rule.build(RuleDefaults::CLIENT)?;
    let description = rule.to_string();
    let context = ConnectionContext::new(rule);
    let request = ClientRequest {
        scheme:            if args.plaintext { "http" } else { "https" },
        authority:         args.authority.clone(),
        path:              args.path.clone(),
        body:              Bytes::from(args.body.clone().into_bytes()),
        header_table_size: args.header_table_size,
    };
    let target = format!("{}:{}", args.authority, args.port);
    info!("probing {target} with {description}");

    let tcp = TcpStream::connect((args.authority.as_str(), args.port)).await?;
    let outcome = if args.plaintext {
        probe(tcp, context, &request, args.output.timeout()).await?
    } else {
        let config = tls::client_config(args.ca_file.as_deref())?;
        let stream = tls::connect(config, &args.authority, tcp).await?;
        probe(stream, context, &request, args.output.timeout()).await?
    };

    Ok(ProbeReport::new("client", target, description, &outcome.observations)
        .with_status(outcome.status)
        .with_error(outcome.error.as_ref()))
}
