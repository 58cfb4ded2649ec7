//! I/O adapter placing a [`ConnectionContext`] between an HTTP/2 engine and
//! its transport.
//!
//! Everything the engine writes is re-framed and mutated before it reaches
//! the socket. Everything read from the socket is handed to the engine
//! untouched and observed on the side. Observations are published on an
//! unbounded channel because the poll methods cannot await.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use h2mangle::{ConnectionContext, MangleError, MutationRecord, ProtocolEvent, Verdict};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Something the adapter saw on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoEvent {
    /// A frame we sent was rewritten
    Mutated(MutationRecord),
    /// The peer did something
    Protocol(ProtocolEvent),
}

/// Wrapper around a transport that mutates outgoing frames
pub struct InterceptIo<T> {
    inner:   T,
    context: ConnectionContext,
    /// Mutated bytes accepted from the engine but not yet written
    pending: Bytes,
    events:  mpsc::UnboundedSender<IoEvent>,
}

impl<T> InterceptIo<T> {
    pub fn new(inner: T, context: ConnectionContext, events: mpsc::UnboundedSender<IoEvent>) -> Self {
        Self {
            inner,
            context,
            pending: Bytes::new(),
            events,
        }
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    fn publish_mutations(&mut self) {
        for record in self.context.drain_mutations() {
            info!(
                index = record.index,
                offset = record.offset,
                "rewrote {} into {}",
                record.original,
                record.replacement
            );
            // Receiver gone means nobody is listening any more
            let _ = self.events.send(IoEvent::Mutated(record));
        }
    }

    fn observe_inbound(&mut self, data: &[u8]) {
        match self.context.inbound(data) {
            Ok(events) => {
                for event in events {
                    debug!("peer: {event}");
                    let _ = self.events.send(IoEvent::Protocol(event));
                }
            },
            Err(e) => warn!("stopped observing inbound traffic: {e}"),
        }
    }
}

fn mangle_to_io(e: MangleError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl<T: AsyncWrite + Unpin> InterceptIo<T> {
    /// Write out everything still pending.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for InterceptIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let after = buf.filled().len();
        if after > before {
            this.observe_inbound(&buf.filled()[before..after]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for InterceptIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // The previous write must be on the wire before accepting more
        ready!(this.poll_drain(cx))?;

        this.pending = this.context.outbound(buf).map_err(mangle_to_io)?;
        this.publish_mutations();

        // Opportunistic; anything left goes out on the next write or flush
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Everything seen on one connection.
#[derive(Debug, Default)]
pub struct Observations {
    pub mutations: Vec<MutationRecord>,
    pub events:    Vec<ProtocolEvent>,
}

impl Observations {
    /// Take whatever has been published so far without waiting.
    pub fn drain(&mut self, rx: &mut mpsc::UnboundedReceiver<IoEvent>) {
        while let Ok(event) = rx.try_recv() {
            self.push(event);
        }
    }

    pub fn push(&mut self, event: IoEvent) {
        match event {
            IoEvent::Mutated(record) => self.mutations.push(record),
            IoEvent::Protocol(event) => self.events.push(event),
        }
    }

    pub fn verdict(&self) -> Verdict {
        Verdict::from_events(&self.events, self.mutations.len())
    }
}
