//! Async connection handle.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use super::discard::DiscardPeer;
use super::guard::PolicyGuard;
use crate::capture::{ConnectionIdentity, Direction, Tap, TrafficLayer};

enum Inner {
    Tcp(TcpStream),
    Discard(Arc<DiscardPeer>),
}

/// Tokio stream returned by the interceptor.
///
/// Discarded connections never become readable: `poll_read` stays pending
/// until the handle is shut down.
pub struct AsyncSniffedStream {
    inner: Inner,
    tap: Option<Tap>,
    guard: Option<PolicyGuard>,
}

impl AsyncSniffedStream {
    pub(crate) fn connected(stream: TcpStream, tap: Tap, guard: PolicyGuard) -> Self {
        Self {
            inner: Inner::Tcp(stream),
            tap: Some(tap),
            guard: Some(guard),
        }
    }

    pub(crate) fn discarded(tap: Tap) -> Self {
        Self {
            inner: Inner::Discard(Arc::new(DiscardPeer::new())),
            tap: Some(tap),
            guard: None,
        }
    }

    pub(crate) fn passthrough(stream: TcpStream) -> Self {
        Self {
            inner: Inner::Tcp(stream),
            tap: None,
            guard: None,
        }
    }

    /// Identity of the connection; `None` when it bypassed interception.
    pub fn identity(&self) -> Option<&Arc<ConnectionIdentity>> {
        self.tap.as_ref().map(Tap::identity)
    }

    /// Recording handle, if the connection is intercepted.
    pub fn tap(&self) -> Option<&Tap> {
        self.tap.as_ref()
    }

    /// Whether the peer is simulated.
    pub fn is_discarded(&self) -> bool {
        matches!(self.inner, Inner::Discard(_))
    }

    /// Destination of an HTTP CONNECT request sent on this connection.
    pub fn proxied_target(&self) -> Option<&(String, u16)> {
        self.guard.as_ref().and_then(|g| g.proxied_target())
    }

    /// Remote socket address.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match &self.inner {
            Inner::Tcp(stream) => stream.peer_addr(),
            Inner::Discard(_) => self
                .identity()
                .and_then(|identity| identity.remote().addr())
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Local socket address (unspecified for discarded connections).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.inner {
            Inner::Tcp(stream) => stream.local_addr(),
            Inner::Discard(_) => Ok(SocketAddr::from(([0, 0, 0, 0], 0))),
        }
    }

    /// See `TcpStream::set_nodelay` (no-op for discarded connections).
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        match &self.inner {
            Inner::Tcp(stream) => stream.set_nodelay(nodelay),
            Inner::Discard(_) => Ok(()),
        }
    }

    fn record(&self, direction: Direction, bytes: &[u8], started: Instant) {
        if let Some(tap) = &self.tap {
            tap.record(TrafficLayer::Wire, direction, bytes, started.elapsed());
        }
    }
}

impl AsyncRead for AsyncSniffedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(guard) = &this.guard
            && let Err(e) = guard.check()
        {
            return Poll::Ready(Err(e));
        }

        let started = Instant::now();
        let filled = buf.filled().len();
        let poll = match &mut this.inner {
            Inner::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Inner::Discard(peer) => peer.poll_read(cx, buf.remaining()),
        };

        if let Poll::Ready(Ok(())) = &poll {
            this.record(Direction::Received, &buf.filled()[filled..], started);
        }
        poll
    }
}

impl AsyncWrite for AsyncSniffedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(guard) = &this.guard
            && let Err(e) = guard.check().and_then(|()| guard.inspect_outbound(buf))
        {
            return Poll::Ready(Err(e));
        }

        let started = Instant::now();
        let poll = match &mut this.inner {
            Inner::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Inner::Discard(peer) => Poll::Ready(peer.write(buf.len())),
        };

        if let Poll::Ready(Ok(n)) = &poll {
            this.record(Direction::Sent, &buf[..*n], started);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            Inner::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Inner::Discard(_) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            Inner::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Inner::Discard(peer) => {
                peer.shutdown(Shutdown::Write);
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl Drop for AsyncSniffedStream {
    fn drop(&mut self) {
        if let Inner::Discard(peer) = &self.inner {
            peer.shutdown(Shutdown::Both);
        }
    }
}

impl std::fmt::Debug for AsyncSniffedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSniffedStream")
            .field("connection", &self.identity().map(|i| i.id()))
            .field("discarded", &self.is_discarded())
            .finish()
    }
}
