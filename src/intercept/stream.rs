//! Blocking connection handle.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::discard::DiscardPeer;
use super::guard::PolicyGuard;
use crate::capture::{ConnectionIdentity, Direction, Tap, TrafficLayer};

enum Inner {
    Tcp(TcpStream),
    Discard(Arc<DiscardPeer>),
}

/// Blocking stream returned by the interceptor.
///
/// Wraps a real `TcpStream`, or a simulated unresponsive peer for discarded
/// connections. Every read and write is reported to the traffic recorder.
pub struct SniffedStream {
    inner: Inner,
    tap: Option<Tap>,
    guard: Option<Arc<PolicyGuard>>,
}

impl SniffedStream {
    pub(crate) fn connected(stream: TcpStream, tap: Tap, guard: PolicyGuard) -> Self {
        Self {
            inner: Inner::Tcp(stream),
            tap: Some(tap),
            guard: Some(Arc::new(guard)),
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
    ///
    /// For discarded connections this is the literal address when the host
    /// was an IP, otherwise `NotConnected`.
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

    /// See `TcpStream::set_read_timeout`.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match &self.inner {
            Inner::Tcp(stream) => stream.set_read_timeout(timeout),
            Inner::Discard(peer) => peer.set_read_timeout(timeout),
        }
    }

    /// See `TcpStream::read_timeout`.
    pub fn read_timeout(&self) -> io::Result<Option<Duration>> {
        match &self.inner {
            Inner::Tcp(stream) => stream.read_timeout(),
            Inner::Discard(peer) => Ok(peer.read_timeout()),
        }
    }

    /// See `TcpStream::set_write_timeout`.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match &self.inner {
            Inner::Tcp(stream) => stream.set_write_timeout(timeout),
            Inner::Discard(peer) => peer.set_write_timeout(timeout),
        }
    }

    /// See `TcpStream::write_timeout`.
    pub fn write_timeout(&self) -> io::Result<Option<Duration>> {
        match &self.inner {
            Inner::Tcp(stream) => stream.write_timeout(),
            Inner::Discard(peer) => Ok(peer.write_timeout()),
        }
    }

    /// See `TcpStream::set_nodelay` (no-op for discarded connections).
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        match &self.inner {
            Inner::Tcp(stream) => stream.set_nodelay(nodelay),
            Inner::Discard(_) => Ok(()),
        }
    }

    /// See `TcpStream::shutdown`.
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match &self.inner {
            Inner::Tcp(stream) => stream.shutdown(how),
            Inner::Discard(peer) => {
                peer.shutdown(how);
                Ok(())
            }
        }
    }

    /// Another handle to the same connection, recording into the same log.
    pub fn try_clone(&self) -> io::Result<Self> {
        let inner = match &self.inner {
            Inner::Tcp(stream) => Inner::Tcp(stream.try_clone()?),
            Inner::Discard(peer) => Inner::Discard(Arc::clone(peer)),
        };
        Ok(Self {
            inner,
            tap: self.tap.clone(),
            guard: self.guard.clone(),
        })
    }

    fn record(&self, direction: Direction, bytes: &[u8], started: Instant) {
        if let Some(tap) = &self.tap {
            tap.record(TrafficLayer::Wire, direction, bytes, started.elapsed());
        }
    }
}

impl Read for SniffedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(guard) = &self.guard {
            guard.check()?;
        }
        let started = Instant::now();
        let n = match &mut self.inner {
            Inner::Tcp(stream) => stream.read(buf)?,
            Inner::Discard(peer) => peer.read_blocking(buf.len())?,
        };
        self.record(Direction::Received, &buf[..n], started);
        Ok(n)
    }
}

impl Write for SniffedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(guard) = &self.guard {
            guard.check()?;
            guard.inspect_outbound(buf)?;
        }
        let started = Instant::now();
        let n = match &mut self.inner {
            Inner::Tcp(stream) => stream.write(buf)?,
            Inner::Discard(peer) => peer.write(buf.len())?,
        };
        self.record(Direction::Sent, &buf[..n], started);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Inner::Tcp(stream) => stream.flush(),
            Inner::Discard(_) => Ok(()),
        }
    }
}

impl std::fmt::Debug for SniffedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniffedStream")
            .field("connection", &self.identity().map(|i| i.id()))
            .field("discarded", &self.is_discarded())
            .finish()
    }
}
