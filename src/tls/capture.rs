//! Plaintext capture at the TLS boundary.
//!
//! [`PlaintextTap`] sits on the application side of a TLS stream. Bytes the
//! caller writes are recorded before encryption and bytes it reads are
//! recorded after decryption, on [`TrafficLayer::Plaintext`] of the
//! underlying connection. The tap never changes what is transmitted and
//! never fails the stream: without a recording handle it simply forwards.

use std::io::{self, Read, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use rustls::{ClientConnection, StreamOwned};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{trace, warn};

use crate::capture::{Direction, Tap, TrafficLayer};
use crate::intercept::{AsyncSniffedStream, SniffedStream};
use crate::telemetry::{AuditEvent, AuditLogger};

/// A stream that can expose the recording handle of its connection.
pub trait Tapped {
    /// Recording handle, if the connection is being captured.
    fn tap(&self) -> Option<&Tap>;
}

impl Tapped for SniffedStream {
    fn tap(&self) -> Option<&Tap> {
        SniffedStream::tap(self)
    }
}

impl Tapped for AsyncSniffedStream {
    fn tap(&self) -> Option<&Tap> {
        AsyncSniffedStream::tap(self)
    }
}

impl<S: Read + Write + Tapped> Tapped for StreamOwned<ClientConnection, S> {
    fn tap(&self) -> Option<&Tap> {
        self.sock.tap()
    }
}

impl<S: Tapped> Tapped for tokio_rustls::client::TlsStream<S> {
    fn tap(&self) -> Option<&Tap> {
        self.get_ref().0.tap()
    }
}

impl<T: Tapped + ?Sized> Tapped for &mut T {
    fn tap(&self) -> Option<&Tap> {
        (**self).tap()
    }
}

/// Attaches plaintext capture to TLS streams.
#[derive(Clone)]
pub struct TlsCaptureAdapter {
    audit: Arc<AuditLogger>,
}

impl TlsCaptureAdapter {
    /// Adapter reporting attachment failures through `audit`.
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        Self { audit }
    }

    /// Wrap a TLS stream so its plaintext is recorded.
    ///
    /// When the transport under the TLS layer is not being captured the
    /// failure is logged and audited, and the stream is returned wrapped
    /// but unrecorded.
    pub fn attach<S: Tapped>(&self, stream: S) -> PlaintextTap<S> {
        let tap = stream.tap().cloned();
        if tap.is_none() {
            let reason = "transport below the TLS layer is not intercepted".to_string();
            warn!("Plaintext capture not attached: {}", reason);
            self.audit.log(AuditEvent::CaptureAttachFailure { reason });
        }
        PlaintextTap::new(stream, tap)
    }
}

impl std::fmt::Debug for TlsCaptureAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsCaptureAdapter").finish_non_exhaustive()
    }
}

/// Stream wrapper recording application bytes on the plaintext layer.
pub struct PlaintextTap<S> {
    inner: S,
    tap: Option<Tap>,
}

impl<S> PlaintextTap<S> {
    /// Wrap `inner`, recording into `tap` when given.
    pub fn new(inner: S, tap: Option<Tap>) -> Self {
        Self { inner, tap }
    }

    /// Whether plaintext is being recorded.
    pub fn is_attached(&self) -> bool {
        self.tap.is_some()
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// The wrapped stream, mutably. Bytes moved through it directly are not
    /// recorded.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap the stream.
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn record(&self, direction: Direction, bytes: &[u8], started: Instant) {
        if let Some(tap) = &self.tap {
            trace!("{} plaintext {:?} {} bytes", tap.identity().id(), direction, bytes.len());
            tap.record(TrafficLayer::Plaintext, direction, bytes, started.elapsed());
        }
    }
}

impl<S> Tapped for PlaintextTap<S> {
    fn tap(&self) -> Option<&Tap> {
        self.tap.as_ref()
    }
}

impl<S: Read> Read for PlaintextTap<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let started = Instant::now();
        let n = self.inner.read(buf)?;
        self.record(Direction::Received, &buf[..n], started);
        Ok(n)
    }
}

impl<S: Write> Write for PlaintextTap<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let started = Instant::now();
        let n = self.inner.write(buf)?;
        self.record(Direction::Sent, &buf[..n], started);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PlaintextTap<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let started = Instant::now();
        let filled = buf.filled().len();

        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            this.record(Direction::Received, &buf.filled()[filled..], started);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PlaintextTap<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let started = Instant::now();

        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.record(Direction::Sent, &buf[..*n], started);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S> std::fmt::Debug for PlaintextTap<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaintextTap")
            .field("connection", &self.tap.as_ref().map(|t| t.identity().id()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{RemoteEndpoint, TraceAttributor, TrafficQuery, TrafficRecorder, TransportKind};
    use std::io::Cursor;

    fn tap(recorder: &Arc<TrafficRecorder>) -> Tap {
        recorder.open_connection(
            RemoteEndpoint::new("secure.local", 443, None),
            None,
            TransportKind::Blocking,
            TraceAttributor::default().capture_context(),
            false,
        )
    }

    #[test]
    fn test_plaintext_recorded_on_its_own_layer() {
        let recorder = Arc::new(TrafficRecorder::new());
        let session = recorder.start_session();

        let mut stream = PlaintextTap::new(Cursor::new(b"HTTP/1.1 200 OK".to_vec()), Some(tap(&recorder)));
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"HTTP/1.1 200 OK");

        let plaintext = session.captured_traffic(&TrafficQuery::new().plaintext());
        assert_eq!(plaintext.packet_count(), 1);
        let wire = session.captured_traffic(&TrafficQuery::new());
        assert_eq!(wire.packet_count(), 0);
    }

    #[test]
    fn test_attach_failure_fails_open() {
        let audit = Arc::new(AuditLogger::new_in_memory());
        let adapter = TlsCaptureAdapter::new(Arc::clone(&audit));

        struct Untapped(Vec<u8>);
        impl Tapped for Untapped {
            fn tap(&self) -> Option<&Tap> {
                None
            }
        }
        impl Write for Untapped {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.write(buf)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut stream = adapter.attach(Untapped(Vec::new()));
        assert!(!stream.is_attached());
        stream.write_all(b"still works").unwrap();
        assert_eq!(stream.get_ref().0, b"still works");

        let events = audit.recorded();
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("capture_attach_failure"));
    }

    #[tokio::test]
    async fn test_async_write_recorded() {
        use tokio::io::AsyncWriteExt;

        let recorder = Arc::new(TrafficRecorder::new());
        let session = recorder.start_session();

        let mut stream = PlaintextTap::new(Vec::<u8>::new(), Some(tap(&recorder)));
        AsyncWriteExt::write_all(&mut stream, b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let traffic = session.captured_traffic(&TrafficQuery::new().plaintext());
        let bucket = traffic.iter().next().unwrap();
        assert_eq!(bucket.packets[0].payload().as_ref(), b"GET / HTTP/1.1\r\n\r\n");
        assert!(bucket.packets[0].is_sent());
    }
}
