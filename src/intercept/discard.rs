//! Simulated unresponsive peer for discarded connections.
//!
//! Writes succeed and go nowhere. Reads never produce data and never report
//! end-of-stream; they wait like a read on a connection whose peer stopped
//! answering. Only a local shutdown of the read half releases a waiting
//! reader (with EOF), and a read timeout set by the caller makes reads fail
//! with `WouldBlock`, as on a real socket.

use std::io;
use std::net::Shutdown;
use std::sync::{Condvar, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::sync::lock;

#[derive(Default)]
struct DiscardFlags {
    read_closed: bool,
    write_closed: bool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    waker: Option<Waker>,
}

/// Shared state of one discarded connection (shared by its clones).
#[derive(Default)]
pub(crate) struct DiscardPeer {
    flags: Mutex<DiscardFlags>,
    readable: Condvar,
}

impl DiscardPeer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Blocking read of up to `len` bytes: waits until the read half is shut
    /// down or the read timeout elapses. An empty read returns at once.
    pub(crate) fn read_blocking(&self, len: usize) -> io::Result<usize> {
        if len == 0 {
            return Ok(0);
        }
        let mut flags = lock(&self.flags);
        let deadline = flags.read_timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if flags.read_closed {
                return Ok(0);
            }
            match deadline {
                None => {
                    flags = self
                        .readable
                        .wait(flags)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::WouldBlock,
                            "Resource temporarily unavailable",
                        ));
                    }
                    let (guard, _) = self
                        .readable
                        .wait_timeout(flags, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    flags = guard;
                }
            }
        }
    }

    /// Async read: pending until the read half is shut down.
    pub(crate) fn poll_read(&self, cx: &mut Context<'_>, remaining: usize) -> Poll<io::Result<()>> {
        let mut flags = lock(&self.flags);
        if remaining == 0 || flags.read_closed {
            return Poll::Ready(Ok(()));
        }
        flags.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Accept and drop `len` bytes.
    pub(crate) fn write(&self, len: usize) -> io::Result<usize> {
        if lock(&self.flags).write_closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write half has been shut down",
            ));
        }
        Ok(len)
    }

    pub(crate) fn shutdown(&self, how: Shutdown) {
        let waker = {
            let mut flags = lock(&self.flags);
            if matches!(how, Shutdown::Read | Shutdown::Both) {
                flags.read_closed = true;
            }
            if matches!(how, Shutdown::Write | Shutdown::Both) {
                flags.write_closed = true;
            }
            flags.waker.take()
        };
        self.readable.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        check_timeout(timeout)?;
        lock(&self.flags).read_timeout = timeout;
        Ok(())
    }

    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        lock(&self.flags).read_timeout
    }

    pub(crate) fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        check_timeout(timeout)?;
        lock(&self.flags).write_timeout = timeout;
        Ok(())
    }

    pub(crate) fn write_timeout(&self) -> Option<Duration> {
        lock(&self.flags).write_timeout
    }
}

/// Same rule as `TcpStream::set_read_timeout`: zero is rejected.
fn check_timeout(timeout: Option<Duration>) -> io::Result<()> {
    if timeout.is_some_and(|t| t.is_zero()) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "cannot set a 0 duration timeout",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_write_accepts_everything() {
        let peer = DiscardPeer::new();
        assert_eq!(peer.write(1024).unwrap(), 1024);
        peer.shutdown(Shutdown::Write);
        assert_eq!(peer.write(1).unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_read_times_out_without_data() {
        let peer = DiscardPeer::new();
        peer.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

        let start = Instant::now();
        let err = peer.read_blocking(8).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_shutdown_releases_blocked_reader() {
        let peer = Arc::new(DiscardPeer::new());
        let reader = {
            let peer = Arc::clone(&peer);
            thread::spawn(move || peer.read_blocking(8))
        };

        thread::sleep(Duration::from_millis(50));
        peer.shutdown(Shutdown::Read);
        assert_eq!(reader.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_empty_read_does_not_wait() {
        let peer = DiscardPeer::new();
        assert_eq!(peer.read_blocking(0).unwrap(), 0);

        let mut cx = Context::from_waker(Waker::noop());
        assert!(matches!(peer.poll_read(&mut cx, 0), Poll::Ready(Ok(()))));
        assert!(peer.poll_read(&mut cx, 8).is_pending());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let peer = DiscardPeer::new();
        assert!(peer.set_read_timeout(Some(Duration::ZERO)).is_err());
        assert!(peer.set_write_timeout(Some(Duration::ZERO)).is_err());
        peer.set_write_timeout(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(peer.write_timeout(), Some(Duration::from_secs(1)));
        assert_eq!(peer.read_timeout(), None);
    }
}
