//! Tracking of connection attempts suspended by a DELAY decision.
//!
//! Each delayed attempt holds a [`DelayTicket`] for the duration of its
//! wait. The ticket lists the attempt in [`DelayedAttempts`] so it can be
//! inspected or cancelled from another thread; dropping the ticket (because
//! the wait finished or the async attempt was dropped) removes it.
//!
//! # Example
//!
//! ```ignore
//! use wiretap::intercept::DelayedAttempts;
//!
//! let delays = wiretap.interceptor().delayed_attempts();
//! for pending in delays.list_pending() {
//!     println!("{} waiting {:?} of {:?}", pending.address, pending.waited, pending.delay);
//! }
//! delays.cancel_all();
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::sync::lock;

/// How a delay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayOutcome {
    /// The full delay elapsed.
    Elapsed,
    /// The caller's deadline came first.
    DeadlineReached,
    /// Cancelled through [`DelayedAttempts::cancel`].
    Cancelled,
}

#[derive(Default)]
struct CancelSignal {
    cancelled: Mutex<bool>,
    condvar: Condvar,
    notify: Notify,
}

impl CancelSignal {
    fn cancel(&self) {
        *lock(&self.cancelled) = true;
        self.condvar.notify_all();
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        *lock(&self.cancelled)
    }
}

struct PendingDelay {
    address: String,
    delay: Duration,
    parked_at: Instant,
    signal: Arc<CancelSignal>,
}

/// Information about a delayed attempt.
#[derive(Debug, Clone)]
pub struct DelayInfo {
    /// Unique identifier.
    pub id: Uuid,
    /// Target address.
    pub address: String,
    /// Configured delay.
    pub delay: Duration,
    /// Time waited so far.
    pub waited: Duration,
}

/// Registry of attempts currently waiting out a delay.
#[derive(Default)]
pub struct DelayedAttempts {
    pending: Mutex<HashMap<Uuid, PendingDelay>>,
}

impl DelayedAttempts {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an attempt about to wait `delay`.
    pub fn park(self: &Arc<Self>, address: String, delay: Duration) -> DelayTicket {
        let id = Uuid::new_v4();
        let signal = Arc::new(CancelSignal::default());

        lock(&self.pending).insert(
            id,
            PendingDelay {
                address: address.clone(),
                delay,
                parked_at: Instant::now(),
                signal: Arc::clone(&signal),
            },
        );
        debug!("Delaying connection {} to {} by {:?}", id, address, delay);

        DelayTicket {
            id,
            delay,
            signal,
            owner: Arc::clone(self),
        }
    }

    /// Attempts currently waiting.
    pub fn list_pending(&self) -> Vec<DelayInfo> {
        lock(&self.pending)
            .iter()
            .map(|(id, p)| DelayInfo {
                id: *id,
                address: p.address.clone(),
                delay: p.delay,
                waited: p.parked_at.elapsed(),
            })
            .collect()
    }

    /// Number of attempts currently waiting.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Cancel one waiting attempt. Returns true if it was found.
    pub fn cancel(&self, id: Uuid) -> bool {
        let removed = lock(&self.pending).remove(&id);
        match removed {
            Some(pending) => {
                debug!("Cancelled delayed connection {} to {}", id, pending.address);
                pending.signal.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every waiting attempt, returning how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingDelay> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        for pending in &drained {
            pending.signal.cancel();
        }
        drained.len()
    }
}

/// A registered wait. Dropping it unregisters the attempt.
pub struct DelayTicket {
    id: Uuid,
    delay: Duration,
    signal: Arc<CancelSignal>,
    owner: Arc<DelayedAttempts>,
}

impl DelayTicket {
    /// Identifier of the attempt.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Block the calling thread for the delay, or until `deadline` or
    /// cancellation.
    pub fn wait_blocking(&self, deadline: Option<Instant>) -> DelayOutcome {
        let until = Instant::now() + self.delay;
        let (stop, at_deadline) = match deadline {
            Some(deadline) if deadline < until => (deadline, true),
            _ => (until, false),
        };

        let mut cancelled = lock(&self.signal.cancelled);
        loop {
            if *cancelled {
                return DelayOutcome::Cancelled;
            }
            let now = Instant::now();
            if now >= stop {
                return if at_deadline {
                    DelayOutcome::DeadlineReached
                } else {
                    DelayOutcome::Elapsed
                };
            }
            let (guard, _) = self
                .signal
                .condvar
                .wait_timeout(cancelled, stop - now)
                .unwrap_or_else(PoisonError::into_inner);
            cancelled = guard;
        }
    }

    /// Wait for the delay without blocking the runtime. Dropping the future
    /// abandons the wait.
    pub async fn wait(&self) -> DelayOutcome {
        let notified = self.signal.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.signal.is_cancelled() {
            return DelayOutcome::Cancelled;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.delay) => DelayOutcome::Elapsed,
            _ = notified => DelayOutcome::Cancelled,
        }
    }
}

impl Drop for DelayTicket {
    fn drop(&mut self) {
        lock(&self.owner.pending).remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_park_and_list() {
        let delays = Arc::new(DelayedAttempts::new());
        let _a = delays.park("a.local:80".into(), Duration::from_secs(5));
        let _b = delays.park("b.local:80".into(), Duration::from_secs(5));

        let pending = delays.list_pending();
        assert_eq!(pending.len(), 2);
        let addresses: Vec<&str> = pending.iter().map(|p| p.address.as_str()).collect();
        assert!(addresses.contains(&"a.local:80"));
        assert!(addresses.contains(&"b.local:80"));
    }

    #[test]
    fn test_ticket_drop_unregisters() {
        let delays = Arc::new(DelayedAttempts::new());
        let ticket = delays.park("a.local:80".into(), Duration::from_secs(5));
        assert_eq!(delays.pending_count(), 1);
        drop(ticket);
        assert_eq!(delays.pending_count(), 0);
    }

    #[test]
    fn test_wait_blocking_elapses() {
        let delays = Arc::new(DelayedAttempts::new());
        let ticket = delays.park("a.local:80".into(), Duration::from_millis(30));

        let start = Instant::now();
        assert_eq!(ticket.wait_blocking(None), DelayOutcome::Elapsed);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_blocking_deadline() {
        let delays = Arc::new(DelayedAttempts::new());
        let ticket = delays.park("a.local:80".into(), Duration::from_secs(30));

        let deadline = Instant::now() + Duration::from_millis(30);
        assert_eq!(
            ticket.wait_blocking(Some(deadline)),
            DelayOutcome::DeadlineReached
        );
    }

    #[test]
    fn test_cancel_wakes_blocking_waiter() {
        let delays = Arc::new(DelayedAttempts::new());
        let ticket = delays.park("a.local:80".into(), Duration::from_secs(30));
        let id = ticket.id();

        let waiter = thread::spawn(move || ticket.wait_blocking(None));
        thread::sleep(Duration::from_millis(30));
        assert!(delays.cancel(id));
        assert_eq!(waiter.join().unwrap(), DelayOutcome::Cancelled);
        assert!(!delays.cancel(id));
    }

    #[tokio::test]
    async fn test_async_wait_elapses() {
        let delays = Arc::new(DelayedAttempts::new());
        let ticket = delays.park("a.local:80".into(), Duration::from_millis(20));
        assert_eq!(ticket.wait().await, DelayOutcome::Elapsed);
    }

    #[tokio::test]
    async fn test_cancel_all_wakes_async_waiter() {
        let delays = Arc::new(DelayedAttempts::new());
        let ticket = delays.park("a.local:80".into(), Duration::from_secs(30));

        let waiter = tokio::spawn(async move { ticket.wait().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(delays.cancel_all(), 1);
        assert_eq!(waiter.await.unwrap(), DelayOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_before_wait() {
        let delays = Arc::new(DelayedAttempts::new());
        let ticket = delays.park("a.local:80".into(), Duration::from_secs(30));
        delays.cancel(ticket.id());
        assert_eq!(ticket.wait().await, DelayOutcome::Cancelled);
    }
}
