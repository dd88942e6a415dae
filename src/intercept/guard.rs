//! Policy enforcement on established connections.
//!
//! A connection allowed at connect time is re-evaluated on its next read or
//! write whenever the registry changed since the last check. Closing its
//! address makes further I/O fail with a policy refusal; opening it again
//! lets I/O resume. The common path is a single atomic load.
//!
//! The re-check matches the host the caller asked for, never the peer IP,
//! so it decides on the same key the connect-time check used.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use super::error::InterceptError;
use super::proxy::parse_connect_request;
use crate::capture::RemoteEndpoint;
use crate::policy::{display_address, resolve_in, Decision, PolicyRegistry};
use crate::telemetry::{AuditEvent, AuditLogger, BlockReason};

pub(crate) struct PolicyGuard {
    registry: Arc<PolicyRegistry>,
    audit: Arc<AuditLogger>,
    host: String,
    port: u16,
    address: String,
    seen_generation: AtomicU64,
    closed: AtomicBool,
    inspect_connect: bool,
    inspected: AtomicBool,
    proxied: OnceLock<(String, u16)>,
}

impl PolicyGuard {
    pub(crate) fn new(
        registry: Arc<PolicyRegistry>,
        audit: Arc<AuditLogger>,
        remote: &RemoteEndpoint,
        generation: u64,
        inspect_connect: bool,
    ) -> Self {
        Self {
            registry,
            audit,
            host: remote.host().to_string(),
            port: remote.port(),
            address: remote.to_string(),
            seen_generation: AtomicU64::new(generation),
            closed: AtomicBool::new(false),
            inspect_connect,
            inspected: AtomicBool::new(false),
            proxied: OnceLock::new(),
        }
    }

    /// Fail if the connection's address (or proxied target) is now closed.
    pub(crate) fn check(&self) -> io::Result<()> {
        let generation = self.registry.generation();
        if generation != self.seen_generation.load(Ordering::Acquire) {
            self.reevaluate();
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(InterceptError::refusal(self.address.clone()).into());
        }
        Ok(())
    }

    /// Look for a CONNECT request in the first bytes written.
    pub(crate) fn inspect_outbound(&self, buf: &[u8]) -> io::Result<()> {
        if !self.inspect_connect || buf.is_empty() || self.inspected.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some((host, port)) = parse_connect_request(buf) else {
            return Ok(());
        };

        let target = display_address(&host, port);
        debug!("{} tunnels to {}", self.address, target);
        let decision = resolve_in(&self.registry.snapshot(), &[host.as_str()], port).decision;
        let _ = self.proxied.set((host, port));

        if decision == Decision::Closed {
            warn!("Proxied connection to {} refused by policy", target);
            self.audit.log(AuditEvent::ConnectionRefuse {
                address: target.clone(),
                reason: BlockReason::ProxiedTarget,
            });
            return Err(InterceptError::refusal(target).into());
        }
        Ok(())
    }

    pub(crate) fn proxied_target(&self) -> Option<&(String, u16)> {
        self.proxied.get()
    }

    fn reevaluate(&self) {
        let snapshot = self.registry.snapshot();
        let mut closed =
            resolve_in(&snapshot, &[self.host.as_str()], self.port).decision == Decision::Closed;
        if let Some((host, port)) = self.proxied.get() {
            closed |= resolve_in(&snapshot, &[host.as_str()], *port).decision == Decision::Closed;
        }

        let was_closed = self.closed.swap(closed, Ordering::AcqRel);
        self.seen_generation
            .store(snapshot.generation(), Ordering::Release);

        if closed && !was_closed {
            warn!("Established connection to {} closed by policy", self.address);
            self.audit.log(AuditEvent::ConnectionRefuse {
                address: self.address.clone(),
                reason: BlockReason::LiveRecheck,
            });
        } else if !closed && was_closed {
            debug!("Established connection to {} reopened by policy", self.address);
        }
    }
}
