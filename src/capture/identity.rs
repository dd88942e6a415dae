//! Connection identity.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use super::trace::{CallStack, ThreadMetadata, TraceContext};
use crate::policy::{display_address, normalize_host};

/// Sequence number identifying one connection within a recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// Numeric value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport style of the connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// `std::net` style blocking stream.
    Blocking,
    /// Tokio stream.
    Async,
}

/// Remote end of a connection: the host the caller asked for, the port, and
/// the socket address it resolved to (absent for discarded connections to
/// non-literal hosts).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteEndpoint {
    host: String,
    port: u16,
    addr: Option<SocketAddr>,
}

impl RemoteEndpoint {
    /// Create an endpoint; the host is normalized.
    pub fn new(host: &str, port: u16, addr: Option<SocketAddr>) -> Self {
        Self {
            host: normalize_host(host),
            port,
            addr,
        }
    }

    /// Requested host (normalized).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolved socket address.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Host strings this endpoint is known under: the requested host and,
    /// when different, the resolved IP.
    pub fn host_candidates(&self) -> Vec<String> {
        let mut hosts = vec![self.host.clone()];
        if let Some(addr) = self.addr {
            let ip = addr.ip().to_string();
            if ip != self.host {
                hosts.push(ip);
            }
        }
        hosts
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&display_address(&self.host, self.port))
    }
}

/// Immutable description of one logical connection.
///
/// Equality and hashing use the connection id only.
#[derive(Debug, Clone)]
pub struct ConnectionIdentity {
    id: ConnectionId,
    local: Option<SocketAddr>,
    remote: RemoteEndpoint,
    transport: TransportKind,
    opening_thread: ThreadMetadata,
    opening_stack: Option<CallStack>,
    opened_at: DateTime<Utc>,
    discarded: bool,
}

impl ConnectionIdentity {
    pub(crate) fn new(
        id: ConnectionId,
        local: Option<SocketAddr>,
        remote: RemoteEndpoint,
        transport: TransportKind,
        context: TraceContext,
        discarded: bool,
    ) -> Self {
        Self {
            id,
            local,
            remote,
            transport,
            opening_thread: context.thread,
            opening_stack: context.stack,
            opened_at: Utc::now(),
            discarded,
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Local socket address (absent for discarded connections).
    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Remote endpoint.
    pub fn remote(&self) -> &RemoteEndpoint {
        &self.remote
    }

    /// Transport style.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Thread that opened the connection.
    pub fn opening_thread(&self) -> &ThreadMetadata {
        &self.opening_thread
    }

    /// Call stack that opened the connection, if captured.
    pub fn opening_stack(&self) -> Option<&CallStack> {
        self.opening_stack.as_ref()
    }

    /// When the connection was established.
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Whether the peer is simulated (DISCARD policy).
    pub fn is_discarded(&self) -> bool {
        self.discarded
    }
}

impl PartialEq for ConnectionIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionIdentity {}

impl Hash for ConnectionIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.id, self.remote)?;
        if self.discarded {
            write!(f, " (discarded)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::trace::TraceAttributor;

    #[test]
    fn test_remote_endpoint_candidates() {
        let addr: SocketAddr = "10.0.0.5:5432".parse().unwrap();
        let remote = RemoteEndpoint::new("DB.local", 5432, Some(addr));
        assert_eq!(remote.host(), "db.local");
        assert_eq!(remote.host_candidates(), vec!["db.local", "10.0.0.5"]);

        let literal = RemoteEndpoint::new("10.0.0.5", 5432, Some(addr));
        assert_eq!(literal.host_candidates(), vec!["10.0.0.5"]);
        assert_eq!(literal.to_string(), "10.0.0.5:5432");
    }

    #[test]
    fn test_identity_equality_by_id() {
        let context = TraceAttributor::new(false).capture_context();
        let remote = RemoteEndpoint::new("a.local", 80, None);
        let a = ConnectionIdentity::new(
            ConnectionId::new(1),
            None,
            remote.clone(),
            TransportKind::Blocking,
            context.clone(),
            true,
        );
        let b = ConnectionIdentity::new(
            ConnectionId::new(2),
            None,
            remote,
            TransportKind::Blocking,
            context,
            true,
        );
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(a.to_string(), "#1 -> a.local:80 (discarded)");
    }
}
