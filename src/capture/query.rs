//! Capture queries.
//!
//! # Address filters
//!
//! - `*` matches every connection
//! - `db.local`, `db.local:5432`, `db.local:*`, `10.0.0.5:5432`, `[::1]:8080`
//! - `*.example.com[:port]` matches subdomains of `example.com` (not
//!   `example.com` itself)
//!
//! Hosts are compared case-insensitively against both the requested host and
//! the resolved IP of a connection.

use std::fmt;
use std::str::FromStr;

use super::grouping::GroupingOptions;
use super::identity::RemoteEndpoint;
use super::packet::{NetworkPacket, TrafficLayer};
use crate::policy::{AddressPattern, PolicyError, PolicyResult, PortPattern};

/// Which threads' I/O to include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadScope {
    /// Only packets read or written by the calling thread.
    Current,
    /// Packets from every thread.
    #[default]
    Any,
}

impl ThreadScope {
    /// Whether a packet is in scope for the calling thread.
    pub fn includes(&self, packet: &NetworkPacket) -> bool {
        match self {
            ThreadScope::Any => true,
            ThreadScope::Current => packet.thread().is_current(),
        }
    }
}

/// Filter on the remote endpoint of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AddressFilter {
    /// Every connection.
    #[default]
    Any,
    /// Exact host and/or port pattern.
    Pattern(AddressPattern),
    /// Subdomains of a suffix (`*.example.com`), optionally with a port.
    Subdomain {
        /// Lowercase suffix without the `*.` prefix.
        suffix: String,
        /// Port half.
        port: PortPattern,
    },
}

impl AddressFilter {
    /// Parse a filter expression.
    pub fn parse(input: &str) -> PolicyResult<Self> {
        let input = input.trim();
        if let Some(rest) = input.strip_prefix("*.") {
            let (suffix, port) = match rest.rsplit_once(':') {
                Some((suffix, port)) => (suffix, PortPattern::parse(port)?),
                None => (rest, PortPattern::Any),
            };
            if suffix.is_empty() {
                return Err(PolicyError::InvalidAddress(input.to_string()));
            }
            return Ok(AddressFilter::Subdomain {
                suffix: suffix.to_ascii_lowercase(),
                port,
            });
        }

        let pattern = AddressPattern::parse(input)?;
        if pattern == AddressPattern::any() {
            Ok(AddressFilter::Any)
        } else {
            Ok(AddressFilter::Pattern(pattern))
        }
    }

    /// Whether a remote endpoint passes the filter.
    pub fn matches(&self, remote: &RemoteEndpoint) -> bool {
        match self {
            AddressFilter::Any => true,
            AddressFilter::Pattern(pattern) => remote
                .host_candidates()
                .iter()
                .any(|host| pattern.matches(host, remote.port())),
            AddressFilter::Subdomain { suffix, port } => {
                port.matches(remote.port()) && matches_wildcard(suffix, remote.host())
            }
        }
    }
}

impl FromStr for AddressFilter {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AddressFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFilter::Any => write!(f, "*"),
            AddressFilter::Pattern(pattern) => write!(f, "{}", pattern),
            AddressFilter::Subdomain { suffix, port } => write!(f, "*.{}:{}", suffix, port),
        }
    }
}

/// Check if a domain is a strict subdomain of `suffix`.
///
/// `api.example.com` matches `example.com`; `example.com` itself and
/// `notexample.com` do not.
fn matches_wildcard(suffix: &str, domain: &str) -> bool {
    if domain.ends_with(suffix) {
        let prefix_len = domain.len() - suffix.len();
        prefix_len > 0 && domain.as_bytes().get(prefix_len - 1) == Some(&b'.')
    } else {
        false
    }
}

/// What to retrieve from a capture and how to group it.
#[derive(Debug, Clone, Default)]
pub struct TrafficQuery {
    /// Thread scope.
    pub thread_scope: ThreadScope,
    /// Remote endpoint filter.
    pub address: AddressFilter,
    /// Grouping dimensions.
    pub grouping: GroupingOptions,
    /// Capture layer.
    pub layer: TrafficLayer,
}

impl TrafficQuery {
    /// Every wire-level packet, fully collapsed grouping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the calling thread.
    pub fn current_thread(mut self) -> Self {
        self.thread_scope = ThreadScope::Current;
        self
    }

    /// Restrict to matching remote endpoints.
    pub fn address(mut self, address: AddressFilter) -> Self {
        self.address = address;
        self
    }

    /// Set grouping dimensions.
    pub fn grouping(mut self, grouping: GroupingOptions) -> Self {
        self.grouping = grouping;
        self
    }

    /// Select the capture layer.
    pub fn layer(mut self, layer: TrafficLayer) -> Self {
        self.layer = layer;
        self
    }

    /// Select the plaintext (TLS boundary) layer.
    pub fn plaintext(self) -> Self {
        self.layer(TrafficLayer::Plaintext)
    }
}
