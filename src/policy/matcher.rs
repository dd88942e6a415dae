//! Resolution of a concrete address to a policy decision.
//!
//! # Precedence
//!
//! 1. Exact host, exact port
//! 2. Exact host, any port
//! 3. Any host, exact port
//! 4. Any host, any port
//!
//! The first level with an entry wins. No entry at all means `Open`.
//!
//! A connection can be known under more than one host string (the name the
//! caller asked for and the IP it resolved to). All candidates are tried at a
//! level before moving on to the next one.
//!
//! # Example
//!
//! ```ignore
//! use wiretap::policy::{AddressMatcher, Decision, PolicyRegistry};
//!
//! let registry = Arc::new(PolicyRegistry::new());
//! registry.set_status("db.local", -1, Decision::Closed)?;
//! registry.set_status("db.local", 5432, Decision::Open)?;
//!
//! let matcher = AddressMatcher::new(registry);
//! assert_eq!(matcher.resolve("db.local", 5432), Decision::Open);
//! assert_eq!(matcher.resolve("db.local", 6379), Decision::Closed);
//! ```

use std::sync::Arc;

use super::decision::Decision;
use super::pattern::{HostPattern, PortPattern};
use super::registry::{PolicyEntry, PolicyRegistry, PolicySnapshot};

/// Outcome of resolving an address.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Decision to enforce.
    pub decision: Decision,
    /// Entry that produced it, `None` for the implicit default.
    pub entry: Option<Arc<PolicyEntry>>,
    /// Registry generation the decision was taken at.
    pub generation: u64,
}

impl Resolution {
    /// Whether an explicit entry matched.
    pub fn is_explicit(&self) -> bool {
        self.entry.is_some()
    }
}

/// Resolves addresses against a shared registry.
#[derive(Debug, Clone)]
pub struct AddressMatcher {
    registry: Arc<PolicyRegistry>,
}

impl AddressMatcher {
    /// Create a matcher over a registry.
    pub fn new(registry: Arc<PolicyRegistry>) -> Self {
        Self { registry }
    }

    /// Decision for `host:port`.
    pub fn resolve(&self, host: &str, port: u16) -> Decision {
        self.resolve_candidates(&[host], port).decision
    }

    /// Full resolution for a connection known under several host strings.
    pub fn resolve_candidates(&self, hosts: &[&str], port: u16) -> Resolution {
        resolve_in(&self.registry.snapshot(), hosts, port)
    }
}

/// Resolve against a snapshot.
pub fn resolve_in(snapshot: &PolicySnapshot, hosts: &[&str], port: u16) -> Resolution {
    let candidates: Vec<HostPattern> = hosts
        .iter()
        .filter(|h| !h.trim().is_empty())
        .map(|h| HostPattern::exact(h))
        .collect();
    let exact_port = PortPattern::Exact(port);

    let found = |host: &HostPattern, port: PortPattern| snapshot.get(host, port).cloned();

    let entry = [exact_port, PortPattern::Any]
        .into_iter()
        .find_map(|port| candidates.iter().find_map(|host| found(host, port)))
        .or_else(|| found(&HostPattern::Any, exact_port))
        .or_else(|| found(&HostPattern::Any, PortPattern::Any));

    Resolution {
        decision: entry.as_ref().map(|e| e.decision).unwrap_or_default(),
        entry,
        generation: snapshot.generation(),
    }
}
