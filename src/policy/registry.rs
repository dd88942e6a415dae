//! Concurrent address policy registry.
//!
//! The registry keeps its table behind a copy-on-write snapshot: readers
//! clone an `Arc` under a short read lock and then match without holding any
//! lock, writers rebuild the table and swap it in. Writes are rare compared
//! to connection attempts, so the copy is cheap in practice.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::decision::Decision;
use super::error::PolicyResult;
use super::pattern::{normalize_host, AddressPattern, HostPattern, PortPattern};
use crate::sync::{read, write};
use crate::telemetry::{AuditEvent, AuditLogger};

/// Registry key.
pub type PolicyKey = (HostPattern, PortPattern);

/// One configured policy. Immutable; updates replace the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEntry {
    /// Host half of the key.
    pub host: HostPattern,
    /// Port half of the key.
    pub port: PortPattern,
    /// Decision for matching addresses.
    pub decision: Decision,
    /// When the entry was set.
    pub updated_at: DateTime<Utc>,
}

impl PolicyEntry {
    /// Create an entry stamped with the current time.
    pub fn new(pattern: AddressPattern, decision: Decision) -> Self {
        Self {
            host: pattern.host,
            port: pattern.port,
            decision,
            updated_at: Utc::now(),
        }
    }

    /// The entry's key.
    pub fn key(&self) -> PolicyKey {
        (self.host.clone(), self.port)
    }

    /// The entry's address pattern.
    pub fn address(&self) -> AddressPattern {
        AddressPattern {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Immutable view of the registry at one point in time.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    entries: Arc<HashMap<PolicyKey, Arc<PolicyEntry>>>,
    generation: u64,
}

impl PolicySnapshot {
    /// Look up the entry for an exact key.
    pub fn get(&self, host: &HostPattern, port: PortPattern) -> Option<&Arc<PolicyEntry>> {
        self.entries.get(&(host.clone(), port))
    }

    /// Registry generation this snapshot was taken at.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered from most to least specific.
    pub fn entries(&self) -> Vec<Arc<PolicyEntry>> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            (a.host.is_any(), a.port.is_any(), &a.host, a.port)
                .cmp(&(b.host.is_any(), b.port.is_any(), &b.host, b.port))
        });
        entries
    }
}

/// Shared, concurrently updatable map from address patterns to decisions.
///
/// There is at most one entry per `(host, port)` key; setting a key again
/// replaces the entry. A change is visible to every connection attempt that
/// starts after the call returns.
pub struct PolicyRegistry {
    current: RwLock<PolicySnapshot>,
    generation: AtomicU64,
    discovered: RwLock<BTreeSet<(String, u16)>>,
    audit: Arc<AuditLogger>,
}

impl PolicyRegistry {
    /// Create an empty registry with no audit logging.
    pub fn new() -> Self {
        Self::with_audit(Arc::new(AuditLogger::new_null()))
    }

    /// Create an empty registry that audits policy changes.
    pub fn with_audit(audit: Arc<AuditLogger>) -> Self {
        Self {
            current: RwLock::new(PolicySnapshot::default()),
            generation: AtomicU64::new(0),
            discovered: RwLock::new(BTreeSet::new()),
            audit,
        }
    }

    /// Set the decision for `host:port` (`port` -1 and host `*` are wildcards).
    ///
    /// Invalid input is rejected here, never at connection time.
    pub fn set_status(&self, host: &str, port: i32, decision: Decision) -> PolicyResult<()> {
        let pattern = AddressPattern::new(host, port)?;
        self.set(pattern, decision);
        Ok(())
    }

    /// Set the decision for an address pattern.
    pub fn set(&self, pattern: AddressPattern, decision: Decision) {
        let entry = PolicyEntry::new(pattern, decision);
        debug!("Policy {} -> {}", entry.address(), decision);

        self.audit.log(AuditEvent::PolicyUpdate {
            address: entry.address().to_string(),
            decision: decision.to_string(),
        });

        self.mutate(|entries| {
            entries.insert(entry.key(), Arc::new(entry));
        });
    }

    /// Decision stored under the exact key, without wildcard resolution.
    ///
    /// Returns `None` for keys that are absent or not valid patterns.
    pub fn get_status(&self, host: &str, port: i32) -> Option<Decision> {
        let pattern = AddressPattern::new(host, port).ok()?;
        self.snapshot()
            .get(&pattern.host, pattern.port)
            .map(|entry| entry.decision)
    }

    /// Remove every entry, wildcards included. Idempotent.
    pub fn clear(&self) {
        let mut removed = 0;
        self.mutate(|entries| {
            removed = entries.len();
            entries.clear();
        });
        debug!("Policy cleared ({} entries)", removed);
        self.audit.log(AuditEvent::PolicyClear { removed });
    }

    /// Remove the entry for one exact key, returning its decision.
    pub fn clear_status(&self, host: &str, port: i32) -> PolicyResult<Option<Decision>> {
        let pattern = AddressPattern::new(host, port)?;
        let key = (pattern.host, pattern.port);

        let mut removed = None;
        self.mutate(|entries| {
            removed = entries.remove(&key).map(|entry| entry.decision);
        });
        if removed.is_some() {
            self.audit.log(AuditEvent::PolicyClear { removed: 1 });
        }
        Ok(removed)
    }

    /// Replace the whole table in one step.
    pub fn replace_all(&self, entries: impl IntoIterator<Item = PolicyEntry>) {
        let table: HashMap<PolicyKey, Arc<PolicyEntry>> = entries
            .into_iter()
            .map(|entry| (entry.key(), Arc::new(entry)))
            .collect();
        let count = table.len();
        self.mutate(|entries| *entries = table);
        debug!("Policy table replaced ({} entries)", count);
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> PolicySnapshot {
        read(&self.current).clone()
    }

    /// Entries ordered from most to least specific.
    pub fn entries(&self) -> Vec<Arc<PolicyEntry>> {
        self.snapshot().entries()
    }

    /// Counter bumped on every mutation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Record an address that a connection attempt was evaluated for.
    pub fn note_discovered(&self, host: &str, port: u16) {
        let key = (normalize_host(host), port);
        if read(&self.discovered).contains(&key) {
            return;
        }
        write(&self.discovered).insert(key);
    }

    /// Every address evaluated so far, sorted.
    pub fn discovered(&self) -> Vec<(String, u16)> {
        read(&self.discovered).iter().cloned().collect()
    }

    fn mutate(&self, change: impl FnOnce(&mut HashMap<PolicyKey, Arc<PolicyEntry>>)) {
        let mut current = write(&self.current);
        let mut entries = (*current.entries).clone();
        change(&mut entries);

        let generation = self.generation.load(Ordering::Relaxed) + 1;
        *current = PolicySnapshot {
            entries: Arc::new(entries),
            generation,
        };
        self.generation.store(generation, Ordering::Release);
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("PolicyRegistry")
            .field("entries", &snapshot.len())
            .field("generation", &snapshot.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::error::PolicyError;
    use std::thread;

    #[test]
    fn test_set_and_get_status() {
        let registry = PolicyRegistry::new();
        registry.set_status("db.local", 5432, Decision::Closed).unwrap();

        assert_eq!(registry.get_status("db.local", 5432), Some(Decision::Closed));
        assert_eq!(registry.get_status("DB.LOCAL", 5432), Some(Decision::Closed));
        assert_eq!(registry.get_status("db.local", 5433), None);
        // Exact key lookup, no wildcard resolution
        assert_eq!(registry.get_status("db.local", -1), None);
    }

    #[test]
    fn test_set_replaces_entry() {
        let registry = PolicyRegistry::new();
        registry.set_status("db.local", 5432, Decision::Closed).unwrap();
        registry.set_status("db.local", 5432, Decision::Discard).unwrap();

        assert_eq!(registry.entries().len(), 1);
        assert_eq!(registry.get_status("db.local", 5432), Some(Decision::Discard));
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        let registry = PolicyRegistry::new();
        assert!(matches!(
            registry.set_status("db.local", 70000, Decision::Closed),
            Err(PolicyError::InvalidPort(_))
        ));
        assert!(matches!(
            registry.set_status("", 80, Decision::Closed),
            Err(PolicyError::EmptyHost)
        ));
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_clear_removes_wildcards() {
        let registry = PolicyRegistry::new();
        registry.set_status("*", -1, Decision::Closed).unwrap();
        registry.set_status("a.local", -1, Decision::Discard).unwrap();

        registry.clear();
        assert!(registry.snapshot().is_empty());

        // Idempotent
        registry.clear();
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_clear_status_single_entry() {
        let registry = PolicyRegistry::new();
        registry.set_status("a.local", 80, Decision::Closed).unwrap();
        registry.set_status("a.local", -1, Decision::Closed).unwrap();

        let removed = registry.clear_status("a.local", 80).unwrap();
        assert_eq!(removed, Some(Decision::Closed));
        assert_eq!(registry.get_status("a.local", -1), Some(Decision::Closed));
        assert_eq!(registry.clear_status("a.local", 80).unwrap(), None);
    }

    #[test]
    fn test_generation_advances() {
        let registry = PolicyRegistry::new();
        let start = registry.generation();
        registry.set_status("a.local", 80, Decision::Closed).unwrap();
        assert!(registry.generation() > start);
        assert_eq!(registry.snapshot().generation(), registry.generation());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let registry = PolicyRegistry::new();
        registry.set_status("a.local", 80, Decision::Closed).unwrap();
        let snapshot = registry.snapshot();

        registry.clear();
        assert_eq!(snapshot.len(), 1);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_entries_sorted_by_specificity() {
        let registry = PolicyRegistry::new();
        registry.set_status("*", -1, Decision::Closed).unwrap();
        registry.set_status("*", 80, Decision::Closed).unwrap();
        registry.set_status("a.local", -1, Decision::Closed).unwrap();
        registry.set_status("a.local", 80, Decision::Open).unwrap();

        let order: Vec<String> = registry
            .entries()
            .iter()
            .map(|e| e.address().to_string())
            .collect();
        assert_eq!(order, vec!["a.local:80", "a.local:*", "*:80", "*:*"]);
    }

    #[test]
    fn test_discovered_addresses() {
        let registry = PolicyRegistry::new();
        registry.note_discovered("B.local", 80);
        registry.note_discovered("a.local", 443);
        registry.note_discovered("b.local", 80);

        assert_eq!(
            registry.discovered(),
            vec![("a.local".to_string(), 443), ("b.local".to_string(), 80)]
        );
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let registry = Arc::new(PolicyRegistry::new());
        let mut handles = Vec::new();

        for i in 0..8u16 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                for j in 0..50u16 {
                    let port = i32::from(i * 100 + j);
                    registry
                        .set_status("host.local", port, Decision::Closed)
                        .unwrap();
                    assert_eq!(
                        registry.get_status("host.local", port),
                        Some(Decision::Closed)
                    );
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.snapshot().len(), 400);
    }
}
