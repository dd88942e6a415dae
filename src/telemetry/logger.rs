//! Audit logger.
//!
//! Events are serialized to JSON and either emitted as `tracing` records
//! under the [`AUDIT_TARGET`] target, kept in memory, or dropped.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::{debug, error, info};

use super::error::TelemetryError;
use super::events::AuditEvent;
use crate::sync::lock;

/// `tracing` target for audit records.
pub const AUDIT_TARGET: &str = "wiretap::audit";

/// Events an in-memory logger keeps by default before dropping the oldest.
pub const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

struct MemorySink {
    events: Mutex<VecDeque<String>>,
    capacity: usize,
}

enum Sink {
    Null,
    Tracing,
    Memory(MemorySink),
}

/// Audit logger writing structured JSON events.
///
/// Shared as `Arc<AuditLogger>` by every component that audits.
pub struct AuditLogger {
    sink: Sink,
}

impl AuditLogger {
    /// Logger emitting events through `tracing`.
    pub fn new() -> Self {
        Self {
            sink: Sink::Tracing,
        }
    }

    /// Create a null audit logger that discards all events.
    pub fn new_null() -> Self {
        Self { sink: Sink::Null }
    }

    /// Logger that keeps the most recent serialized events in memory.
    ///
    /// Meant for tests and short embedded runs; at most
    /// [`DEFAULT_MEMORY_CAPACITY`] events are kept.
    pub fn new_in_memory() -> Self {
        Self::with_memory_capacity(DEFAULT_MEMORY_CAPACITY)
    }

    /// In-memory logger keeping at most `capacity` events (at least one).
    pub fn with_memory_capacity(capacity: usize) -> Self {
        Self {
            sink: Sink::Memory(MemorySink {
                events: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Log an audit event.
    ///
    /// Failures are reported through `tracing` and otherwise ignored.
    pub fn log(&self, event: AuditEvent) {
        if let Err(e) = self.try_log(&event) {
            error!("Failed to log audit event: {}", e);
        }
    }

    /// Log an audit event, reporting serialization failures.
    pub fn try_log(&self, event: &AuditEvent) -> Result<(), TelemetryError> {
        if self.is_null() {
            return Ok(());
        }

        let json = serde_json::to_string(&event.with_timestamp())?;
        match &self.sink {
            Sink::Null => {}
            Sink::Tracing => info!(target: AUDIT_TARGET, "{}", json),
            Sink::Memory(memory) => {
                debug!("Logged audit event: {}", json);
                let mut events = lock(&memory.events);
                if events.len() == memory.capacity {
                    events.pop_front();
                }
                events.push_back(json);
            }
        }
        Ok(())
    }

    /// Events kept by an in-memory logger, oldest first.
    pub fn recorded(&self) -> Vec<String> {
        match &self.sink {
            Sink::Memory(memory) => lock(&memory.events).iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Check if this is a null logger.
    pub fn is_null(&self) -> bool {
        matches!(self.sink, Sink::Null)
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_logger() {
        let logger = AuditLogger::new_null();
        assert!(logger.is_null());
        logger.log(AuditEvent::PolicyClear { removed: 3 });
        assert!(logger.recorded().is_empty());
    }

    #[test]
    fn test_in_memory_logger() {
        let logger = AuditLogger::new_in_memory();
        assert!(!logger.is_null());

        logger.log(AuditEvent::PolicyClear { removed: 3 });
        logger.log(AuditEvent::ConnectionDiscard {
            address: "a.local:80".to_string(),
        });

        let events = logger.recorded();
        assert_eq!(events.len(), 2);
        assert!(events[0].contains("\"event\":\"policy_clear\""));
        assert!(events[1].contains("\"address\":\"a.local:80\""));
    }

    #[test]
    fn test_in_memory_logger_drops_oldest() {
        let logger = AuditLogger::with_memory_capacity(2);
        for removed in 1..=3 {
            logger.log(AuditEvent::PolicyClear { removed });
        }

        let events = logger.recorded();
        assert_eq!(events.len(), 2);
        assert!(events[0].contains("\"removed\":2"));
        assert!(events[1].contains("\"removed\":3"));
    }

    #[test]
    fn test_tracing_logger_does_not_fail_without_subscriber() {
        let logger = AuditLogger::new();
        assert!(logger
            .try_log(&AuditEvent::PolicyClear { removed: 0 })
            .is_ok());
    }
}
