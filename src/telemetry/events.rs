//! Audit event types for structured logging.
//!
//! Every policy decision enforced on a connection attempt, every change to
//! the policy table and every capture session boundary produces one event.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::capture::TransportKind;

/// Audit events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Connection established through the interceptor.
    ConnectionAllow {
        /// Destination address.
        address: String,
        /// Blocking or async transport.
        transport: TransportKind,
        /// Why it was allowed.
        reason: AllowReason,
    },

    /// Connection attempt suspended before connecting.
    ConnectionDelay {
        /// Destination address.
        address: String,
        /// Delay applied.
        delay_ms: u64,
    },

    /// Connection or I/O refused by policy.
    ConnectionRefuse {
        /// Destination address.
        address: String,
        /// Why it was refused.
        reason: BlockReason,
    },

    /// Connection handed a simulated unresponsive peer.
    ConnectionDiscard {
        /// Destination address.
        address: String,
    },

    /// Real connect failed (network error or timeout).
    ConnectionFail {
        /// Destination address.
        address: String,
        /// Error text.
        message: String,
    },

    /// Policy entry set or replaced.
    PolicyUpdate {
        /// Address pattern.
        address: String,
        /// New decision.
        decision: String,
    },

    /// Policy entries removed.
    PolicyClear {
        /// Number of entries removed.
        removed: usize,
    },

    /// Capture session opened.
    SessionStart {
        /// Session identifier.
        session_id: Uuid,
    },

    /// Capture session closed.
    SessionEnd {
        /// Session identifier.
        session_id: Uuid,
        /// Session length in milliseconds.
        duration_ms: u64,
    },

    /// Plaintext capture could not attach to an encrypted stream.
    CaptureAttachFailure {
        /// What went wrong.
        reason: String,
    },
}

/// Reasons a connection was allowed.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowReason {
    /// No entry matched; open by default.
    Unmatched,
    /// An entry explicitly opened the address.
    Policy,
    /// Allowed after a delay.
    Delayed,
}

/// Reasons a connection was refused.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// Closed at connect time.
    Policy,
    /// Closed while the connection was already established.
    LiveRecheck,
    /// Target of an HTTP CONNECT request is closed.
    ProxiedTarget,
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_allow_serialization() {
        let event = AuditEvent::ConnectionAllow {
            address: "db.local:5432".to_string(),
            transport: TransportKind::Async,
            reason: AllowReason::Unmatched,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"connection_allow\""));
        assert!(json.contains("\"address\":\"db.local:5432\""));
        assert!(json.contains("\"transport\":\"async\""));
        assert!(json.contains("\"reason\":\"unmatched\""));
        assert!(json.contains("\"ts\""));
    }

    #[test]
    fn test_connection_refuse_serialization() {
        let event = AuditEvent::ConnectionRefuse {
            address: "evil.io:443".to_string(),
            reason: BlockReason::ProxiedTarget,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"connection_refuse\""));
        assert!(json.contains("\"reason\":\"proxied_target\""));
    }

    #[test]
    fn test_policy_update_serialization() {
        let event = AuditEvent::PolicyUpdate {
            address: "*:6379".to_string(),
            decision: "delay(100ms)".to_string(),
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"policy_update\""));
        assert!(json.contains("\"decision\":\"delay(100ms)\""));
    }

    #[test]
    fn test_session_end_serialization() {
        let session_id = Uuid::new_v4();
        let event = AuditEvent::SessionEnd {
            session_id,
            duration_ms: 179,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"session_end\""));
        assert!(json.contains(&session_id.to_string()));
        assert!(json.contains("\"duration_ms\":179"));
    }
}
