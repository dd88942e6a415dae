//! Audit telemetry.
//!
//! Policy decisions enforced on connections, policy table changes and
//! capture session boundaries are reported as structured [`AuditEvent`]s.
//!
//! # Architecture
//!
//! - **Audit events** (JSON): emitted through `tracing` under the
//!   `wiretap::audit` target, kept in memory, or dropped
//! - **Debug logging** (`tracing`): ordinary diagnostics from each module
//!
//! The logger is injected as `Arc<AuditLogger>`; there is no global instance.
//!
//! # Event Format
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"connection_refuse","address":"db.local:5432","reason":"policy"}
//! ```

mod error;
mod events;
mod logger;

pub use error::TelemetryError;
pub use events::{AllowReason, AuditEvent, BlockReason, TimestampedEvent};
pub use logger::{AuditLogger, AUDIT_TARGET, DEFAULT_MEMORY_CAPACITY};
