//! The `Wiretap` facade.
//!
//! Wires one policy registry, one traffic recorder and one interceptor
//! together and exposes the policy control and capture query surfaces. An
//! instance is created explicitly (typically once per test harness) and
//! shared by reference; there is no global state.
//!
//! A new instance starts detached: connections made through its
//! interceptor bypass policy and capture until [`Wiretap::attach`] is
//! called.
//!
//! # Example
//!
//! ```ignore
//! use wiretap::policy::Decision;
//! use wiretap::capture::TrafficQuery;
//! use wiretap::Wiretap;
//!
//! let wiretap = Wiretap::new();
//! wiretap.attach();
//! wiretap.set_socket_address_status("db.local", -1, Decision::Closed)?;
//!
//! let session = wiretap.start_session();
//! let stream = wiretap.interceptor().connect("127.0.0.1", 8080)?;
//! // ...
//! let traffic = session.captured_traffic(&TrafficQuery::new());
//! wiretap.clear();
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info};

use crate::capture::{
    CaptureSession, ConnectionStats, GroupedTraffic, TraceAttributor, TrafficQuery, TrafficRecorder,
};
use crate::config::{Config, ConfigError, ConfigResult};
use crate::intercept::ConnectionInterceptor;
use crate::policy::{Decision, PolicyRegistry, PolicyResult};
use crate::telemetry::AuditLogger;
use crate::tls::{TlsCaptureAdapter, TlsClient};

/// Policy enforcement and traffic capture for one process or test harness.
pub struct Wiretap {
    registry: Arc<PolicyRegistry>,
    recorder: Arc<TrafficRecorder>,
    interceptor: ConnectionInterceptor,
    tls_adapter: TlsCaptureAdapter,
    audit: Arc<AuditLogger>,
    persist_path: Option<PathBuf>,
}

impl Wiretap {
    /// Instance with default settings, auditing through `tracing`.
    pub fn new() -> Self {
        Self::with_audit(Arc::new(AuditLogger::new()))
    }

    /// Instance with default settings and the given audit logger.
    pub fn with_audit(audit: Arc<AuditLogger>) -> Self {
        Self::build(
            TraceAttributor::default(),
            TrafficRecorder::with_audit(Arc::clone(&audit)),
            false,
            None,
            audit,
        )
    }

    /// Instance configured from a loaded [`Config`].
    ///
    /// When `policy.persist_path` names an existing file its table is
    /// loaded first; configured entries are then applied on top, in order.
    pub fn from_config(config: &Config, audit: Arc<AuditLogger>) -> ConfigResult<Self> {
        config.validate()?;
        let capture = &config.capture;

        let attributor = TraceAttributor::new(capture.capture_stack_traces())
            .with_max_stack_len(capture.max_stack_trace_len());
        let recorder = TrafficRecorder::with_audit(Arc::clone(&audit))
            .with_merge_window(capture.merge_window());

        let wiretap = Self::build(
            attributor,
            recorder,
            capture.intercept_proxy_connections(),
            config.policy.persist_path.clone(),
            audit,
        );

        if let Some(path) = &wiretap.persist_path
            && path.exists()
        {
            wiretap
                .registry
                .load(path)
                .map_err(ConfigError::Persistence)?;
        }
        for entry in config.policy.rules()? {
            wiretap.registry.set(entry.address(), entry.decision);
        }

        wiretap.recorder.set_capture_enabled(capture.enabled());
        debug!(
            "Wiretap configured with {} policy entries",
            wiretap.registry.snapshot().len()
        );
        Ok(wiretap)
    }

    fn build(
        attributor: TraceAttributor,
        recorder: TrafficRecorder,
        inspect_proxy_requests: bool,
        persist_path: Option<PathBuf>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let registry = Arc::new(PolicyRegistry::with_audit(Arc::clone(&audit)));
        let recorder = Arc::new(recorder);
        let interceptor = ConnectionInterceptor::new(Arc::clone(&registry), Arc::clone(&recorder))
            .with_attributor(Arc::new(attributor))
            .with_audit(Arc::clone(&audit))
            .with_proxy_inspection(inspect_proxy_requests)
            .with_attach_flag(Arc::new(AtomicBool::new(false)));

        Self {
            registry,
            recorder,
            interceptor,
            tls_adapter: TlsCaptureAdapter::new(Arc::clone(&audit)),
            audit,
            persist_path,
        }
    }

    /// Start intercepting new connections.
    pub fn attach(&self) {
        self.interceptor.attach();
    }

    /// Stop intercepting. Connections already handed out keep their
    /// recording and policy checks.
    pub fn detach(&self) {
        self.interceptor.detach();
    }

    /// Whether new connections are intercepted.
    pub fn is_attached(&self) -> bool {
        self.interceptor.is_attached()
    }

    /// The interceptor to route connections through.
    pub fn interceptor(&self) -> &ConnectionInterceptor {
        &self.interceptor
    }

    /// The policy registry.
    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// The traffic recorder.
    pub fn recorder(&self) -> &Arc<TrafficRecorder> {
        &self.recorder
    }

    /// Adapter for capturing plaintext on TLS streams.
    pub fn tls_adapter(&self) -> &TlsCaptureAdapter {
        &self.tls_adapter
    }

    /// TLS client using `config` and this instance's audit logger.
    pub fn tls_client(&self, config: Arc<rustls::ClientConfig>) -> TlsClient {
        TlsClient::new(config, Arc::clone(&self.audit))
    }

    /// The audit logger.
    pub fn audit(&self) -> Arc<AuditLogger> {
        Arc::clone(&self.audit)
    }

    /// Set the decision for `host:port` (`"*"` for any host, -1 for any
    /// port), replacing an existing entry for the same key.
    pub fn set_socket_address_status(
        &self,
        host: &str,
        port: i32,
        decision: Decision,
    ) -> PolicyResult<()> {
        self.registry.set_status(host, port, decision)
    }

    /// Decision stored for exactly this key.
    pub fn socket_address_status(&self, host: &str, port: i32) -> Option<Decision> {
        self.registry.get_status(host, port)
    }

    /// Remove the entry for exactly this key.
    pub fn clear_socket_address_status(&self, host: &str, port: i32) -> PolicyResult<Option<Decision>> {
        self.registry.clear_status(host, port)
    }

    /// Decision a connection to `host:port` would get now.
    pub fn resolve(&self, host: &str, port: u16) -> Decision {
        self.interceptor.resolve(host, port)
    }

    /// Remove every policy entry.
    pub fn clear(&self) {
        self.registry.clear();
    }

    /// Save the policy table to the configured persist path.
    ///
    /// Returns false when no path is configured.
    pub fn save_policy(&self) -> PolicyResult<bool> {
        match &self.persist_path {
            Some(path) => {
                self.registry.save(path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Configured persist path.
    pub fn persist_path(&self) -> Option<&Path> {
        self.persist_path.as_deref()
    }

    /// Open a capture session.
    pub fn start_session(&self) -> CaptureSession {
        self.recorder.start_session()
    }

    /// Record traffic even without an open session.
    pub fn set_capture_enabled(&self, enabled: bool) {
        info!("Capture {}", if enabled { "forced on" } else { "session-bound" });
        self.recorder.set_capture_enabled(enabled);
    }

    /// Every retained packet matching `query`, grouped.
    pub fn captured_traffic(&self, query: &TrafficQuery) -> GroupedTraffic {
        self.recorder.traffic(query)
    }

    /// Per-connection statistics for every retained packet matching `query`.
    pub fn socket_stats(&self, query: &TrafficQuery) -> Vec<ConnectionStats> {
        self.recorder.socket_stats(query)
    }
}

impl Default for Wiretap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Wiretap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wiretap")
            .field("attached", &self.is_attached())
            .field("policy_entries", &self.registry.snapshot().len())
            .field("connections", &self.recorder.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyEntryConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry(address: &str, status: &str, delay_ms: Option<u64>) -> PolicyEntryConfig {
        PolicyEntryConfig {
            address: address.to_string(),
            port: None,
            status: status.to_string(),
            delay_ms,
        }
    }

    #[test]
    fn test_starts_detached() {
        let wiretap = Wiretap::with_audit(Arc::new(AuditLogger::new_null()));
        assert!(!wiretap.is_attached());
        wiretap.attach();
        assert!(wiretap.is_attached());
        wiretap.detach();
        assert!(!wiretap.is_attached());
    }

    #[test]
    fn test_policy_surface() {
        let wiretap = Wiretap::with_audit(Arc::new(AuditLogger::new_null()));
        wiretap
            .set_socket_address_status("db.local", -1, Decision::Closed)
            .unwrap();
        wiretap
            .set_socket_address_status("db.local", 5433, Decision::Open)
            .unwrap();

        assert_eq!(wiretap.resolve("DB.local", 5432), Decision::Closed);
        assert_eq!(wiretap.resolve("db.local", 5433), Decision::Open);
        assert_eq!(
            wiretap.socket_address_status("db.local", -1),
            Some(Decision::Closed)
        );

        wiretap.clear();
        wiretap.clear();
        assert_eq!(wiretap.resolve("db.local", 5432), Decision::Open);
    }

    #[test]
    fn test_from_config_applies_entries_in_order() {
        let mut config = Config::default();
        config.capture.enabled = Some(true);
        config.policy.entries = vec![
            entry("a.local", "closed", None),
            entry("b.local:443", "delay", Some(20)),
            entry("a.local", "discard", None),
        ];

        let wiretap = Wiretap::from_config(&config, Arc::new(AuditLogger::new_null())).unwrap();
        assert_eq!(wiretap.resolve("a.local", 80), Decision::Discard);
        assert_eq!(
            wiretap.resolve("b.local", 443),
            Decision::delay(Duration::from_millis(20))
        );
        assert!(wiretap.recorder().capture_enabled());
    }

    #[test]
    fn test_from_config_rejects_invalid_entry() {
        let mut config = Config::default();
        config.policy.entries = vec![entry("a.local", "sometimes", None)];
        assert!(Wiretap::from_config(&config, Arc::new(AuditLogger::new_null())).is_err());
    }

    #[test]
    fn test_persisted_policy_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.json");

        let mut config = Config::default();
        config.policy.persist_path = Some(path.clone());

        let first = Wiretap::from_config(&config, Arc::new(AuditLogger::new_null())).unwrap();
        assert!(!path.exists());
        first
            .set_socket_address_status("cache.local", 6379, Decision::Discard)
            .unwrap();
        assert!(first.save_policy().unwrap());

        // Configured entries win over persisted ones
        config.policy.entries = vec![entry("*", "closed", None)];
        let second = Wiretap::from_config(&config, Arc::new(AuditLogger::new_null())).unwrap();
        assert_eq!(second.resolve("cache.local", 6379), Decision::Discard);
        assert_eq!(second.resolve("other.local", 80), Decision::Closed);
    }

    #[test]
    fn test_save_without_path() {
        let wiretap = Wiretap::with_audit(Arc::new(AuditLogger::new_null()));
        assert!(!wiretap.save_policy().unwrap());
    }
}
