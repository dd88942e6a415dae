//! Configuration schema definitions.
//!
//! ```toml
//! [general]
//! log_level = "debug"
//!
//! [capture]
//! enabled = false
//! capture_stack_traces = true
//! max_stack_trace_len = 8192
//! packet_merge_threshold_ms = 5
//! intercept_proxy_connections = true
//!
//! [policy]
//! persist_path = "/var/lib/wiretap/policy.json"
//!
//! [[policy.entries]]
//! address = "payments.internal"
//! status = "closed"
//!
//! [[policy.entries]]
//! address = "*"
//! port = 6379
//! status = "delay"
//! delay_ms = 250
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::error::ConfigError;
use crate::capture::MAX_STACK_TRACE_LEN;
use crate::policy::{AddressPattern, Decision, PolicyEntry, PolicyError, PortPattern};

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Capture settings.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Address policy.
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Scalars set in `other` override; policy entries are appended.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.capture.merge(other.capture);
        self.policy.merge(other.policy);
    }

    /// Check every section, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(len) = self.capture.max_stack_trace_len
            && len == 0
        {
            return Err(ConfigError::InvalidValue {
                field: "capture.max_stack_trace_len".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        self.policy.rules().map(|_| ())
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub log_level: String,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// Capture settings. Unset values keep the library defaults.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    /// Record traffic even without an open session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Record the call stack that opened each connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_stack_traces: Option<bool>,

    /// Upper bound on a recorded stack, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_stack_trace_len: Option<usize>,

    /// Merge adjacent same-direction packets closer than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_merge_threshold_ms: Option<u64>,

    /// Apply policy to the target of HTTP CONNECT requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intercept_proxy_connections: Option<bool>,
}

impl CaptureConfig {
    fn merge(&mut self, other: CaptureConfig) {
        self.enabled = other.enabled.or(self.enabled);
        self.capture_stack_traces = other.capture_stack_traces.or(self.capture_stack_traces);
        self.max_stack_trace_len = other.max_stack_trace_len.or(self.max_stack_trace_len);
        self.packet_merge_threshold_ms = other
            .packet_merge_threshold_ms
            .or(self.packet_merge_threshold_ms);
        self.intercept_proxy_connections = other
            .intercept_proxy_connections
            .or(self.intercept_proxy_connections);
    }

    /// Whether capture is forced on.
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    /// Whether opening stacks are recorded.
    pub fn capture_stack_traces(&self) -> bool {
        self.capture_stack_traces.unwrap_or(false)
    }

    /// Stack length bound.
    pub fn max_stack_trace_len(&self) -> usize {
        self.max_stack_trace_len.unwrap_or(MAX_STACK_TRACE_LEN)
    }

    /// Packet merge window; `None` when merging is off.
    pub fn merge_window(&self) -> Option<Duration> {
        self.packet_merge_threshold_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Whether CONNECT requests are inspected.
    pub fn intercept_proxy_connections(&self) -> bool {
        self.intercept_proxy_connections.unwrap_or(false)
    }
}

/// Policy section.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// JSON file the policy table is loaded from and saved to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_path: Option<PathBuf>,

    /// Configured entries, applied in order.
    #[serde(default)]
    pub entries: Vec<PolicyEntryConfig>,
}

impl PolicyConfig {
    fn merge(&mut self, other: PolicyConfig) {
        if other.persist_path.is_some() {
            self.persist_path = other.persist_path;
        }
        self.entries.extend(other.entries);
    }

    /// Validate and convert every entry.
    pub fn rules(&self) -> Result<Vec<PolicyEntry>, ConfigError> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                entry
                    .to_entry()
                    .map_err(|source| ConfigError::InvalidPolicyEntry { index, source })
            })
            .collect()
    }
}

/// One `[[policy.entries]]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyEntryConfig {
    /// `host` or `host:port`; `*` matches any host.
    pub address: String,

    /// Port, or -1 for any. Alternative to a port inside `address`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// open, closed, discard or delay.
    pub status: String,

    /// Delay for the `delay` status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

impl PolicyEntryConfig {
    /// Validate the entry and build the registry entry it describes.
    pub fn to_entry(&self) -> Result<PolicyEntry, PolicyError> {
        let mut pattern = AddressPattern::parse(&self.address)?;

        if let Some(port) = self.port {
            let port = PortPattern::from_i32(port)?;
            match pattern.port {
                PortPattern::Exact(_) if pattern.port != port => {
                    return Err(PolicyError::Ambiguous {
                        address: self.address.clone(),
                        message: format!(
                            "port {} conflicts with the port in the address",
                            port.as_i32()
                        ),
                    });
                }
                _ => pattern.port = port,
            }
        }

        let decision = Decision::parse(&self.status, self.delay_ms)
            .map_err(|e| e.for_address(&self.address))?;
        Ok(PolicyEntry::new(pattern, decision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::HostPattern;

    fn entry(address: &str, port: Option<i32>, status: &str, delay_ms: Option<u64>) -> PolicyEntryConfig {
        PolicyEntryConfig {
            address: address.to_string(),
            port,
            status: status.to_string(),
            delay_ms,
        }
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [general]
            log_level = "debug"

            [capture]
            capture_stack_traces = true
            packet_merge_threshold_ms = 5

            [[policy.entries]]
            address = "payments.internal"
            status = "closed"

            [[policy.entries]]
            address = "*"
            port = 6379
            status = "delay"
            delay_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.general.log_level, "debug");
        assert!(config.capture.capture_stack_traces());
        assert!(!config.capture.enabled());
        assert_eq!(config.capture.merge_window(), Some(Duration::from_millis(5)));

        let rules = config.policy.rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].decision, Decision::Closed);
        assert!(rules[0].port.is_any());
        assert_eq!(rules[1].host, HostPattern::Any);
        assert_eq!(rules[1].port, PortPattern::Exact(6379));
        assert_eq!(rules[1].decision, Decision::delay(Duration::from_millis(250)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<Config, _> = toml::from_str("[capture]\nbogus = true\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_port_in_address() {
        let rule = entry("db.local:5432", None, "discard", None).to_entry().unwrap();
        assert_eq!(rule.port, PortPattern::Exact(5432));
        assert_eq!(rule.decision, Decision::Discard);
    }

    #[test]
    fn test_conflicting_ports_ambiguous() {
        let err = entry("db.local:5432", Some(5433), "open", None)
            .to_entry()
            .unwrap_err();
        assert!(matches!(err, PolicyError::Ambiguous { .. }));

        // Same port twice is fine
        assert!(entry("db.local:5432", Some(5432), "open", None).to_entry().is_ok());
    }

    #[test]
    fn test_invalid_entries() {
        assert!(matches!(
            entry("", None, "open", None).to_entry(),
            Err(PolicyError::EmptyHost)
        ));
        assert!(matches!(
            entry("db.local", Some(70000), "open", None).to_entry(),
            Err(PolicyError::InvalidPort(_))
        ));
        assert!(matches!(
            entry("db.local", None, "blocked", None).to_entry(),
            Err(PolicyError::UnknownStatus(_))
        ));
        assert!(matches!(
            entry("db.local", None, "delay", None).to_entry(),
            Err(PolicyError::Ambiguous { .. })
        ));
        assert!(matches!(
            entry("db.local", None, "closed", Some(10)).to_entry(),
            Err(PolicyError::Ambiguous { .. })
        ));
    }

    #[test]
    fn test_rules_report_index() {
        let policy = PolicyConfig {
            persist_path: None,
            entries: vec![
                entry("ok.local", None, "open", None),
                entry("bad.local", None, "nope", None),
            ],
        };
        match policy.rules() {
            Err(ConfigError::InvalidPolicyEntry { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_merge_overrides_scalars_and_appends_entries() {
        let mut base = Config::default();
        base.general.log_level = "info".to_string();
        base.capture.capture_stack_traces = Some(true);
        base.policy.entries.push(entry("a.local", None, "closed", None));

        let mut overlay = Config::default();
        overlay.capture.enabled = Some(true);
        overlay.policy.entries.push(entry("b.local", None, "discard", None));

        base.merge(overlay);
        assert_eq!(base.general.log_level, "info");
        assert!(base.capture.enabled());
        assert!(base.capture.capture_stack_traces());
        assert_eq!(base.policy.entries.len(), 2);
    }

    #[test]
    fn test_zero_stack_len_invalid() {
        let mut config = Config::default();
        config.capture.max_stack_trace_len = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
