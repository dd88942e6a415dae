//! Host and port patterns used as registry keys.
//!
//! A pattern is either an exact value or the wildcard. Hosts are normalized
//! (lowercase, no IPv6 brackets, no trailing dot) so that matching is
//! case-insensitive.
//!
//! Textual address patterns accept:
//!
//! - `*` (any host, any port)
//! - `example.com` (any port)
//! - `example.com:443`, `example.com:*`, `example.com:-1`
//! - `*:5432` (any host, exact port)
//! - `[::1]:8080`, bare `::1`

use std::fmt;
use std::str::FromStr;

use super::error::{PolicyError, PolicyResult};

/// Wildcard host marker.
pub const ANY_HOST: &str = "*";

/// Wildcard port marker.
pub const ANY_PORT: i32 = -1;

/// Normalize a host string for comparison.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let host = if host.len() > 1 {
        host.trim_end_matches('.')
    } else {
        host
    };
    host.to_ascii_lowercase()
}

/// Host half of a registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostPattern {
    /// Exact (normalized) host name or IP literal.
    Exact(String),
    /// Any host.
    Any,
}

impl HostPattern {
    /// Parse a host pattern. `*` is the wildcard.
    pub fn parse(host: &str) -> PolicyResult<Self> {
        let trimmed = host.trim();
        if trimmed.is_empty() {
            return Err(PolicyError::EmptyHost);
        }
        if trimmed == ANY_HOST {
            return Ok(HostPattern::Any);
        }
        let normalized = normalize_host(trimmed);
        if normalized.is_empty() {
            return Err(PolicyError::EmptyHost);
        }
        Ok(HostPattern::Exact(normalized))
    }

    /// Exact pattern for an already-known host; the host is normalized.
    pub fn exact(host: &str) -> Self {
        HostPattern::Exact(normalize_host(host))
    }

    /// Whether this is the wildcard.
    pub fn is_any(&self) -> bool {
        matches!(self, HostPattern::Any)
    }

    /// Match a host. The argument is normalized before comparison.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Any => true,
            HostPattern::Exact(expected) => *expected == normalize_host(host),
        }
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPattern::Any => write!(f, "{}", ANY_HOST),
            HostPattern::Exact(host) if host.contains(':') => write!(f, "[{}]", host),
            HostPattern::Exact(host) => write!(f, "{}", host),
        }
    }
}

/// Port half of a registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortPattern {
    /// Exact port.
    Exact(u16),
    /// Any port.
    Any,
}

impl PortPattern {
    /// Convert the integer port convention (-1 means any).
    pub fn from_i32(port: i32) -> PolicyResult<Self> {
        match port {
            ANY_PORT => Ok(PortPattern::Any),
            0..=65535 => Ok(PortPattern::Exact(port as u16)),
            other => Err(PolicyError::InvalidPort(other.to_string())),
        }
    }

    /// Parse a textual port: a number, `-1` or `*`.
    pub fn parse(port: &str) -> PolicyResult<Self> {
        let port = port.trim();
        if port == "*" {
            return Ok(PortPattern::Any);
        }
        let value = port
            .parse::<i32>()
            .map_err(|_| PolicyError::InvalidPort(port.to_string()))?;
        Self::from_i32(value)
    }

    /// The integer port convention (-1 means any).
    pub fn as_i32(&self) -> i32 {
        match self {
            PortPattern::Exact(port) => i32::from(*port),
            PortPattern::Any => ANY_PORT,
        }
    }

    /// Whether this is the wildcard.
    pub fn is_any(&self) -> bool {
        matches!(self, PortPattern::Any)
    }

    /// Match a port.
    pub fn matches(&self, port: u16) -> bool {
        match self {
            PortPattern::Any => true,
            PortPattern::Exact(expected) => *expected == port,
        }
    }
}

impl fmt::Display for PortPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortPattern::Any => write!(f, "*"),
            PortPattern::Exact(port) => write!(f, "{}", port),
        }
    }
}

/// A host pattern paired with a port pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressPattern {
    /// Host half.
    pub host: HostPattern,
    /// Port half.
    pub port: PortPattern,
}

impl AddressPattern {
    /// Build from a host string and the integer port convention.
    pub fn new(host: &str, port: i32) -> PolicyResult<Self> {
        Ok(Self {
            host: HostPattern::parse(host)?,
            port: PortPattern::from_i32(port)?,
        })
    }

    /// Pattern matching every address.
    pub fn any() -> Self {
        Self {
            host: HostPattern::Any,
            port: PortPattern::Any,
        }
    }

    /// Whether the pattern matches a concrete address.
    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.host.matches(host) && self.port.matches(port)
    }

    /// Parse `host[:port]`. A missing port means any port.
    pub fn parse(input: &str) -> PolicyResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(PolicyError::EmptyHost);
        }

        // Bracketed IPv6, optionally followed by :port
        if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| PolicyError::InvalidAddress(input.to_string()))?;
            let port = match tail {
                "" => PortPattern::Any,
                tail => {
                    let port = tail
                        .strip_prefix(':')
                        .ok_or_else(|| PolicyError::InvalidAddress(input.to_string()))?;
                    PortPattern::parse(port)?
                }
            };
            return Ok(Self {
                host: HostPattern::parse(host)?,
                port,
            });
        }

        // Bare IPv6 literal has more than one colon and no port
        if input.matches(':').count() > 1 {
            return Ok(Self {
                host: HostPattern::parse(input)?,
                port: PortPattern::Any,
            });
        }

        match input.rsplit_once(':') {
            Some((host, port)) => Ok(Self {
                host: HostPattern::parse(host)?,
                port: PortPattern::parse(port)?,
            }),
            None => Ok(Self {
                host: HostPattern::parse(input)?,
                port: PortPattern::Any,
            }),
        }
    }
}

impl FromStr for AddressPattern {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AddressPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Split `host:port` into its parts; the port is mandatory.
///
/// IPv6 hosts must be bracketed (`[::1]:443`); brackets are removed.
pub fn parse_host_port(authority: &str) -> PolicyResult<(String, u16)> {
    let authority = authority.trim();
    let (host, port_str) = authority
        .rsplit_once(':')
        .ok_or_else(|| PolicyError::InvalidAddress(authority.to_string()))?;

    let port = port_str
        .parse::<u16>()
        .map_err(|_| PolicyError::InvalidPort(port_str.to_string()))?;

    let host = if host.starts_with('[') && host.ends_with(']') {
        &host[1..host.len() - 1]
    } else if host.contains(':') {
        return Err(PolicyError::InvalidAddress(authority.to_string()));
    } else {
        host
    };

    if host.is_empty() {
        return Err(PolicyError::EmptyHost);
    }
    Ok((host.to_string(), port))
}

/// Format a host and port as an address, bracketing IPv6 literals.
pub fn display_address(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
