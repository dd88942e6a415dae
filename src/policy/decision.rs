//! Policy decisions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::error::{PolicyError, PolicyResult};

/// What happens to a connection attempt to a given address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Decision {
    /// Connect normally.
    #[default]
    Open,
    /// Refuse before any network I/O.
    Closed,
    /// Pretend to connect; drop writes, never answer reads.
    Discard,
    /// Wait, then connect normally.
    Delay {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
}

impl Decision {
    /// Delay decision for the given duration (millisecond precision).
    pub fn delay(duration: Duration) -> Self {
        Decision::Delay {
            delay_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// The delay to apply before connecting, if any.
    pub fn delay_duration(&self) -> Option<Duration> {
        match self {
            Decision::Delay { delay_ms } => Some(Duration::from_millis(*delay_ms)),
            _ => None,
        }
    }

    /// Whether a real connection will eventually be attempted.
    pub fn reaches_network(&self) -> bool {
        matches!(self, Decision::Open | Decision::Delay { .. })
    }

    /// Build a decision from its textual status.
    ///
    /// `delay_ms` is required for `delay` and rejected for every other status.
    pub fn parse(status: &str, delay_ms: Option<u64>) -> PolicyResult<Self> {
        let status = status.trim().to_ascii_lowercase();
        let decision = match status.as_str() {
            "open" => Decision::Open,
            "closed" => Decision::Closed,
            "discard" => Decision::Discard,
            "delay" => {
                return delay_ms
                    .map(|delay_ms| Decision::Delay { delay_ms })
                    .ok_or_else(|| PolicyError::Ambiguous {
                        address: String::new(),
                        message: "status 'delay' requires delay_ms".to_string(),
                    });
            }
            _ => return Err(PolicyError::UnknownStatus(status)),
        };

        if delay_ms.is_some() {
            return Err(PolicyError::Ambiguous {
                address: String::new(),
                message: format!("delay_ms given for status '{}'", status),
            });
        }
        Ok(decision)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Open => write!(f, "open"),
            Decision::Closed => write!(f, "closed"),
            Decision::Discard => write!(f, "discard"),
            Decision::Delay { delay_ms } => write!(f, "delay({}ms)", delay_ms),
        }
    }
}
