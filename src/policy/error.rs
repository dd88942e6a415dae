//! Policy configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while configuring address policy.
///
/// These are always reported to whoever is configuring the registry, at the
/// point of configuration. Connection attempts never observe them.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Host pattern was empty.
    #[error("Host pattern must not be empty")]
    EmptyHost,

    /// Port outside the accepted range.
    #[error("Invalid port '{0}': expected 0-65535, or -1 for any port")]
    InvalidPort(String),

    /// Address pattern could not be parsed.
    #[error("Invalid address pattern '{0}'")]
    InvalidAddress(String),

    /// Unknown decision status.
    #[error("Unknown policy status '{0}': expected open, closed, discard or delay")]
    UnknownStatus(String),

    /// Entry specifies conflicting values for the same setting.
    #[error("Ambiguous policy entry for '{address}': {message}")]
    Ambiguous {
        /// Address the entry was for.
        address: String,
        /// What conflicts.
        message: String,
    },

    /// Failed to read or write a persisted policy file.
    #[error("Failed to access policy file {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Persisted policy could not be (de)serialized.
    #[error("Invalid persisted policy: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PolicyError {
    /// Attach the configured address to an ambiguity error.
    pub fn for_address(self, address: &str) -> Self {
        match self {
            PolicyError::Ambiguous { message, .. } => PolicyError::Ambiguous {
                address: address.to_string(),
                message,
            },
            other => other,
        }
    }
}

/// Result type for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PolicyError::InvalidPort("70000".to_string());
        assert!(err.to_string().contains("70000"));
        assert!(err.to_string().contains("-1"));

        let err = PolicyError::Ambiguous {
            address: "db.local:5432".to_string(),
            message: "delay_ms given for status 'closed'".to_string(),
        };
        assert!(err.to_string().contains("db.local:5432"));
        assert!(err.to_string().contains("delay_ms"));
    }
}
