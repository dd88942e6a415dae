//! Interception error types.

use std::io;
use thiserror::Error;

/// Text contained in every policy refusal message.
///
/// Tests can rely on it to tell a refusal by policy apart from a genuine
/// network failure.
pub const REFUSAL_MARKER: &str = "refused by policy";

/// Errors returned when establishing an intercepted connection.
#[derive(Debug, Error)]
pub enum InterceptError {
    /// The address is closed by policy. No network I/O took place.
    #[error("Connection to {address} refused by policy")]
    PolicyRefusal {
        /// Refused address.
        address: String,
    },

    /// The real transport failed to connect.
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        /// Target address.
        address: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The caller's timeout elapsed (including any policy delay).
    #[error("Connection to {address} timed out")]
    Timeout {
        /// Target address.
        address: String,
    },

    /// A policy delay was cancelled before the connection was made.
    #[error("Delayed connection to {address} was cancelled")]
    Cancelled {
        /// Target address.
        address: String,
    },

    /// Target could not be parsed.
    #[error("Invalid connection target '{0}'")]
    InvalidTarget(String),
}

impl InterceptError {
    /// Whether this is a refusal by policy.
    pub fn is_policy_refusal(&self) -> bool {
        matches!(self, InterceptError::PolicyRefusal { .. })
    }

    /// Closest `io::ErrorKind`.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            InterceptError::PolicyRefusal { .. } => io::ErrorKind::ConnectionRefused,
            InterceptError::Connect { source, .. } => source.kind(),
            InterceptError::Timeout { .. } => io::ErrorKind::TimedOut,
            InterceptError::Cancelled { .. } => io::ErrorKind::Interrupted,
            InterceptError::InvalidTarget(_) => io::ErrorKind::InvalidInput,
        }
    }

    pub(crate) fn refusal(address: impl Into<String>) -> Self {
        InterceptError::PolicyRefusal {
            address: address.into(),
        }
    }
}

impl From<InterceptError> for io::Error {
    fn from(err: InterceptError) -> Self {
        io::Error::new(err.kind(), err)
    }
}

/// Whether an `io::Error` is a refusal by policy.
pub fn is_policy_refusal(err: &io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<InterceptError>())
        .is_some_and(InterceptError::is_policy_refusal)
}

/// Result type for interception.
pub type InterceptResult<T> = Result<T, InterceptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refusal_message_contains_marker() {
        let err = InterceptError::refusal("db.local:5432");
        assert!(err.to_string().contains(REFUSAL_MARKER));
        assert!(err.to_string().contains("db.local:5432"));
        assert!(err.is_policy_refusal());
    }

    #[test]
    fn test_io_conversion_keeps_refusal() {
        let io_err: io::Error = InterceptError::refusal("db.local:5432").into();
        assert_eq!(io_err.kind(), io::ErrorKind::ConnectionRefused);
        assert!(io_err.to_string().contains(REFUSAL_MARKER));
        assert!(is_policy_refusal(&io_err));
    }

    #[test]
    fn test_genuine_refusal_not_mistaken_for_policy() {
        let os_err = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(!is_policy_refusal(&os_err));
        assert!(!os_err.to_string().contains(REFUSAL_MARKER));

        let wrapped: io::Error = InterceptError::Connect {
            address: "db.local:5432".to_string(),
            source: os_err,
        }
        .into();
        assert_eq!(wrapped.kind(), io::ErrorKind::ConnectionRefused);
        assert!(!is_policy_refusal(&wrapped));
    }
}
