//! Transport error taxonomy.
//!
//! The `Transient`/`Permanent` split drives everything above this layer:
//! transient errors are retried with backoff, permanent errors fail the call
//! immediately (and, on the primary transport, trigger failover).
//! [`RouterError::is_retryable`] is the single source of truth for that
//! classification.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    /// The call did not complete within its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Connection refused/reset, or the peer is unreachable.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The router answered with a server-side failure (5xx or equivalent).
    #[error("router-side failure: {0}")]
    Server(String),
    /// Credentials were rejected.
    #[error("authentication rejected by router")]
    Auth,
    /// The router refused the request (4xx or a CLI usage error).
    #[error("request rejected: {0}")]
    Rejected(String),
    /// The named queue or rule does not exist on the router.
    #[error("not found on router: {0}")]
    NotFound(String),
    /// The router's answer could not be decoded.
    #[error("malformed router response: {0}")]
    Schema(String),
}

impl RouterError {
    /// Whether a retry with backoff can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RouterError::Timeout(_) | RouterError::Connection(_) | RouterError::Server(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(RouterError::Timeout(Duration::from_secs(15)).is_retryable());
        assert!(RouterError::Connection("reset by peer".into()).is_retryable());
        assert!(RouterError::Server("500 internal error".into()).is_retryable());
    }

    #[test]
    fn permanent_errors_are_not() {
        assert!(!RouterError::Auth.is_retryable());
        assert!(!RouterError::Rejected("400 bad request".into()).is_retryable());
        assert!(!RouterError::NotFound("wan1-download".into()).is_retryable());
        assert!(!RouterError::Schema("missing field".into()).is_retryable());
    }
}
