//! # Error Types
//!
//! The error kinds named in the error-handling design: `UserServiceUnavailable`
//! breaks the targeting circuit breaker and does not roll back the base
//! broadcast row; `ResourceNotFound` maps to 404/ack-and-log; `MessageProcessing`
//! triggers consumer retry then DLT; `TransientCache` is logged and the caller
//! continues; `DataIntegrityViolation` is the idempotence path on unique-key
//! collisions; `Serialization` routes to a synthetic DLT record.

use thiserror::Error;

pub type BroadcastResult<T> = Result<T, BroadcastError>;

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("user service unavailable: {0}")]
    UserServiceUnavailable(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("message processing failed: {0}")]
    MessageProcessing(String),

    #[error("transient cache error: {0}")]
    TransientCache(String),

    #[error("data integrity violation: {0}")]
    DataIntegrityViolation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("illegal state transition: {0}")]
    IllegalTransition(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("configuration error: {0}")]
    Configuration(#[from] config::ConfigError),
}

impl BroadcastError {
    /// Whether a consumer encountering this error should retry before DLT,
    /// vs. ack-and-log immediately (ResourceNotFound, TransientCache,
    /// DataIntegrityViolation are all terminal-for-this-attempt but not
    /// DLT-worthy).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BroadcastError::MessageProcessing(_)
                | BroadcastError::Database(_)
                | BroadcastError::Cache(_)
        )
    }

    /// HTTP status code for the admin/user-facing surfaces.
    pub fn http_status(&self) -> u16 {
        match self {
            BroadcastError::ResourceNotFound(_) => 404,
            BroadcastError::IllegalTransition(_) => 409,
            BroadcastError::UserServiceUnavailable(_) => 503,
            BroadcastError::DataIntegrityViolation(_) => 409,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_are_message_processing_or_io() {
        assert!(BroadcastError::MessageProcessing("boom".into()).is_retryable());
        assert!(!BroadcastError::ResourceNotFound("42".into()).is_retryable());
        assert!(!BroadcastError::DataIntegrityViolation("dup".into()).is_retryable());
    }

    #[test]
    fn http_status_matches_spec_table() {
        assert_eq!(
            BroadcastError::ResourceNotFound("x".into()).http_status(),
            404
        );
        assert_eq!(
            BroadcastError::IllegalTransition("x".into()).http_status(),
            409
        );
        assert_eq!(
            BroadcastError::UserServiceUnavailable("x".into()).http_status(),
            503
        );
    }
}
