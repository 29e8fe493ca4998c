use thiserror::Error;

use crate::cache::CacheError;

/// Errors surfaced by the session manager and session records
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Too many active sessions: {active} active, maximum is {max}")]
    CapacityExceeded { active: usize, max: usize },

    #[error("Failed to acquire ownership of session {id}: {reason}")]
    OwnershipAcquisitionFailed { id: String, reason: String },

    #[error("Failed to replicate session {id}: {source}")]
    ReplicationFailed {
        id: String,
        #[source]
        source: CacheError,
    },

    #[error("Session {0} has already been invalidated")]
    InvalidSession(String),

    #[error("Session manager is not accepting requests")]
    NotAcceptingRequests,

    #[error("Distributed cache error: {0}")]
    Cache(#[from] CacheError),
}

impl SessionError {
    /// Whether the caller should answer with a "too busy" response
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, SessionError::CapacityExceeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SessionError::CapacityExceeded { active: 2, max: 2 };
        assert!(err.is_capacity_exceeded());
        assert_eq!(
            err.to_string(),
            "Too many active sessions: 2 active, maximum is 2"
        );

        let err: SessionError = CacheError::Unavailable("down".to_string()).into();
        assert!(!err.is_capacity_exceeded());
        assert!(err.to_string().contains("down"));
    }
}
