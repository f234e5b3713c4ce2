//! Error taxonomy for the sync engine.
//!
//! Every failure maps to one of four recovery behaviours:
//! - permission denied: surfaced, tracking stays disabled
//! - network/transient: sample stays queued or the poll cycle is skipped
//! - not found: triggers pruning of the deleted entity, never surfaced
//! - storage: logged, in-memory operation continues

use thiserror::Error;

use crate::api::PermissionLevel;

/// Errors produced by the sync engine and its collaborators.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The platform refused location access at the requested level.
    #[error("location permission denied ({0:?})")]
    PermissionDenied(PermissionLevel),

    /// Transport or server failure; the next trigger retries.
    #[error("network error: {0}")]
    Network(String),

    /// The entity no longer exists upstream.
    #[error("not found: {0}")]
    NotFound(String),

    /// Durable storage failed to read or write.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The sensor could not produce a fix.
    #[error("location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    /// True when the upstream entity was deleted.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }

    /// True for failures the next scheduled trigger can recover from on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Storage(_) | SyncError::LocationUnavailable(_)
        )
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Network(e.to_string())
    }
}

/// Result type for sync engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SyncError::NotFound("event-1".into()).is_not_found());
        assert!(!SyncError::NotFound("event-1".into()).is_transient());
        assert!(SyncError::Network("timeout".into()).is_transient());
        assert!(!SyncError::PermissionDenied(PermissionLevel::Background).is_transient());
    }

    #[test]
    fn test_io_error_converts_to_storage() {
        let err: SyncError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert!(matches!(err, SyncError::Storage(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
