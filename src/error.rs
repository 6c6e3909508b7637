//! Error taxonomy for the offline-resilience layer.
//!
//! None of these are fatal to the process. Network-class errors are recovered
//! by fallback paths (cache, local engine); `NoDetectorAvailable` and
//! `SyncDropped` surface to the user as non-fatal notices; `CacheWriteFailed`
//! downgrades the affected operation to "continue without persistence".

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum OfflineError {
    /// The network could not be reached (DNS, connect, reset, offline).
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// A network-bound operation exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The remote answered with a non-2xx status.
    #[error("backend rejected request with status {status}")]
    BackendRejected { status: u16 },

    /// The remote answered 2xx but the body was unusable.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Neither the remote backend nor a loaded local engine can serve detection.
    #[error("no detector available")]
    NoDetectorAvailable,

    /// Cache storage could not be written (or read back).
    #[error("cache write failed: {0}")]
    CacheWriteFailed(String),

    /// A sync task exceeded its retry cap and was dropped.
    #[error("sync task {task_id} ({kind}) dropped after {attempts} attempts")]
    SyncDropped {
        task_id: String,
        kind: String,
        attempts: u32,
    },
}

impl OfflineError {
    /// Whether this error is one of the network-class failures that callers
    /// recover from via a fallback path.
    pub fn is_recoverable_network(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable(_) | Self::Timeout(_) | Self::BackendRejected { .. }
        )
    }

    /// Whether the remote could not be reached at all. An HTTP status, even
    /// an error status, means it could.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::NetworkUnavailable(_) | Self::Timeout(_))
    }

    /// Map a transport error, distinguishing deadline expiry.
    pub fn from_reqwest(err: &reqwest::Error, deadline: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(deadline)
        } else if err.is_decode() {
            Self::MalformedPayload(err.to_string())
        } else if let Some(status) = err.status() {
            Self::BackendRejected {
                status: status.as_u16(),
            }
        } else {
            Self::NetworkUnavailable(err.to_string())
        }
    }
}

impl From<rusqlite::Error> for OfflineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::CacheWriteFailed(err.to_string())
    }
}

pub type OfflineResult<T> = Result<T, OfflineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_class_errors_are_recoverable() {
        assert!(OfflineError::NetworkUnavailable("down".into()).is_recoverable_network());
        assert!(OfflineError::Timeout(Duration::from_secs(1)).is_recoverable_network());
        assert!(OfflineError::BackendRejected { status: 503 }.is_recoverable_network());
    }

    #[test]
    fn non_network_errors_are_not_recoverable() {
        assert!(!OfflineError::MalformedPayload("x".into()).is_recoverable_network());
        assert!(!OfflineError::NoDetectorAvailable.is_recoverable_network());
        assert!(!OfflineError::CacheWriteFailed("disk".into()).is_recoverable_network());
    }

    #[test]
    fn only_transport_failures_are_unreachable() {
        assert!(OfflineError::Timeout(Duration::from_secs(1)).is_unreachable());
        assert!(OfflineError::NetworkUnavailable("down".into()).is_unreachable());
        assert!(!OfflineError::BackendRejected { status: 404 }.is_unreachable());
    }

    #[test]
    fn sync_dropped_message_names_task() {
        let err = OfflineError::SyncDropped {
            task_id: "t-1".into(),
            kind: "feedback".into(),
            attempts: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("t-1"));
        assert!(msg.contains("5 attempts"));
    }

    #[test]
    fn sqlite_errors_map_to_cache_write_failed() {
        let err: OfflineError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, OfflineError::CacheWriteFailed(_)));
    }
}
