use thiserror::Error;

use super::backend::BackendError;
use crate::context::ContextError;
use crate::encoding::EncodingError;

/// Errors returned by key-value operations.
#[derive(Debug, Error)]
pub enum KvError {
    /// An operation ran before `setup` resolved the encoding.
    #[error("key-value capability is not set up")]
    NotSetUp,

    /// The connection or bucket could not be established.
    #[error("key-value backend not resolved: {0}")]
    NotResolved(#[source] BackendError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("key-value backend error: {0}")]
    Backend(#[source] BackendError),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// An attached authorizer refused the call.
    #[error("not authorized to {method} {key}")]
    Unauthorized { method: String, key: String },
}

impl KvError {
    /// Whether retrying the same call later could succeed.
    ///
    /// Missing keys, conflicts and undecodable values are permanent;
    /// an unreachable backend and an expired deadline are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::NotResolved(e) | KvError::Backend(e) => e.is_transient(),
            KvError::DeadlineExceeded => true,
            _ => false,
        }
    }

    /// Map a data-path backend error, turning key-level conditions into
    /// their dedicated variants.
    pub(crate) fn from_backend(err: BackendError) -> Self {
        match err {
            BackendError::KeyNotFound(key) => KvError::NotFound(key),
            BackendError::KeyExists(key) => KvError::AlreadyExists(key),
            other => KvError::Backend(other),
        }
    }
}

impl From<ContextError> for KvError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => KvError::Cancelled,
            ContextError::DeadlineExceeded => KvError::DeadlineExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(KvError::NotResolved(BackendError::Unavailable("down".into())).is_retryable());
        assert!(KvError::Backend(BackendError::Closed).is_retryable());
        assert!(KvError::DeadlineExceeded.is_retryable());

        assert!(!KvError::NotFound("k".into()).is_retryable());
        assert!(!KvError::AlreadyExists("k".into()).is_retryable());
        assert!(!KvError::Encoding(EncodingError::Shape("x".into())).is_retryable());
        assert!(!KvError::NotResolved(BackendError::InvalidBucketName("a.b".into())).is_retryable());
    }

    #[test]
    fn test_backend_mapping() {
        assert!(matches!(
            KvError::from_backend(BackendError::KeyNotFound("k".into())),
            KvError::NotFound(k) if k == "k"
        ));
        assert!(matches!(
            KvError::from_backend(BackendError::KeyExists("k".into())),
            KvError::AlreadyExists(_)
        ));
        assert!(matches!(
            KvError::from_backend(BackendError::BucketFull("b".into())),
            KvError::Backend(BackendError::BucketFull(_))
        ));
    }
}
