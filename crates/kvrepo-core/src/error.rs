//! Error types for the repository engine.
//!
//! [`RepoError`] is the single error type callers see. Store and codec
//! failures are carried through unchanged so callers can match on the
//! original kind; [`RepoError::is_retryable`] is the classification the
//! retry layer uses.

use kvrepo_store::StoreError;
use kvrepo_types::{CodecError, SlotError};

use crate::batch::BatchState;

/// Errors that can occur in repository operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RepoError {
    /// A store call failed. Transient kinds are retried by [`RetryPolicy`].
    ///
    /// [`RetryPolicy`]: crate::retry::RetryPolicy
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A pool connection could not be established.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        /// Endpoint description (credentials stripped).
        endpoint: String,
        /// The underlying store error.
        source: StoreError,
    },

    /// A stored value could not be decoded as the requested type.
    #[error("decode error: {0}")]
    Decode(#[from] CodecError),

    /// A script handle was reported missing again right after reloading it.
    #[error("script {sha} not found after reload")]
    ScriptEvicted {
        /// Handle returned by the reload.
        sha: String,
    },

    /// The store refused to commit a transaction batch.
    #[error("could not commit transaction")]
    CommitFailed,

    /// A batch method was called in the wrong lifecycle state.
    #[error("batch is {found:?}, expected {expected:?}")]
    InvalidState {
        /// State the call requires.
        expected: BatchState,
        /// State the batch is in.
        found: BatchState,
    },

    /// A deferred result was read before its batch executed.
    #[error("result read before the batch executed")]
    ResultPending,

    /// A deferred result belongs to a batch that was restarted.
    #[error("result discarded by a restarted batch")]
    ResultDiscarded,

    /// The pool has been shut down.
    #[error("connection pool is shut down")]
    PoolShutDown,

    /// A caller-supplied argument cannot be used.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The repository configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Several independent failures, e.g. from closing every pool connection.
    #[error("{} errors, first: {}", .0.len(), .0.first().map_or_else(String::new, ToString::to_string))]
    Aggregate(Vec<Self>),
}

impl RepoError {
    /// Returns `true` if repeating the failed call could succeed.
    ///
    /// Timeouts and transient store errors are retryable, as is an
    /// aggregate holding at least one of them and nothing fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(err) => err.is_transient(),
            Self::Aggregate(errors) => {
                !errors.iter().any(Self::is_fatal) && errors.iter().any(Self::is_retryable)
            }
            _ => false,
        }
    }

    /// Out-of-memory class failures, which poison any aggregate they appear in.
    fn is_fatal(&self) -> bool {
        match self {
            Self::Store(StoreError::ResourceExhausted(_)) => true,
            Self::Aggregate(errors) => errors.iter().any(Self::is_fatal),
            _ => false,
        }
    }
}

impl From<SlotError> for RepoError {
    fn from(err: SlotError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_follow_transience() {
        assert!(RepoError::Store(StoreError::Timeout).is_retryable());
        assert!(RepoError::Store(StoreError::Io("reset".to_owned())).is_retryable());
        assert!(!RepoError::Store(StoreError::Closed).is_retryable());
        assert!(!RepoError::Store(StoreError::NoScript("x".to_owned())).is_retryable());
        assert!(!RepoError::CommitFailed.is_retryable());
        assert!(!RepoError::Decode(CodecError::ErrorReply("x".to_owned())).is_retryable());
    }

    #[test]
    fn aggregates_need_a_retryable_member_and_no_fatal_one() {
        let transient = RepoError::Store(StoreError::Timeout);
        let fatal = RepoError::Store(StoreError::ResourceExhausted("OOM".to_owned()));
        let other = RepoError::InvalidArgument("x".to_owned());

        assert!(RepoError::Aggregate(vec![transient.clone(), other.clone()]).is_retryable());
        assert!(!RepoError::Aggregate(vec![transient.clone(), fatal.clone()]).is_retryable());
        assert!(!RepoError::Aggregate(vec![other]).is_retryable());
        assert!(
            !RepoError::Aggregate(vec![transient, RepoError::Aggregate(vec![fatal])])
                .is_retryable()
        );
    }

    #[test]
    fn aggregate_message_names_the_first_error() {
        let err = RepoError::Aggregate(vec![RepoError::CommitFailed, RepoError::PoolShutDown]);
        assert_eq!(err.to_string(), "2 errors, first: could not commit transaction");
    }
}
