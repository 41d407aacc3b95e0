use crate::entity::SpatialToken;
use thiserror::Error;

/// Errors returned by spatial index writes. Queries never fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("write contention exceeded the retry limit after {attempts} attempts")]
    ContentionExceeded { attempts: u32 },

    #[error("token {token:?} does not reference a live record")]
    UnknownToken { token: SpatialToken },

    #[error("the index write queue is closed")]
    QueueClosed,
}

impl IndexError {
    /// Transient errors may succeed if the whole write is retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexError::ContentionExceeded { .. })
    }
}
