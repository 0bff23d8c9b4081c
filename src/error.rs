//! Error taxonomy surfaced to callers of the store.

use thiserror::Error;

/// Errors surfaced by timeline operations.
///
/// Everything except [`StoreError::Overloaded`] is mapped to a retryable
/// write job by the replicating shard; `Overloaded` is backpressure and is
/// handed straight back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Submitting the call would push the client past its pipeline limit.
    #[error("client pipeline is full")]
    Overloaded,
    /// A pooled connection could not be produced within the pool timeout.
    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,
    /// Every client for the host is gone and the host is in its disable window.
    #[error("host is disabled")]
    HostDown,
    /// The shutdown drain gave up waiting for this call's response. During
    /// normal operation a slow response is re-polled, not timed out.
    #[error("call timed out")]
    CallTimeout,
    /// The store reported a failure for this call. The connection stays up.
    #[error("store error: {0}")]
    StoreExecution(String),
    /// The connection produced garbage or died. The owning client is dead.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Whether a failed write with this error should be requeued as a job.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Overloaded)
    }
}
