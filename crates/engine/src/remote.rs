use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use fieldsync_core::{PendingMutation, UserId, WorkOrderId, WorkOrderSnapshot};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("connectivity failure: {0}")]
    Connectivity(String),

    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("rejected by server: {reason}")]
    Rejected { reason: String },

    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl RemoteError {
    /// Connectivity and timeouts leave the mutation queued for another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::Timeout(_))
    }
}

/// The backend's answer to a pushed mutation: its state of the work order
/// after applying it.
#[derive(Debug, Clone, PartialEq)]
pub struct PushAck {
    pub entity_id: WorkOrderId,
    pub server_state: WorkOrderSnapshot,
}

/// The authoritative backend.
///
/// `push_mutation` must be idempotent for a repeated `mutation_id`: a push
/// whose ack was lost is sent again and the backend answers with the state it
/// already produced.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn fetch_assigned_work_orders(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<WorkOrderSnapshot>, RemoteError>;

    async fn push_mutation(
        &self,
        user_id: &UserId,
        mutation: &PendingMutation,
    ) -> Result<PushAck, RemoteError>;

    /// Cheap reachability check.
    async fn probe(&self) -> Result<(), RemoteError>;
}

pub(crate) async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn slow_call_becomes_retryable_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, RemoteError>(())
        };
        let err = with_timeout(Duration::from_secs(10), slow).await.unwrap_err();
        assert_eq!(err, RemoteError::Timeout(Duration::from_secs(10)));
        assert!(err.is_retryable());
    }

    #[test]
    fn rejection_is_final() {
        assert!(!RemoteError::Rejected { reason: "closed".into() }.is_retryable());
        assert!(!RemoteError::Serialization("bad".into()).is_retryable());
        assert!(RemoteError::Connectivity("dns".into()).is_retryable());
    }
}
