use async_trait::async_trait;

use crate::error::{PartitionError, PartitionResult};
use crate::partition_state::{AtomicPartitionState, PartitionLoadUnloadState};
use crate::traits::{Partition, PbsPartition};
use crate::types::{
    GetTransactionManagerStatusRequest, GetTransactionManagerStatusResponse,
    GetTransactionStatusRequest, GetTransactionStatusResponse, PartitionId, PartitionType,
    TransactionPhaseRequest, TransactionPhaseResponse, TransactionRequest, TransactionResponse,
};

/// Placeholder for a partition hosted by another process.
///
/// The owner's address lives in the partition manager's registry entry, not
/// here.
#[derive(Debug)]
pub struct RemotePbsPartition {
    partition_id: PartitionId,
    state: AtomicPartitionState,
}

impl RemotePbsPartition {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            state: AtomicPartitionState::new(partition_id),
        }
    }
}

#[async_trait]
impl Partition for RemotePbsPartition {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn partition_type(&self) -> PartitionType {
        PartitionType::Remote
    }

    async fn init(&self) -> PartitionResult<()> {
        self.state.store(PartitionLoadUnloadState::Initialized);
        Ok(())
    }

    async fn load(&self) -> PartitionResult<()> {
        self.state.store(PartitionLoadUnloadState::Loaded);
        Ok(())
    }

    async fn unload(&self) -> PartitionResult<()> {
        self.state.store(PartitionLoadUnloadState::Unloaded);
        Ok(())
    }

    fn state(&self) -> PartitionLoadUnloadState {
        self.state.load()
    }
}

#[async_trait]
impl PbsPartition for RemotePbsPartition {
    async fn execute_transaction(
        &self,
        _request: TransactionRequest,
    ) -> PartitionResult<TransactionResponse> {
        Err(PartitionError::RemoteCannotHandleRequest)
    }

    async fn execute_transaction_phase(
        &self,
        _request: TransactionPhaseRequest,
    ) -> PartitionResult<TransactionPhaseResponse> {
        Err(PartitionError::RemoteCannotHandleRequest)
    }

    async fn get_transaction_status(
        &self,
        _request: GetTransactionStatusRequest,
    ) -> PartitionResult<GetTransactionStatusResponse> {
        Err(PartitionError::RemoteCannotHandleRequest)
    }

    async fn get_transaction_manager_status(
        &self,
        _request: GetTransactionManagerStatusRequest,
    ) -> PartitionResult<GetTransactionManagerStatusResponse> {
        Err(PartitionError::RemoteCannotHandleRequest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_always_succeeds() {
        let p = RemotePbsPartition::new(PartitionId::from_words(9, 9));
        p.init().await.unwrap();
        p.load().await.unwrap();
        assert_eq!(p.state(), PartitionLoadUnloadState::Loaded);
        p.unload().await.unwrap();
        assert_eq!(p.state(), PartitionLoadUnloadState::Unloaded);
        p.unload().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_are_retryable_refusals() {
        let p = RemotePbsPartition::new(PartitionId::from_words(9, 9));
        p.init().await.unwrap();
        p.load().await.unwrap();

        let err = p
            .get_transaction_manager_status(GetTransactionManagerStatusRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PartitionError::RemoteCannotHandleRequest));
        assert!(err.is_retryable());
        assert_eq!(p.partition_type(), PartitionType::Remote);
    }
}
