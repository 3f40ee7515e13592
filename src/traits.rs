//! Traits at the seams between the lifecycle coordinator and its
//! collaborators.
//!
//! # Trait Hierarchy
//!
//! - [`Partition`]: lifecycle of one partition (init/load/unload/state)
//! - [`PbsPartition`]: a partition that can also execute budget requests
//! - [`PartitionManager`]: registry of partitions hosted or tracked here
//! - [`PbsPartitionManager`]: manager that hands out [`PbsPartition`] handles
//! - [`PartitionNamespace`]: resource id to partition id mapping
//! - [`LeaseEventSink`]: receiver of lease transitions from the lease manager
//!
//! Consumed from outside:
//!
//! - [`LeaseReleaseNotification`]: told when a lease may be released
//! - [`LeaseAcquisitionPreferenceSetter`]: accepts a target lease count
//! - [`LeaseStatistics`]: reports how many vnode leases are held
//! - [`PartitionComponent`] and its refinements: the services a local
//!   partition owns, built by a [`PartitionServicesFactory`]

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PartitionResult;
use crate::partition_state::PartitionLoadUnloadState;
use crate::types::{
    GetTransactionManagerStatusRequest, GetTransactionManagerStatusResponse,
    GetTransactionStatusRequest, GetTransactionStatusResponse, LeasableLockId,
    LeaseAcquisitionPreference, LeaseInfo, LeaseTransitionType, LocalPartitionSettings,
    PartitionAddressUri, PartitionId, PartitionMetadata, PartitionType, TransactionPhaseRequest,
    TransactionPhaseResponse, TransactionRequest, TransactionResponse,
};

// ============================================================================
// Partitions
// ============================================================================

/// Lifecycle of a single partition.
///
/// Each step is a compare-and-swap on the partition's state; calling a step
/// from the wrong state fails with `InvalidState` instead of blocking.
#[async_trait]
pub trait Partition: Send + Sync {
    fn partition_id(&self) -> PartitionId;

    fn partition_type(&self) -> PartitionType;

    /// Created -> Initialized.
    async fn init(&self) -> PartitionResult<()>;

    /// Initialized -> Loading -> Loaded. May be slow (journal recovery).
    async fn load(&self) -> PartitionResult<()>;

    /// Loaded -> Unloading -> Unloaded. Stops every partition-owned service.
    async fn unload(&self) -> PartitionResult<()>;

    fn state(&self) -> PartitionLoadUnloadState;
}

/// A partition that executes budget transaction requests.
#[async_trait]
pub trait PbsPartition: Partition {
    async fn execute_transaction(
        &self,
        request: TransactionRequest,
    ) -> PartitionResult<TransactionResponse>;

    async fn execute_transaction_phase(
        &self,
        request: TransactionPhaseRequest,
    ) -> PartitionResult<TransactionPhaseResponse>;

    async fn get_transaction_status(
        &self,
        request: GetTransactionStatusRequest,
    ) -> PartitionResult<GetTransactionStatusResponse>;

    async fn get_transaction_manager_status(
        &self,
        request: GetTransactionManagerStatusRequest,
    ) -> PartitionResult<GetTransactionManagerStatusResponse>;
}

// ============================================================================
// Partition manager
// ============================================================================

/// Registry of partitions loaded in this process.
#[async_trait]
pub trait PartitionManager: Send + Sync {
    async fn init(&self) -> PartitionResult<()>;

    async fn run(&self) -> PartitionResult<()>;

    /// Stop accepting loads and unload everything still registered.
    async fn stop(&self) -> PartitionResult<()>;

    async fn load_partition(&self, metadata: &PartitionMetadata) -> PartitionResult<()>;

    async fn unload_partition(&self, metadata: &PartitionMetadata) -> PartitionResult<()>;

    /// Replace the address recorded for a registered partition.
    async fn refresh_partition_address(&self, metadata: &PartitionMetadata)
    -> PartitionResult<()>;

    async fn get_partition_address(
        &self,
        partition_id: PartitionId,
    ) -> PartitionResult<PartitionAddressUri>;

    fn get_partition_type(&self, partition_id: PartitionId) -> PartitionResult<PartitionType>;

    fn get_partition(&self, partition_id: PartitionId) -> PartitionResult<Arc<dyn Partition>>;
}

/// Partition manager that also hands out request-capable partitions.
pub trait PbsPartitionManager: PartitionManager {
    fn get_pbs_partition(&self, partition_id: PartitionId)
    -> PartitionResult<Arc<dyn PbsPartition>>;
}

// ============================================================================
// Namespace
// ============================================================================

/// Maps application resource ids onto the fixed partition set.
pub trait PartitionNamespace: Send + Sync {
    /// Pure: the same resource id always yields the same member of
    /// [`partitions`](Self::partitions).
    fn map_resource_to_partition(&self, resource_id: &str) -> PartitionId;

    fn partitions(&self) -> &[PartitionId];
}

// ============================================================================
// Lease manager seams
// ============================================================================

/// Receiver of lease transitions for individual locks.
#[async_trait]
pub trait LeaseEventSink: Send + Sync {
    async fn on_lease_transition(
        &self,
        lock_id: LeasableLockId,
        transition: LeaseTransitionType,
        owner_info: Option<LeaseInfo>,
    );
}

/// Told when this process has finished with a lease it intends to release.
pub trait LeaseReleaseNotification: Send + Sync {
    fn safe_to_release_lease(&self, lock_id: LeasableLockId);
}

pub trait LeaseAcquisitionPreferenceSetter: Send + Sync {
    fn set_lease_acquisition_preference(
        &self,
        preference: LeaseAcquisitionPreference,
    ) -> PartitionResult<()>;
}

pub trait LeaseStatistics: Send + Sync {
    fn currently_leased_locks_count(&self) -> usize;
}

// ============================================================================
// Partition-owned services
// ============================================================================

/// Lifecycle shared by every service a local partition owns.
#[async_trait]
pub trait PartitionComponent: Send + Sync {
    async fn init(&self) -> PartitionResult<()>;

    async fn run(&self) -> PartitionResult<()>;

    async fn stop(&self) -> PartitionResult<()>;
}

/// Write-ahead journal backing a partition.
#[async_trait]
pub trait JournalService: PartitionComponent {
    /// Replay the journal. Resolves once recovery has finished.
    async fn recover(&self) -> PartitionResult<()>;
}

pub trait BudgetKeyProvider: PartitionComponent {}

pub trait CheckpointService: PartitionComponent {}

/// Executes budget transactions once the partition is loaded.
#[async_trait]
pub trait TransactionManager: PartitionComponent {
    async fn execute(&self, request: TransactionRequest) -> PartitionResult<TransactionResponse>;

    async fn execute_phase(
        &self,
        request: TransactionPhaseRequest,
    ) -> PartitionResult<TransactionPhaseResponse>;

    async fn get_transaction_status(
        &self,
        request: GetTransactionStatusRequest,
    ) -> PartitionResult<GetTransactionStatusResponse>;

    async fn get_status(
        &self,
        request: GetTransactionManagerStatusRequest,
    ) -> PartitionResult<GetTransactionManagerStatusResponse>;
}

/// Services owned by one local partition.
#[derive(Clone)]
pub struct PartitionServices {
    pub journal: Arc<dyn JournalService>,
    pub budget_key_provider: Arc<dyn BudgetKeyProvider>,
    pub transaction_manager: Arc<dyn TransactionManager>,
    pub checkpoint: Arc<dyn CheckpointService>,
}

/// Builds the services for a local partition.
pub trait PartitionServicesFactory: Send + Sync {
    fn create(
        &self,
        partition_id: PartitionId,
        settings: &LocalPartitionSettings,
    ) -> PartitionResult<PartitionServices>;
}
