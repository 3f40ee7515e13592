//! Core value types shared by partitions, the partition manager and the
//! lease event sink.
//!
//! # Identifiers
//!
//! A [`PartitionId`] is an opaque 128-bit identifier. The lease manager uses
//! the same identifier for the leasable lock guarding the partition, so
//! [`LeasableLockId`] is an alias rather than a separate type.
//!
//! ```rust
//! use pbs_partitions::types::PartitionId;
//!
//! let id = PartitionId::from_words(11, 22);
//! let parsed: PartitionId = id.to_string().parse().unwrap();
//! assert_eq!(id, parsed);
//! ```

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Opaque 128-bit partition identifier (two 64-bit words).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(Uuid);

impl PartitionId {
    /// The all-zero identifier.
    pub const ZERO: PartitionId = PartitionId(Uuid::nil());

    /// Build an identifier from its high and low 64-bit words.
    pub const fn from_words(high: u64, low: u64) -> Self {
        PartitionId(Uuid::from_u64_pair(high, low))
    }

    /// Generate a random identifier.
    pub fn random() -> Self {
        PartitionId(Uuid::new_v4())
    }

    /// High and low 64-bit words.
    pub fn as_words(&self) -> (u64, u64) {
        self.0.as_u64_pair()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for PartitionId {
    fn from(value: Uuid) -> Self {
        PartitionId(value)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for PartitionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(PartitionId)
    }
}

/// Lock identifier used by the lease manager. Equal to the partition id.
pub type LeasableLockId = PartitionId;

/// Whether a partition is hosted by this process or elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionType {
    /// Hosted and served by this process.
    Local,
    /// Hosted by another process; only its address is tracked here.
    Remote,
}

impl PartitionType {
    /// Label used for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionType::Local => "local",
            PartitionType::Remote => "remote",
        }
    }
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint of the process currently hosting a partition.
pub type PartitionAddressUri = String;

/// Describes a partition for load/unload/refresh operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub partition_id: PartitionId,
    pub partition_type: PartitionType,
    /// Empty for local partitions.
    pub partition_address_uri: PartitionAddressUri,
}

impl PartitionMetadata {
    pub fn new(
        partition_id: PartitionId,
        partition_type: PartitionType,
        partition_address_uri: impl Into<PartitionAddressUri>,
    ) -> Self {
        Self {
            partition_id,
            partition_type,
            partition_address_uri: partition_address_uri.into(),
        }
    }

    /// Metadata for a partition hosted by this process.
    pub fn local(partition_id: PartitionId) -> Self {
        Self::new(partition_id, PartitionType::Local, "")
    }

    /// Metadata for a partition hosted at `address`.
    pub fn remote(partition_id: PartitionId, address: impl Into<PartitionAddressUri>) -> Self {
        Self::new(partition_id, PartitionType::Remote, address)
    }

    pub fn id(&self) -> PartitionId {
        self.partition_id
    }
}

/// Settings every local partition is built with. Read once by the partition
/// manager's `init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPartitionSettings {
    pub journal_bucket_name: String,
    /// Maximum number of concurrent transactions on the partition.
    pub transaction_manager_capacity: u64,
}

/// Lease transitions reported by the lease manager for a single lock.
///
/// Ungraceful sequence: NotAcquired* → Acquired → Renewed* → Lost → NotAcquired*.
/// Graceful sequence: NotAcquired* → Acquired → Renewed* →
/// RenewedWithIntentionToRelease+ → Released → NotAcquired*.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LeaseTransitionType {
    /// Someone else holds the lease, or nobody could acquire it.
    NotAcquired = 1,
    /// This process just acquired the lease.
    Acquired = 2,
    /// The lease expired or was taken over while held.
    Lost = 3,
    /// The lease was extended while held.
    Renewed = 4,
    /// The lease was extended, and will be released once the holder signals
    /// it is safe to do so.
    RenewedWithIntentionToRelease = 5,
    /// A graceful release completed.
    Released = 6,
}

impl LeaseTransitionType {
    /// Label used for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseTransitionType::NotAcquired => "not_acquired",
            LeaseTransitionType::Acquired => "acquired",
            LeaseTransitionType::Lost => "lost",
            LeaseTransitionType::Renewed => "renewed",
            LeaseTransitionType::RenewedWithIntentionToRelease => {
                "renewed_with_intention_to_release"
            }
            LeaseTransitionType::Released => "released",
        }
    }
}

impl fmt::Display for LeaseTransitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a lease holder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaseInfo {
    pub lease_acquirer_id: String,
    /// Address of the budget service endpoint run by the holder.
    pub service_endpoint_address: String,
}

impl LeaseInfo {
    pub fn new(
        lease_acquirer_id: impl Into<String>,
        service_endpoint_address: impl Into<String>,
    ) -> Self {
        Self {
            lease_acquirer_id: lease_acquirer_id.into(),
            service_endpoint_address: service_endpoint_address.into(),
        }
    }
}

/// Target pushed to the lease manager by the preference applier.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaseAcquisitionPreference {
    pub maximum_number_of_leases_to_hold: usize,
    /// When empty, leases may be acquired on any lock.
    pub preferred_locks_to_acquire_leases_on: Vec<LeasableLockId>,
}

// ============================================================================
// Transaction requests
// ============================================================================
//
// Request execution itself belongs to the transaction manager. These types only
// carry what a partition needs to validate and forward a request.

/// Phase of a two-phase-commit style budget transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    Begin,
    Prepare,
    Commit,
    Notify,
    Abort,
    End,
}

/// A single budget consumption command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeBudgetCommand {
    pub budget_key_name: String,
    pub time_bucket: u64,
    pub token_count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub transaction_id: Uuid,
    pub commands: Vec<ConsumeBudgetCommand>,
    pub transaction_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionResponse {
    pub transaction_id: Uuid,
    pub last_execution_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionPhaseRequest {
    pub transaction_id: Uuid,
    pub transaction_phase: TransactionPhase,
    pub last_execution_timestamp: u64,
    pub transaction_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionPhaseResponse {
    pub last_execution_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetTransactionStatusRequest {
    pub transaction_id: Uuid,
    pub transaction_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetTransactionStatusResponse {
    pub has_failure: bool,
    pub is_expired: bool,
    pub last_execution_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetTransactionManagerStatusRequest {
    pub application_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetTransactionManagerStatusResponse {
    pub pending_transactions_count: u64,
}
