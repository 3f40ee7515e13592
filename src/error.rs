//! Error types for partition lifecycle operations.
//!
//! # Outcome Classes
//!
//! Every fallible operation returns [`PartitionResult`]. Callers read the
//! outcome as one of three classes:
//!
//! - **Success**: `Ok(_)`.
//! - **Retry**: an `Err` for which [`PartitionError::is_retryable`] is true. The
//!   condition is transient (the partition is still loading, the partition is
//!   hosted elsewhere, or the manager is not running yet).
//! - **Failure**: any other `Err`. The operation resolved unsuccessfully and any
//!   registry entry it created has already been cleaned up.
//!
//! `AlreadyExists` and `DoesNotExist` are expected under concurrent lease
//! events. [`PartitionError::is_benign_race`] lets callers skip them without
//! matching on variants.
//!
//! # Fatal Conditions
//!
//! Conditions that mean the single-host guarantee may already be broken are
//! not errors. They are [`LeaseSinkViolation`] values and only ever reach the
//! lease event sink's abort path.

use thiserror::Error;

use crate::partition_state::PartitionLoadUnloadState;
use crate::types::{PartitionId, PartitionType};

/// Result type for partition operations.
pub type PartitionResult<T> = Result<T, PartitionError>;

/// Errors returned by partitions, the partition manager and their helpers.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// The component is not between `run()` and `stop()`.
    #[error("Component is not running")]
    NotRunning,

    /// `init()` or `run()` called twice.
    #[error("Component is already running")]
    AlreadyRunning,

    /// A live registry entry already exists for this partition.
    #[error("Partition {0} already exists")]
    AlreadyExists(PartitionId),

    /// No registry entry exists for this partition.
    #[error("Partition {0} does not exist")]
    DoesNotExist(PartitionId),

    /// Init or Load failed. The registry entry has been removed.
    #[error("Failed to load partition {partition_id}: {source}")]
    LoadFailure {
        partition_id: PartitionId,
        source: Box<PartitionError>,
    },

    /// Unload failed. The registry entry is kept.
    #[error("Failed to unload partition {partition_id}: {source}")]
    UnloadFailure {
        partition_id: PartitionId,
        source: Box<PartitionError>,
    },

    /// A state transition lost its compare-and-swap.
    #[error("Cannot {operation} partition {partition_id} in state {state}")]
    InvalidState {
        partition_id: PartitionId,
        operation: &'static str,
        state: PartitionLoadUnloadState,
    },

    /// Address refresh against an entry of the other partition type.
    #[error("Partition {partition_id} is {actual}, expected {expected}")]
    TypeMismatch {
        partition_id: PartitionId,
        expected: PartitionType,
        actual: PartitionType,
    },

    /// Remote partitions only record where the owner is.
    #[error("Remote partitions cannot handle requests locally")]
    RemoteCannotHandleRequest,

    /// The partition exists here but is not serving yet.
    #[error("Partition {0} is not loaded")]
    NotLoaded(PartitionId),

    /// The request carried nothing to execute.
    #[error("Invalid transaction request")]
    InvalidTransaction,

    /// Journal recovery did not complete.
    #[error("Journal recovery failed: {0}")]
    RecoveryFailed(String),

    /// A partition-owned service failed a lifecycle step.
    #[error("{component} failed to {operation}: {message}")]
    Component {
        component: &'static str,
        operation: &'static str,
        message: String,
    },

    /// Missing or malformed configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No vnode leases are held, so no preference can be computed.
    #[error("No vnode leases are currently held")]
    NoLeasesHeld,

    /// Error reported by the transaction manager.
    #[error("Transaction error: {0}")]
    Transaction(String),
}

impl PartitionError {
    pub fn load_failure(partition_id: PartitionId, source: PartitionError) -> Self {
        PartitionError::LoadFailure {
            partition_id,
            source: Box::new(source),
        }
    }

    pub fn unload_failure(partition_id: PartitionId, source: PartitionError) -> Self {
        PartitionError::UnloadFailure {
            partition_id,
            source: Box::new(source),
        }
    }

    pub fn component(
        component: &'static str,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        PartitionError::Component {
            component,
            operation,
            message: message.into(),
        }
    }

    /// Transient condition; the caller may retry the same request.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PartitionError::NotRunning
                | PartitionError::NotLoaded(_)
                | PartitionError::RemoteCannotHandleRequest
        )
    }

    /// Expected outcome of two lease events racing on the same id.
    #[inline]
    pub fn is_benign_race(&self) -> bool {
        matches!(
            self,
            PartitionError::AlreadyExists(_) | PartitionError::DoesNotExist(_)
        )
    }

    #[inline]
    pub fn is_does_not_exist(&self) -> bool {
        matches!(self, PartitionError::DoesNotExist(_))
    }

    #[inline]
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, PartitionError::InvalidState { .. })
    }

    /// Stable code for this error. See [`ErrorCode`].
    pub fn code(&self) -> ErrorCode {
        ErrorCode::of(self)
    }
}

// ============================================================================
// Error code table
// ============================================================================
//
// A plain enum plus match arms. Nothing is registered at startup.

/// Stable, externally visible error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    NotRunning = 0x0001,
    AlreadyRunning = 0x0002,
    AlreadyExists = 0x0003,
    DoesNotExist = 0x0004,
    LoadFailure = 0x0005,
    UnloadFailure = 0x0006,
    InvalidState = 0x0007,
    InvalidRequest = 0x0008,
    RemoteCannotHandleRequest = 0x0009,
    NotLoaded = 0x000A,
    InvalidTransaction = 0x000B,
    RecoveryFailed = 0x000C,
    ComponentFailure = 0x000D,
    InvalidConfig = 0x000E,
    NoLeasesHeld = 0x000F,
    TransactionFailure = 0x0010,
}

impl ErrorCode {
    pub fn of(error: &PartitionError) -> Self {
        match error {
            PartitionError::NotRunning => ErrorCode::NotRunning,
            PartitionError::AlreadyRunning => ErrorCode::AlreadyRunning,
            PartitionError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            PartitionError::DoesNotExist(_) => ErrorCode::DoesNotExist,
            PartitionError::LoadFailure { .. } => ErrorCode::LoadFailure,
            PartitionError::UnloadFailure { .. } => ErrorCode::UnloadFailure,
            PartitionError::InvalidState { .. } => ErrorCode::InvalidState,
            PartitionError::TypeMismatch { .. } => ErrorCode::InvalidRequest,
            PartitionError::RemoteCannotHandleRequest => ErrorCode::RemoteCannotHandleRequest,
            PartitionError::NotLoaded(_) => ErrorCode::NotLoaded,
            PartitionError::InvalidTransaction => ErrorCode::InvalidTransaction,
            PartitionError::RecoveryFailed(_) => ErrorCode::RecoveryFailed,
            PartitionError::Component { .. } => ErrorCode::ComponentFailure,
            PartitionError::Config(_) => ErrorCode::InvalidConfig,
            PartitionError::NoLeasesHeld => ErrorCode::NoLeasesHeld,
            PartitionError::Transaction(_) => ErrorCode::TransactionFailure,
        }
    }

    pub fn code(&self) -> u32 {
        *self as u32
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::NotRunning => "The component is not running.",
            ErrorCode::AlreadyRunning => "The component is already running.",
            ErrorCode::AlreadyExists => "The partition already exists.",
            ErrorCode::DoesNotExist => "The partition does not exist.",
            ErrorCode::LoadFailure => "The partition could not be loaded.",
            ErrorCode::UnloadFailure => "The partition could not be unloaded.",
            ErrorCode::InvalidState => "The partition is in an invalid state for this operation.",
            ErrorCode::InvalidRequest => "The request does not match the partition type.",
            ErrorCode::RemoteCannotHandleRequest => {
                "Remote partitions cannot handle requests locally."
            }
            ErrorCode::NotLoaded => "The partition is not loaded yet.",
            ErrorCode::InvalidTransaction => "The transaction request is invalid.",
            ErrorCode::RecoveryFailed => "Journal recovery failed.",
            ErrorCode::ComponentFailure => "A partition component failed.",
            ErrorCode::InvalidConfig => "The configuration is invalid.",
            ErrorCode::NoLeasesHeld => "No leases are currently held.",
            ErrorCode::TransactionFailure => "The transaction failed.",
        }
    }

    /// HTTP status a front end should map this code to.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::AlreadyExists => 409,
            ErrorCode::DoesNotExist => 404,
            ErrorCode::InvalidRequest | ErrorCode::InvalidTransaction => 400,
            ErrorCode::NotRunning
            | ErrorCode::NotLoaded
            | ErrorCode::RemoteCannotHandleRequest
            | ErrorCode::NoLeasesHeld => 503,
            ErrorCode::AlreadyRunning
            | ErrorCode::LoadFailure
            | ErrorCode::UnloadFailure
            | ErrorCode::InvalidState
            | ErrorCode::RecoveryFailed
            | ErrorCode::ComponentFailure
            | ErrorCode::InvalidConfig
            | ErrorCode::TransactionFailure => 500,
        }
    }
}

// ============================================================================
// Fatal sink conditions
// ============================================================================

/// Conditions under which the lease event sink terminates the process.
///
/// Each variant names one abort site. None of them is ever returned to a
/// caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseSinkViolation {
    /// Acquired arrived while a load/unload task for the id was unfinished.
    TaskRunningWhileAcquire,
    /// Lost arrived while a task for the id was running and uncancellable.
    TaskRunningWhileLost,
    /// A new task could not be recorded in the pending-task map.
    CannotEmplaceToMap,
    /// The remote placeholder could not be unloaded on Acquired.
    RemoteUnloadFailed,
    /// A remote placeholder could not be loaded on NotAcquired.
    RemoteLoadFailed,
    /// The remote address could not be refreshed on NotAcquired.
    RemoteRefreshFailed,
    /// A scheduled local load failed.
    LocalLoadFailed,
    /// A local unload failed for a reason other than a missing entry.
    LocalUnloadFailed,
}

impl LeaseSinkViolation {
    /// Label used for the abort counter and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseSinkViolation::TaskRunningWhileAcquire => "task_running_while_acquire",
            LeaseSinkViolation::TaskRunningWhileLost => "task_running_while_lost",
            LeaseSinkViolation::CannotEmplaceToMap => "cannot_emplace_to_map",
            LeaseSinkViolation::RemoteUnloadFailed => "remote_unload_failed",
            LeaseSinkViolation::RemoteLoadFailed => "remote_load_failed",
            LeaseSinkViolation::RemoteRefreshFailed => "remote_refresh_failed",
            LeaseSinkViolation::LocalLoadFailed => "local_load_failed",
            LeaseSinkViolation::LocalUnloadFailed => "local_unload_failed",
        }
    }
}

impl std::fmt::Display for LeaseSinkViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
