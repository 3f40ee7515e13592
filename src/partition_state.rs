//! Partition load/unload state machine.
//!
//! Every partition walks the same linear lifecycle:
//!
//! ```text
//! Created -> Initialized -> Loading -> Loaded -> Unloading -> Unloaded
//! ```
//!
//! # Transitions
//!
//! [`AtomicPartitionState`] wraps the state in an `AtomicU8`. Each step is a
//! single compare-and-swap from the exact expected source state. A step that
//! loses the race (or is attempted from the wrong state) fails immediately with
//! `PartitionError::InvalidState` and never blocks.
//!
//! ```rust
//! use pbs_partitions::partition_state::{AtomicPartitionState, PartitionLoadUnloadState};
//! use pbs_partitions::types::PartitionId;
//!
//! let state = AtomicPartitionState::new(PartitionId::ZERO);
//! state.transition(PartitionLoadUnloadState::Created, PartitionLoadUnloadState::Initialized, "init").unwrap();
//! assert_eq!(state.load(), PartitionLoadUnloadState::Initialized);
//! assert!(state.transition(PartitionLoadUnloadState::Created, PartitionLoadUnloadState::Initialized, "init").is_err());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{PartitionError, PartitionResult};
use crate::types::PartitionId;

/// Lifecycle state of a single partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PartitionLoadUnloadState {
    #[default]
    Created = 0,
    Initialized = 1,
    Loading = 2,
    Loaded = 3,
    Unloading = 4,
    Unloaded = 5,
}

impl PartitionLoadUnloadState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PartitionLoadUnloadState::Created,
            1 => PartitionLoadUnloadState::Initialized,
            2 => PartitionLoadUnloadState::Loading,
            3 => PartitionLoadUnloadState::Loaded,
            4 => PartitionLoadUnloadState::Unloading,
            _ => PartitionLoadUnloadState::Unloaded,
        }
    }

    /// Loading or Unloading.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            PartitionLoadUnloadState::Loading | PartitionLoadUnloadState::Unloading
        )
    }

    /// Only Loaded partitions accept requests.
    pub fn is_serving(&self) -> bool {
        matches!(self, PartitionLoadUnloadState::Loaded)
    }
}

impl fmt::Display for PartitionLoadUnloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Compare-and-swap guarded lifecycle state owned by one partition.
#[derive(Debug)]
pub struct AtomicPartitionState {
    partition_id: PartitionId,
    state: AtomicU8,
}

impl AtomicPartitionState {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            state: AtomicU8::new(PartitionLoadUnloadState::Created as u8),
        }
    }

    #[inline]
    pub fn load(&self) -> PartitionLoadUnloadState {
        PartitionLoadUnloadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move `from -> to` atomically.
    ///
    /// `operation` names the caller's lifecycle step for the error message.
    pub fn transition(
        &self,
        from: PartitionLoadUnloadState,
        to: PartitionLoadUnloadState,
        operation: &'static str,
    ) -> PartitionResult<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| PartitionError::InvalidState {
                partition_id: self.partition_id,
                operation,
                state: PartitionLoadUnloadState::from_u8(actual),
            })
    }

    /// Unconditional store. Only used by remote stubs, which have no
    /// ordering requirements of their own.
    pub fn store(&self, state: PartitionLoadUnloadState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}
