//! # pbs-partitions
//! Lease-coordinated partition lifecycle for a horizontally sharded privacy
//! budget service.
//!
//! The budget key space is split into a fixed set of partitions. Each process
//! in the fleet competes for per-partition leases; whichever process holds a
//! partition's lease hosts that partition locally, and every other process
//! tracks it as a remote placeholder pointing at the holder's endpoint.
//!
//! # Components
//!
//! - [`PbsPartitionNamespace`]: maps a resource id onto a partition id
//! - [`BudgetPartitionManager`]: registry of local and remote partitions,
//!   sequencing Init/Load/Unload and guarding against double hosting
//! - [`PartitionLeaseEventSink`]: turns lease transitions into delayed loads,
//!   synchronous unloads and remote address refreshes
//! - [`ScheduledPartitionTask`]: delayed, cooperatively cancellable task
//! - [`PartitionLeasePreferenceApplier`]: keeps the per-process lease target at
//!   `ceil(partitions / vnode leases held)`
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::{Arc, Weak};
//! use pbs_partitions::prelude::*;
//! use pbs_partitions::config::EnvConfigProvider;
//! # struct Services;
//! # impl PartitionServicesFactory for Services {
//! #     fn create(&self, _: PartitionId, _: &LocalPartitionSettings) -> PartitionResult<PartitionServices> {
//! #         unimplemented!()
//! #     }
//! # }
//! # struct LeaseManager;
//! # impl LeaseReleaseNotification for LeaseManager {
//! #     fn safe_to_release_lease(&self, _: PartitionId) {}
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PartitionConfig::from_env()?;
//!     let manager = Arc::new(BudgetPartitionManager::new(
//!         Arc::new(EnvConfigProvider),
//!         Arc::new(Services),
//!     ));
//!     manager.init().await?;
//!     manager.run().await?;
//!
//!     let lease_manager = Arc::new(LeaseManager);
//!     let notification: Weak<dyn LeaseReleaseNotification> = Arc::<LeaseManager>::downgrade(&lease_manager);
//!     let sink = PartitionLeaseEventSink::new(
//!         manager.clone(),
//!         notification,
//!         tokio::runtime::Handle::current(),
//!         config.partition_load_startup_delay,
//!     );
//!     sink.init().await?;
//!     sink.run().await?;
//!     // Hand `sink` to the lease manager.
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod constants;
pub mod error;
pub mod lease_event_sink;
pub mod metrics;
pub mod namespace;
pub mod partition;
pub mod partition_manager;
pub mod partition_registry;
pub mod partition_state;
pub mod preference_applier;
pub mod scheduled_task;
pub mod telemetry;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock;

pub use config::PartitionConfig;
pub use error::{ErrorCode, LeaseSinkViolation, PartitionError, PartitionResult};
pub use lease_event_sink::PartitionLeaseEventSink;
pub use namespace::PbsPartitionNamespace;
pub use partition::{LocalPbsPartition, RemotePbsPartition};
pub use partition_manager::BudgetPartitionManager;
pub use partition_state::PartitionLoadUnloadState;
pub use preference_applier::{ComponentLifecycleLeaseEventSink, PartitionLeasePreferenceApplier};
pub use scheduled_task::{ScheduledPartitionTask, ScheduledTaskType};

pub mod prelude {
    //! Everything needed to assemble the partition layer.
    pub use crate::config::PartitionConfig;
    pub use crate::error::{ErrorCode, PartitionError, PartitionResult};
    pub use crate::lease_event_sink::PartitionLeaseEventSink;
    pub use crate::namespace::PbsPartitionNamespace;
    pub use crate::partition_manager::BudgetPartitionManager;
    pub use crate::partition_state::PartitionLoadUnloadState;
    pub use crate::preference_applier::{
        ComponentLifecycleLeaseEventSink, PartitionLeasePreferenceApplier,
    };
    pub use crate::traits::{
        LeaseAcquisitionPreferenceSetter, LeaseEventSink, LeaseReleaseNotification,
        LeaseStatistics, Partition, PartitionManager, PartitionNamespace, PartitionServices,
        PartitionServicesFactory, PbsPartition, PbsPartitionManager,
    };
    pub use crate::types::{
        LeaseInfo, LeaseTransitionType, LocalPartitionSettings, PartitionId, PartitionMetadata,
        PartitionType,
    };
}
