//! Partition handles: locally hosted partitions and remote address stubs.
//!
//! - [`LocalPbsPartition`]: owns the journal, budget-key provider,
//!   transaction manager and checkpoint services for a partition hosted here.
//! - [`RemotePbsPartition`]: records that a partition is hosted elsewhere.
//!   Lifecycle calls always succeed and requests are refused with a retryable
//!   error so the caller re-resolves routing.

mod local;
mod remote;

pub use local::LocalPbsPartition;
pub use remote::RemotePbsPartition;
