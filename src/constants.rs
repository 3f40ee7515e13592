//! Centralized configuration keys and defaults.
//!
//! # Categories
//!
//! - **Configuration Keys**: names read through a `ConfigProvider`
//! - **Lifecycle Timing**: task polling, startup staggering, drain pacing
//! - **Preference Applier**: vnode preference loop timing
//! - **Partition Requests**: request accounting

use std::time::Duration;

// =============================================================================
// Configuration Keys
// =============================================================================

/// Bucket holding the journal blobs used to recover local partitions.
pub const PBS_JOURNAL_SERVICE_BUCKET_NAME: &str = "PBS_JOURNAL_SERVICE_BUCKET_NAME";

/// Comma-separated list of canonical partition id strings.
pub const PBS_PARTITION_ID_LIST: &str = "PBS_PARTITION_ID_LIST";

/// Delay before a scheduled partition load starts, in seconds.
pub const PBS_PARTITION_LOAD_STARTUP_DELAY_SECS: &str = "PBS_PARTITION_LOAD_STARTUP_DELAY_SECS";

/// Delay before the preference applier's first cycle, in seconds.
pub const PBS_PREFERENCE_APPLIER_STARTUP_DELAY_SECS: &str =
    "PBS_PREFERENCE_APPLIER_STARTUP_DELAY_SECS";

/// Interval between preference applier cycles, in seconds.
pub const PBS_PREFERENCE_APPLIER_INTERVAL_SECS: &str = "PBS_PREFERENCE_APPLIER_INTERVAL_SECS";

/// Maximum number of concurrent transactions per local partition.
pub const PBS_TRANSACTION_MANAGER_CAPACITY: &str = "PBS_TRANSACTION_MANAGER_CAPACITY";

// =============================================================================
// Lifecycle Timing
// =============================================================================

/// Default delay before a scheduled load starts.
///
/// Staggers bulk loads when a whole fleet restarts and every process
/// acquires leases at once.
pub const DEFAULT_PARTITION_LOAD_STARTUP_DELAY: Duration = Duration::from_secs(5);

/// Unload tasks run as soon as they are scheduled.
pub const UNLOAD_TASK_DELAY: Duration = Duration::ZERO;

/// Pause between passes of the manager's shutdown drain.
pub const STOP_DRAIN_PASS_INTERVAL: Duration = Duration::from_millis(10);

// =============================================================================
// Preference Applier
// =============================================================================

pub const DEFAULT_PREFERENCE_APPLIER_STARTUP_DELAY: Duration = Duration::from_secs(5);

pub const DEFAULT_PREFERENCE_APPLIER_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Partition Requests
// =============================================================================

/// Every Nth accepted request on a partition is logged.
pub const REQUEST_LOG_SAMPLE_INTERVAL: u64 = 1000;

/// Default transaction manager capacity per partition.
pub const DEFAULT_TRANSACTION_MANAGER_CAPACITY: u64 = 100_000;
