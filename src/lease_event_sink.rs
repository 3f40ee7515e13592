//! Lease event sink that drives partition loads and unloads.
//!
//! The lease manager reports, per partition lock, whether this process holds
//! the lease. The sink turns those transitions into partition manager calls:
//!
//! | Transition | Action |
//! |------------|--------|
//! | Acquired | unload the remote placeholder, schedule a delayed local load |
//! | Lost | cancel or wait out the pending task, unload the local partition inline |
//! | NotAcquired(owner) | refresh or load the remote placeholder at the owner's address |
//! | Renewed | record the renewal |
//! | RenewedWithIntentionToRelease | schedule an unload, then signal the lease may be released |
//! | Released | nothing |
//!
//! # Serialization
//!
//! Every transition is handled under one coordinator mutex, which also guards
//! the pending-task map. There is at most one pending task per partition id.
//!
//! # Backpressure
//!
//! The Lost handler unloads on the caller's future rather than in a spawned
//! task. A slow unload therefore slows the lease manager's refresh loop, which
//! lets the lease manager's own enforcement take over.
//!
//! # Aborting
//!
//! When the single-host guarantee may already be broken, the sink calls the
//! injected abort handler (by default `std::process::abort`). It never retries.
//! Each call site names its [`LeaseSinkViolation`].

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::constants::UNLOAD_TASK_DELAY;
use crate::error::{LeaseSinkViolation, PartitionResult};
use crate::metrics;
use crate::scheduled_task::{ScheduledPartitionTask, ScheduledTaskType};
use crate::traits::{LeaseEventSink, LeaseReleaseNotification, PartitionManager};
use crate::types::{LeasableLockId, LeaseInfo, LeaseTransitionType, PartitionId, PartitionMetadata};

/// Terminates the process. Must not return in production.
pub type AbortHandler = Arc<dyn Fn() + Send + Sync>;

pub fn default_abort_handler() -> AbortHandler {
    Arc::new(|| std::process::abort())
}

/// State shared with the tasks the sink spawns.
struct SinkContext {
    sink_id: Uuid,
    partition_manager: Arc<dyn PartitionManager>,
    lease_release_notification: Weak<dyn LeaseReleaseNotification>,
    abort_handler: AbortHandler,
}

impl SinkContext {
    fn abort_process(&self, violation: LeaseSinkViolation, partition_id: PartitionId) {
        error!(
            sink_id = %self.sink_id,
            partition_id = %partition_id,
            reason = %violation,
            "CRITICAL: Terminating process, partition ownership invariant violated"
        );
        metrics::record_abort_request(violation.as_str());
        (self.abort_handler)();
    }

    async fn load_local_partition(&self, partition_id: PartitionId) {
        info!(sink_id = %self.sink_id, partition_id = %partition_id, "Loading local partition");
        let started = Instant::now();

        if let Err(e) = self
            .partition_manager
            .load_partition(&PartitionMetadata::local(partition_id))
            .await
        {
            error!(sink_id = %self.sink_id, partition_id = %partition_id, error = %e, "Loading local partition failed");
            self.abort_process(LeaseSinkViolation::LocalLoadFailed, partition_id);
            return;
        }

        let elapsed = started.elapsed();
        metrics::record_partition_loaded(partition_id, elapsed.as_secs_f64());
        info!(
            sink_id = %self.sink_id,
            partition_id = %partition_id,
            elapsed_ms = elapsed.as_millis() as u64,
            "Loaded local partition"
        );
    }

    /// Unload the local partition; a missing entry is not an error.
    async fn unload_local_partition(&self, partition_id: PartitionId, notify_lease_manager: bool) {
        info!(sink_id = %self.sink_id, partition_id = %partition_id, "Unloading local partition");
        let started = Instant::now();

        match self
            .partition_manager
            .unload_partition(&PartitionMetadata::local(partition_id))
            .await
        {
            Ok(()) => {
                metrics::record_partition_unloaded(partition_id, started.elapsed().as_secs_f64());
            }
            Err(e) if e.is_does_not_exist() => {
                debug!(sink_id = %self.sink_id, partition_id = %partition_id, "No local partition to unload");
            }
            Err(e) => {
                error!(sink_id = %self.sink_id, partition_id = %partition_id, error = %e, "Unloading local partition failed");
                self.abort_process(LeaseSinkViolation::LocalUnloadFailed, partition_id);
                return;
            }
        }

        if notify_lease_manager {
            match self.lease_release_notification.upgrade() {
                Some(target) => target.safe_to_release_lease(partition_id),
                None => debug!(partition_id = %partition_id, "Lease release target is gone"),
            }
        }

        info!(
            sink_id = %self.sink_id,
            partition_id = %partition_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Unloaded local partition"
        );
    }
}

#[derive(Default)]
struct SinkState {
    running: bool,
    partition_tasks: HashMap<PartitionId, ScheduledPartitionTask>,
}

/// Reacts to partition lease transitions by loading and unloading partitions.
pub struct PartitionLeaseEventSink {
    context: Arc<SinkContext>,
    runtime: Handle,
    partition_load_startup_delay: Duration,
    /// Coordinator mutex.
    state: Mutex<SinkState>,
}

impl PartitionLeaseEventSink {
    /// Create a sink that aborts the process on invariant violations.
    pub fn new(
        partition_manager: Arc<dyn PartitionManager>,
        lease_release_notification: Weak<dyn LeaseReleaseNotification>,
        runtime: Handle,
        partition_load_startup_delay: Duration,
    ) -> Self {
        Self::with_abort_handler(
            partition_manager,
            lease_release_notification,
            runtime,
            partition_load_startup_delay,
            default_abort_handler(),
        )
    }

    pub fn with_abort_handler(
        partition_manager: Arc<dyn PartitionManager>,
        lease_release_notification: Weak<dyn LeaseReleaseNotification>,
        runtime: Handle,
        partition_load_startup_delay: Duration,
        abort_handler: AbortHandler,
    ) -> Self {
        Self {
            context: Arc::new(SinkContext {
                sink_id: Uuid::new_v4(),
                partition_manager,
                lease_release_notification,
                abort_handler,
            }),
            runtime,
            partition_load_startup_delay,
            state: Mutex::new(SinkState::default()),
        }
    }

    pub fn sink_id(&self) -> Uuid {
        self.context.sink_id
    }

    pub async fn init(&self) -> PartitionResult<()> {
        info!(
            sink_id = %self.context.sink_id,
            startup_delay_ms = self.partition_load_startup_delay.as_millis() as u64,
            "Partition lease event sink initialized"
        );
        Ok(())
    }

    pub async fn run(&self) -> PartitionResult<()> {
        self.state.lock().await.running = true;
        info!(sink_id = %self.context.sink_id, "Partition lease event sink running");
        Ok(())
    }

    /// Stop handling transitions, then cancel or wait out every pending task.
    pub async fn stop(&self) -> PartitionResult<()> {
        info!(sink_id = %self.context.sink_id, "Stopping partition lease event sink");
        let mut state = self.state.lock().await;
        state.running = false;

        let outcomes = join_all(state.partition_tasks.iter().map(|(partition_id, task)| async move {
            (*partition_id, task.task_id(), task.cancel_or_wait_until_done().await)
        }))
        .await;
        for (partition_id, task_id, outcome) in outcomes {
            debug!(partition_id = %partition_id, task_id = %task_id, ?outcome, "Pending task finished");
        }
        state.partition_tasks.clear();
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    pub async fn pending_task_count(&self) -> usize {
        self.state.lock().await.partition_tasks.len()
    }

    pub async fn pending_task_type(&self, partition_id: PartitionId) -> Option<ScheduledTaskType> {
        self.state
            .lock()
            .await
            .partition_tasks
            .get(&partition_id)
            .map(ScheduledPartitionTask::task_type)
    }

    /// Whether the pending task for `partition_id` has finished, if there is
    /// one.
    pub async fn pending_task_done(&self, partition_id: PartitionId) -> Option<bool> {
        self.state
            .lock()
            .await
            .partition_tasks
            .get(&partition_id)
            .map(ScheduledPartitionTask::is_done)
    }

    fn schedule(
        &self,
        state: &mut SinkState,
        partition_id: PartitionId,
        task_type: ScheduledTaskType,
        delay: Duration,
    ) {
        let context = self.context.clone();
        let task = ScheduledPartitionTask::spawn(
            &self.runtime,
            task_type,
            delay,
            self.context.sink_id,
            async move {
                match task_type {
                    ScheduledTaskType::Load => context.load_local_partition(partition_id).await,
                    ScheduledTaskType::Unload => {
                        context.unload_local_partition(partition_id, true).await
                    }
                }
            },
        );

        info!(
            sink_id = %self.context.sink_id,
            partition_id = %partition_id,
            task_id = %task.task_id(),
            task_type = %task_type,
            delay_ms = delay.as_millis() as u64,
            "Scheduled partition task"
        );

        match state.partition_tasks.entry(partition_id) {
            Entry::Vacant(slot) => {
                slot.insert(task);
            }
            Entry::Occupied(_) => {
                task.cancel();
                self.context
                    .abort_process(LeaseSinkViolation::CannotEmplaceToMap, partition_id);
            }
        }
    }

    async fn on_lease_acquired(&self, state: &mut SinkState, lock_id: LeasableLockId) {
        if let Some(task) = state.partition_tasks.get(&lock_id) {
            // Every earlier task must be finished before the lease comes back.
            if !task.is_done() {
                error!(
                    partition_id = %lock_id,
                    task_id = %task.task_id(),
                    task_type = %task.task_type(),
                    "Task still pending on lease acquisition"
                );
                self.context
                    .abort_process(LeaseSinkViolation::TaskRunningWhileAcquire, lock_id);
                return;
            }
            state.partition_tasks.remove(&lock_id);
        }

        if let Err(e) = self
            .context
            .partition_manager
            .unload_partition(&PartitionMetadata::remote(lock_id, ""))
            .await
            && !e.is_does_not_exist()
        {
            error!(partition_id = %lock_id, error = %e, "Cannot unload remote partition");
            self.context
                .abort_process(LeaseSinkViolation::RemoteUnloadFailed, lock_id);
            return;
        }

        self.schedule(
            state,
            lock_id,
            ScheduledTaskType::Load,
            self.partition_load_startup_delay,
        );
    }

    async fn on_lease_lost(&self, state: &mut SinkState, lock_id: LeasableLockId) {
        if let Some(task) = state.partition_tasks.get(&lock_id) {
            if !task.is_done() && !task.is_cancellable() {
                error!(
                    partition_id = %lock_id,
                    task_id = %task.task_id(),
                    task_type = %task.task_type(),
                    "Task running while lease was lost"
                );
                self.context
                    .abort_process(LeaseSinkViolation::TaskRunningWhileLost, lock_id);
                return;
            }
            // The task may start between the check and the cancel; then we
            // wait for it.
            task.cancel_or_wait_until_done().await;
            state.partition_tasks.remove(&lock_id);
        }

        self.context.unload_local_partition(lock_id, false).await;
    }

    async fn on_lease_not_acquired(&self, lock_id: LeasableLockId, owner_info: Option<LeaseInfo>) {
        let Some(owner) = owner_info else {
            debug!(partition_id = %lock_id, "No lease owner reported");
            return;
        };

        let metadata = PartitionMetadata::remote(lock_id, owner.service_endpoint_address.clone());
        let manager = &self.context.partition_manager;

        match manager.refresh_partition_address(&metadata).await {
            Ok(()) => {
                debug!(
                    partition_id = %lock_id,
                    owner = %owner.lease_acquirer_id,
                    address = %owner.service_endpoint_address,
                    "Refreshed remote partition address"
                );
                return;
            }
            Err(e) if e.is_does_not_exist() => {}
            Err(e) => {
                error!(partition_id = %lock_id, error = %e, "Cannot refresh remote partition");
                self.context
                    .abort_process(LeaseSinkViolation::RemoteRefreshFailed, lock_id);
                return;
            }
        }

        if let Err(e) = manager.load_partition(&metadata).await {
            error!(partition_id = %lock_id, error = %e, "Cannot load remote partition");
            self.context
                .abort_process(LeaseSinkViolation::RemoteLoadFailed, lock_id);
            return;
        }

        info!(
            partition_id = %lock_id,
            owner = %owner.lease_acquirer_id,
            address = %owner.service_endpoint_address,
            "Loaded remote partition"
        );
    }

    async fn on_lease_renewed(
        &self,
        state: &mut SinkState,
        lock_id: LeasableLockId,
        start_releasing: bool,
    ) {
        metrics::record_lease_renewed(lock_id);

        if !start_releasing {
            match self.context.partition_manager.get_partition(lock_id) {
                Ok(partition) => {
                    debug!(partition_id = %lock_id, state = %partition.state(), "Lease renewed")
                }
                Err(_) => debug!(partition_id = %lock_id, "Lease renewed, partition not loading yet"),
            }
            return;
        }

        if let Some(task) = state.partition_tasks.get(&lock_id) {
            match task.task_type() {
                ScheduledTaskType::Unload => {
                    debug!(partition_id = %lock_id, "Release already in progress");
                    return;
                }
                ScheduledTaskType::Load => {
                    if !task.is_done() && !task.is_cancellable() {
                        // A later renewal retries once the load finishes.
                        info!(partition_id = %lock_id, "Load in progress, deferring release");
                        return;
                    }
                    task.cancel_or_wait_until_done().await;
                }
            }
            state.partition_tasks.remove(&lock_id);
        }

        self.schedule(state, lock_id, ScheduledTaskType::Unload, UNLOAD_TASK_DELAY);
    }
}

#[async_trait]
impl LeaseEventSink for PartitionLeaseEventSink {
    async fn on_lease_transition(
        &self,
        lock_id: LeasableLockId,
        transition: LeaseTransitionType,
        owner_info: Option<LeaseInfo>,
    ) {
        let mut guard = self.state.lock().await;
        if !guard.running {
            warn!(
                sink_id = %self.context.sink_id,
                partition_id = %lock_id,
                transition = %transition,
                "Lease event sink not running, dropping transition"
            );
            return;
        }

        metrics::record_lease_transition(transition);
        debug!(partition_id = %lock_id, transition = %transition, "Handling lease transition");

        let state = &mut *guard;
        match transition {
            LeaseTransitionType::Acquired => self.on_lease_acquired(state, lock_id).await,
            LeaseTransitionType::Lost => self.on_lease_lost(state, lock_id).await,
            LeaseTransitionType::NotAcquired => {
                self.on_lease_not_acquired(lock_id, owner_info).await
            }
            LeaseTransitionType::Renewed => self.on_lease_renewed(state, lock_id, false).await,
            LeaseTransitionType::RenewedWithIntentionToRelease => {
                self.on_lease_renewed(state, lock_id, true).await
            }
            // Cleanup already happened on the preceding release intent.
            LeaseTransitionType::Released => {}
        }
    }
}
