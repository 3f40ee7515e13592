//! Background loop that spreads partitions evenly across the fleet.
//!
//! Each process holds some number of vnode leases. After a startup delay the
//! applier periodically asks the lease manager to hold at most
//! `ceil(total_partitions / vnode_leases_held)` partition leases, with no
//! specific locks preferred. Holding no vnode leases is transient; the cycle is
//! skipped and retried at the next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{PartitionError, PartitionResult};
use crate::metrics;
use crate::traits::{LeaseAcquisitionPreferenceSetter, LeaseEventSink, LeaseStatistics};
use crate::types::{LeasableLockId, LeaseAcquisitionPreference, LeaseInfo, LeaseTransitionType};

struct ApplierContext {
    total_partitions: usize,
    lease_statistics: Arc<dyn LeaseStatistics>,
    preference_setter: Arc<dyn LeaseAcquisitionPreferenceSetter>,
}

impl ApplierContext {
    fn apply_once(&self) -> PartitionResult<usize> {
        let held = self.lease_statistics.currently_leased_locks_count();
        if held == 0 {
            metrics::record_preference_update("no_leases");
            return Err(PartitionError::NoLeasesHeld);
        }

        let target = self.total_partitions.div_ceil(held);
        let preference = LeaseAcquisitionPreference {
            maximum_number_of_leases_to_hold: target,
            preferred_locks_to_acquire_leases_on: Vec::new(),
        };

        if let Err(e) = self.preference_setter.set_lease_acquisition_preference(preference) {
            metrics::record_preference_update("failed");
            return Err(e);
        }

        metrics::record_preference_update("applied");
        debug!(vnode_leases_held = held, target, "Applied lease acquisition preference");
        Ok(target)
    }
}

struct RunningLoop {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodically pushes a partition lease target to the lease manager.
pub struct PartitionLeasePreferenceApplier {
    context: Arc<ApplierContext>,
    startup_delay: Duration,
    interval: Duration,
    running: Mutex<Option<RunningLoop>>,
}

impl PartitionLeasePreferenceApplier {
    pub fn new(
        total_partitions: usize,
        lease_statistics: Arc<dyn LeaseStatistics>,
        preference_setter: Arc<dyn LeaseAcquisitionPreferenceSetter>,
        startup_delay: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            context: Arc::new(ApplierContext {
                total_partitions,
                lease_statistics,
                preference_setter,
            }),
            startup_delay,
            interval,
            running: Mutex::new(None),
        }
    }

    /// One cycle. Returns the target pushed to the lease manager.
    pub fn apply_once(&self) -> PartitionResult<usize> {
        self.context.apply_once()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn run(&self) -> PartitionResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(PartitionError::AlreadyRunning);
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let context = self.context.clone();
        let startup_delay = self.startup_delay;
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(startup_delay) => {}
                _ = shutdown_rx.recv() => return,
            }

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match context.apply_once() {
                            Ok(_) => {}
                            Err(PartitionError::NoLeasesHeld) => {
                                debug!("No vnode leases held, skipping preference update");
                            }
                            Err(e) => {
                                warn!(error = %e, "Failed to apply lease acquisition preference");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        *running = Some(RunningLoop {
            shutdown_tx,
            handle,
        });
        info!(
            total_partitions = self.context.total_partitions,
            startup_delay_ms = startup_delay.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "Lease preference applier running"
        );
        Ok(())
    }

    pub async fn stop(&self) -> PartitionResult<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Err(PartitionError::NotRunning);
        };

        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.handle.await {
            warn!(error = %e, "Lease preference applier task ended abnormally");
        }
        info!("Lease preference applier stopped");
        Ok(())
    }
}

/// Ties the applier's lifetime to a vnode lease: running while held.
pub struct ComponentLifecycleLeaseEventSink {
    applier: Arc<PartitionLeasePreferenceApplier>,
}

impl ComponentLifecycleLeaseEventSink {
    pub fn new(applier: Arc<PartitionLeasePreferenceApplier>) -> Self {
        Self { applier }
    }
}

#[async_trait]
impl LeaseEventSink for ComponentLifecycleLeaseEventSink {
    async fn on_lease_transition(
        &self,
        lock_id: LeasableLockId,
        transition: LeaseTransitionType,
        _owner_info: Option<LeaseInfo>,
    ) {
        match transition {
            LeaseTransitionType::Acquired => {
                if let Err(e) = self.applier.run().await {
                    debug!(lock_id = %lock_id, error = %e, "Applier not started");
                }
            }
            LeaseTransitionType::Lost | LeaseTransitionType::Released => {
                if let Err(e) = self.applier.stop().await {
                    debug!(lock_id = %lock_id, error = %e, "Applier not stopped");
                }
            }
            _ => {}
        }
    }
}
