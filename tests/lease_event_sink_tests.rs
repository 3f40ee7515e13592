//! Integration tests for PartitionLeaseEventSink.
//!
//! Lease transitions are fed to the sink by hand; a recording partition
//! manager captures the resulting load/unload/refresh calls and a counting
//! abort handler stands in for process termination.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use pbs_partitions::config::StaticConfigProvider;
use pbs_partitions::constants::PBS_JOURNAL_SERVICE_BUCKET_NAME;
use pbs_partitions::lease_event_sink::AbortHandler;
use pbs_partitions::mock::{
    ManagerCall, MockLeaseReleaseNotification, MockPartitionManager, MockPartitionServicesFactory,
};
use pbs_partitions::prelude::*;
use pbs_partitions::scheduled_task::ScheduledTaskType;
use tokio::runtime::Handle;

const LONG_DELAY: Duration = Duration::from_secs(3600);

struct Harness {
    manager: Arc<MockPartitionManager>,
    notification: Arc<MockLeaseReleaseNotification>,
    aborts: Arc<AtomicUsize>,
    sink: PartitionLeaseEventSink,
}

impl Harness {
    async fn new(startup_delay: Duration) -> Self {
        let manager = Arc::new(MockPartitionManager::new());
        let notification = Arc::new(MockLeaseReleaseNotification::new());
        let aborts = Arc::new(AtomicUsize::new(0));

        let counter = aborts.clone();
        let abort_handler: AbortHandler = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let weak: Weak<dyn LeaseReleaseNotification> = Arc::<MockLeaseReleaseNotification>::downgrade(&notification);

        let sink = PartitionLeaseEventSink::with_abort_handler(
            manager.clone(),
            weak,
            Handle::current(),
            startup_delay,
            abort_handler,
        );
        sink.init().await.unwrap();
        sink.run().await.unwrap();

        Self {
            manager,
            notification,
            aborts,
            sink,
        }
    }

    async fn send(&self, lock_id: PartitionId, transition: LeaseTransitionType) {
        self.sink.on_lease_transition(lock_id, transition, None).await;
    }

    async fn send_owner(&self, lock_id: PartitionId, owner: &str, address: &str) {
        self.sink
            .on_lease_transition(
                lock_id,
                LeaseTransitionType::NotAcquired,
                Some(LeaseInfo::new(owner, address)),
            )
            .await;
    }

    fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    async fn wait_for_local(&self, lock_id: PartitionId) {
        wait_until(|| {
            self.manager
                .registered(lock_id)
                .is_some_and(|m| m.partition_type == PartitionType::Local)
        })
        .await;
        settle(&self.sink, lock_id).await;
    }
}

/// Wait until the pending task for `lock_id`, if any, has finished.
async fn settle(sink: &PartitionLeaseEventSink, lock_id: PartitionId) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.pending_task_done(lock_id).await == Some(false) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("pending task did not finish in time");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn lock(n: u64) -> PartitionId {
    PartitionId::from_words(0x1ea5e, n)
}

// ============================================================================
// Full lifecycles
// ============================================================================

#[tokio::test]
async fn test_remote_then_local_then_remote() {
    let h = Harness::new(Duration::ZERO).await;
    let id = lock(1);

    h.send_owner(id, "process-a", "https://a:8443").await;
    h.send(id, LeaseTransitionType::Acquired).await;
    h.wait_for_local(id).await;

    for _ in 0..3 {
        h.send(id, LeaseTransitionType::Renewed).await;
    }
    h.send(id, LeaseTransitionType::Lost).await;
    h.send_owner(id, "process-b", "https://b:8443").await;

    assert_eq!(
        h.manager.calls(),
        vec![
            ManagerCall::Refresh(PartitionMetadata::remote(id, "https://a:8443")),
            ManagerCall::Load(PartitionMetadata::remote(id, "https://a:8443")),
            ManagerCall::Unload(PartitionMetadata::remote(id, "")),
            ManagerCall::Load(PartitionMetadata::local(id)),
            ManagerCall::Unload(PartitionMetadata::local(id)),
            ManagerCall::Refresh(PartitionMetadata::remote(id, "https://b:8443")),
            ManagerCall::Load(PartitionMetadata::remote(id, "https://b:8443")),
        ]
    );
    assert_eq!(
        h.manager.registered(id).unwrap().partition_address_uri,
        "https://b:8443"
    );
    assert_eq!(h.sink.pending_task_count().await, 0);
    assert_eq!(h.aborts(), 0);
}

#[tokio::test]
async fn test_owner_change_refreshes_address_in_place() {
    let h = Harness::new(Duration::ZERO).await;
    let id = lock(2);

    h.send_owner(id, "process-a", "https://a").await;
    h.send_owner(id, "process-b", "https://b").await;

    assert_eq!(h.manager.load_count(id), 1);
    assert_eq!(h.manager.registered(id).unwrap().partition_address_uri, "https://b");
    assert_eq!(h.aborts(), 0);
}

#[tokio::test]
async fn test_release_cancels_pending_load() {
    let h = Harness::new(LONG_DELAY).await;
    let id = lock(3);

    h.send(id, LeaseTransitionType::Acquired).await;
    assert_eq!(h.sink.pending_task_type(id).await, Some(ScheduledTaskType::Load));

    h.send(id, LeaseTransitionType::RenewedWithIntentionToRelease).await;
    assert_eq!(h.sink.pending_task_type(id).await, Some(ScheduledTaskType::Unload));

    wait_until(|| h.notification.released() == vec![id]).await;
    assert_eq!(h.manager.load_count(id), 0);
    assert_eq!(h.manager.unload_count(id), 2);
    assert_eq!(h.aborts(), 0);

    // A second release intent while the unload exists changes nothing.
    h.send(id, LeaseTransitionType::RenewedWithIntentionToRelease).await;
    assert_eq!(h.manager.unload_count(id), 2);
    assert_eq!(h.notification.released(), vec![id]);
}

#[tokio::test]
async fn test_release_after_load_unloads_and_notifies() {
    let h = Harness::new(Duration::ZERO).await;
    let id = lock(4);

    h.send(id, LeaseTransitionType::Acquired).await;
    h.wait_for_local(id).await;

    h.send(id, LeaseTransitionType::RenewedWithIntentionToRelease).await;
    wait_until(|| h.notification.released() == vec![id]).await;
    settle(&h.sink, id).await;
    assert!(h.manager.registered(id).is_none());

    h.send(id, LeaseTransitionType::Released).await;
    assert_eq!(h.aborts(), 0);

    // The lease can come back after a release.
    h.send(id, LeaseTransitionType::Acquired).await;
    h.wait_for_local(id).await;
    assert_eq!(h.aborts(), 0);
}

#[tokio::test]
async fn test_lost_before_load_starts_cancels_it() {
    let h = Harness::new(LONG_DELAY).await;
    let id = lock(5);

    h.send(id, LeaseTransitionType::Acquired).await;
    h.send(id, LeaseTransitionType::Lost).await;

    assert_eq!(h.sink.pending_task_count().await, 0);
    assert_eq!(h.manager.load_count(id), 0);
    assert!(h.notification.released().is_empty());
    assert_eq!(h.aborts(), 0);
}

// ============================================================================
// Running loads
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_during_running_load_aborts_once() {
    let h = Harness::new(Duration::ZERO).await;
    let id = lock(6);
    h.manager.block_local_loads(true);

    h.send(id, LeaseTransitionType::Acquired).await;
    h.manager.wait_load_started().await;

    h.send(id, LeaseTransitionType::Lost).await;
    assert_eq!(h.aborts(), 1);

    h.manager.release_load();
    h.wait_for_local(id).await;
    assert_eq!(h.aborts(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_release_during_running_load_is_deferred() {
    let h = Harness::new(Duration::ZERO).await;
    let id = lock(7);
    h.manager.block_local_loads(true);

    h.send(id, LeaseTransitionType::Acquired).await;
    h.manager.wait_load_started().await;

    h.send(id, LeaseTransitionType::RenewedWithIntentionToRelease).await;
    assert_eq!(h.sink.pending_task_type(id).await, Some(ScheduledTaskType::Load));
    assert!(h.notification.released().is_empty());

    h.manager.release_load();
    h.wait_for_local(id).await;

    h.send(id, LeaseTransitionType::RenewedWithIntentionToRelease).await;
    wait_until(|| h.notification.released() == vec![id]).await;
    assert_eq!(h.aborts(), 0);
}

// ============================================================================
// Abort paths
// ============================================================================

#[tokio::test]
async fn test_acquire_with_pending_task_aborts() {
    let h = Harness::new(LONG_DELAY).await;
    let id = lock(8);

    h.send(id, LeaseTransitionType::Acquired).await;
    h.send(id, LeaseTransitionType::Acquired).await;
    assert_eq!(h.aborts(), 1);
}

#[tokio::test]
async fn test_failed_local_load_aborts() {
    let h = Harness::new(Duration::ZERO).await;
    let id = lock(9);
    h.manager.fail_load(true);

    h.send(id, LeaseTransitionType::Acquired).await;
    wait_until(|| h.aborts.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_failed_local_unload_aborts() {
    let h = Harness::new(Duration::ZERO).await;
    let id = lock(10);

    h.send(id, LeaseTransitionType::Acquired).await;
    h.wait_for_local(id).await;

    h.manager.fail_unload(true);
    h.send(id, LeaseTransitionType::Lost).await;
    assert_eq!(h.aborts(), 1);
}

#[tokio::test]
async fn test_owner_report_for_local_partition_aborts() {
    let h = Harness::new(Duration::ZERO).await;
    let id = lock(11);

    h.send(id, LeaseTransitionType::Acquired).await;
    h.wait_for_local(id).await;

    // Refreshing a local entry as remote is a type mismatch.
    h.send_owner(id, "process-x", "https://x").await;
    assert_eq!(h.aborts(), 1);
}

#[tokio::test]
async fn test_failed_remote_load_aborts() {
    let h = Harness::new(Duration::ZERO).await;
    let id = lock(12);
    h.manager.fail_load(true);

    h.send_owner(id, "process-a", "https://a").await;
    assert_eq!(h.aborts(), 1);
}

// ============================================================================
// Lifecycle and weak notification target
// ============================================================================

#[tokio::test]
async fn test_events_dropped_after_stop() {
    let h = Harness::new(Duration::ZERO).await;
    h.sink.stop().await.unwrap();

    h.send(lock(13), LeaseTransitionType::Acquired).await;
    h.send_owner(lock(13), "process-a", "https://a").await;

    assert!(h.manager.calls().is_empty());
    assert_eq!(h.aborts(), 0);
}

#[tokio::test]
async fn test_notification_target_gone_is_noop() {
    let h = Harness::new(Duration::ZERO).await;
    let id = lock(14);
    let Harness {
        manager,
        notification,
        aborts,
        sink,
    } = h;
    drop(notification);

    sink.on_lease_transition(id, LeaseTransitionType::RenewedWithIntentionToRelease, None)
        .await;
    wait_until(|| manager.unload_count(id) == 1).await;

    // Unload task finishes without a target to notify.
    sink.stop().await.unwrap();
    assert_eq!(aborts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_with_budget_partition_manager() {
    let manager = Arc::new(BudgetPartitionManager::new(
        Arc::new(StaticConfigProvider::new().with(PBS_JOURNAL_SERVICE_BUCKET_NAME, "journals")),
        Arc::new(MockPartitionServicesFactory::new()),
    ));
    manager.init().await.unwrap();
    manager.run().await.unwrap();

    let notification = Arc::new(MockLeaseReleaseNotification::new());
    let weak: Weak<dyn LeaseReleaseNotification> = Arc::<MockLeaseReleaseNotification>::downgrade(&notification);
    let aborts = Arc::new(AtomicUsize::new(0));
    let counter = aborts.clone();
    let sink = PartitionLeaseEventSink::with_abort_handler(
        manager.clone(),
        weak,
        Handle::current(),
        Duration::ZERO,
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    sink.init().await.unwrap();
    sink.run().await.unwrap();

    let id = lock(15);
    sink.on_lease_transition(
        id,
        LeaseTransitionType::NotAcquired,
        Some(LeaseInfo::new("peer", "https://peer")),
    )
    .await;
    assert_eq!(manager.get_partition_type(id).unwrap(), PartitionType::Remote);

    sink.on_lease_transition(id, LeaseTransitionType::Acquired, None)
        .await;
    wait_until(|| {
        manager
            .get_partition(id)
            .is_ok_and(|p| p.state() == PartitionLoadUnloadState::Loaded)
    })
    .await;
    settle(&sink, id).await;
    assert_eq!(manager.get_partition_type(id).unwrap(), PartitionType::Local);

    sink.on_lease_transition(id, LeaseTransitionType::RenewedWithIntentionToRelease, None)
        .await;
    wait_until(|| notification.released() == vec![id]).await;
    assert!(manager.get_partition(id).err().unwrap().is_does_not_exist());

    sink.stop().await.unwrap();
    manager.stop().await.unwrap();
    assert_eq!(aborts.load(Ordering::SeqCst), 0);
}
