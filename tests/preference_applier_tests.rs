//! Integration tests for PartitionLeasePreferenceApplier and the vnode lease
//! sink that starts and stops it.

use std::sync::Arc;
use std::time::Duration;

use pbs_partitions::mock::{MockLeaseAcquisitionPreference, MockLeaseStatistics};
use pbs_partitions::prelude::*;

fn applier(
    total: usize,
    stats: &Arc<MockLeaseStatistics>,
    setter: &Arc<MockLeaseAcquisitionPreference>,
) -> Arc<PartitionLeasePreferenceApplier> {
    Arc::new(PartitionLeasePreferenceApplier::new(
        total,
        stats.clone(),
        setter.clone(),
        Duration::from_secs(5),
        Duration::from_secs(1),
    ))
}

#[tokio::test(start_paused = true)]
async fn test_nothing_pushed_before_startup_delay() {
    let stats = Arc::new(MockLeaseStatistics::new(2));
    let setter = Arc::new(MockLeaseAcquisitionPreference::new());
    let applier = applier(10, &stats, &setter);

    applier.run().await.unwrap();
    tokio::time::sleep(Duration::from_millis(4_500)).await;
    assert!(setter.preferences().is_empty());

    tokio::time::sleep(Duration::from_millis(2_700)).await;
    let pushed = setter.preferences();
    assert!(pushed.len() >= 2, "expected periodic updates, got {pushed:?}");
    assert!(pushed.iter().all(|p| p.maximum_number_of_leases_to_hold == 5));

    applier.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_loop_survives_zero_leases() {
    let stats = Arc::new(MockLeaseStatistics::new(0));
    let setter = Arc::new(MockLeaseAcquisitionPreference::new());
    let applier = applier(7, &stats, &setter);

    applier.run().await.unwrap();
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert!(setter.preferences().is_empty());
    assert!(applier.is_running().await);

    stats.set(3);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(
        setter.preferences().last().unwrap().maximum_number_of_leases_to_hold,
        3
    );

    applier.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_vnode_lease_drives_applier_lifecycle() {
    let stats = Arc::new(MockLeaseStatistics::new(1));
    let setter = Arc::new(MockLeaseAcquisitionPreference::new());
    let applier = applier(4, &stats, &setter);
    let sink = ComponentLifecycleLeaseEventSink::new(applier.clone());
    let vnode = PartitionId::from_words(9, 9);

    sink.on_lease_transition(vnode, LeaseTransitionType::Renewed, None)
        .await;
    assert!(!applier.is_running().await);

    sink.on_lease_transition(vnode, LeaseTransitionType::Acquired, None)
        .await;
    assert!(applier.is_running().await);

    // A repeated acquisition leaves the running loop alone.
    sink.on_lease_transition(vnode, LeaseTransitionType::Acquired, None)
        .await;
    assert!(applier.is_running().await);

    sink.on_lease_transition(vnode, LeaseTransitionType::Lost, None)
        .await;
    assert!(!applier.is_running().await);

    sink.on_lease_transition(vnode, LeaseTransitionType::Acquired, None)
        .await;
    sink.on_lease_transition(vnode, LeaseTransitionType::Released, None)
        .await;
    assert!(!applier.is_running().await);
}
