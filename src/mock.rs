//! In-memory test doubles for every collaborator of the partition layer.
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! pbs-partitions = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{PartitionError, PartitionResult};
use crate::partition_manager::PartitionFactory;
use crate::partition_state::{AtomicPartitionState, PartitionLoadUnloadState};
use crate::traits::{
    BudgetKeyProvider, CheckpointService, JournalService, LeaseAcquisitionPreferenceSetter,
    LeaseReleaseNotification, LeaseStatistics, Partition, PartitionComponent, PartitionManager,
    PartitionServices, PartitionServicesFactory, PbsPartition, TransactionManager,
};
use crate::types::{
    GetTransactionManagerStatusRequest, GetTransactionManagerStatusResponse,
    GetTransactionStatusRequest, GetTransactionStatusResponse, LeasableLockId,
    LeaseAcquisitionPreference, LocalPartitionSettings, PartitionAddressUri, PartitionId,
    PartitionMetadata, PartitionType, TransactionPhaseRequest, TransactionPhaseResponse, TransactionRequest,
    TransactionResponse,
};

use PartitionLoadUnloadState::*;

fn injected(component: &'static str, operation: &'static str) -> PartitionError {
    PartitionError::component(component, operation, "injected failure")
}

/// Sleep up to `max_ms`, chosen at random. No-op when zero.
async fn jitter(max_ms: u64) {
    if max_ms > 0 {
        tokio::time::sleep(Duration::from_millis(fastrand::u64(0..=max_ms))).await;
    }
}

// ============================================================================
// MockPartition
// ============================================================================

/// Partition with scripted failures, an optional load gate and random delays.
pub struct MockPartition {
    partition_id: PartitionId,
    partition_type: PartitionType,
    state: AtomicPartitionState,
    fail_init: AtomicBool,
    fail_load: AtomicBool,
    fail_unload: AtomicBool,
    block_load: AtomicBool,
    load_started: Notify,
    load_gate: Notify,
    max_delay_ms: AtomicU64,
    load_calls: AtomicUsize,
    unload_calls: AtomicUsize,
}

impl MockPartition {
    pub fn new(partition_id: PartitionId, partition_type: PartitionType) -> Self {
        Self {
            partition_id,
            partition_type,
            state: AtomicPartitionState::new(partition_id),
            fail_init: AtomicBool::new(false),
            fail_load: AtomicBool::new(false),
            fail_unload: AtomicBool::new(false),
            block_load: AtomicBool::new(false),
            load_started: Notify::new(),
            load_gate: Notify::new(),
            max_delay_ms: AtomicU64::new(0),
            load_calls: AtomicUsize::new(0),
            unload_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    pub fn fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    /// A failing unload leaves the partition Loaded.
    pub fn fail_unload(&self, fail: bool) {
        self.fail_unload.store(fail, Ordering::SeqCst);
    }

    /// Hold every load in the Loading state until [`release_load`](Self::release_load).
    pub fn block_load(&self, block: bool) {
        self.block_load.store(block, Ordering::SeqCst);
    }

    pub fn release_load(&self) {
        self.load_gate.notify_one();
    }

    /// Resolves once a blocked load has entered Loading.
    pub async fn wait_load_started(&self) {
        self.load_started.notified().await;
    }

    /// Add a random delay of up to `max` to each lifecycle step.
    pub fn random_delay(&self, max: Duration) {
        self.max_delay_ms
            .store(max.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn unload_calls(&self) -> usize {
        self.unload_calls.load(Ordering::SeqCst)
    }

    fn admit(&self) -> PartitionResult<()> {
        if self.state.load() == Loaded {
            Ok(())
        } else {
            Err(PartitionError::NotLoaded(self.partition_id))
        }
    }
}

#[async_trait]
impl Partition for MockPartition {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn partition_type(&self) -> PartitionType {
        self.partition_type
    }

    async fn init(&self) -> PartitionResult<()> {
        jitter(self.max_delay_ms.load(Ordering::SeqCst)).await;
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(injected("mock_partition", "init"));
        }
        self.state.transition(Created, Initialized, "init")
    }

    async fn load(&self) -> PartitionResult<()> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        self.state.transition(Initialized, Loading, "load")?;

        if self.block_load.load(Ordering::SeqCst) {
            self.load_started.notify_one();
            self.load_gate.notified().await;
        }
        jitter(self.max_delay_ms.load(Ordering::SeqCst)).await;

        if self.fail_load.load(Ordering::SeqCst) {
            return Err(injected("mock_partition", "load"));
        }
        self.state.transition(Loading, Loaded, "load")
    }

    async fn unload(&self) -> PartitionResult<()> {
        self.unload_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_unload.load(Ordering::SeqCst) {
            return Err(injected("mock_partition", "unload"));
        }
        self.state.transition(Loaded, Unloading, "unload")?;
        jitter(self.max_delay_ms.load(Ordering::SeqCst)).await;
        self.state.transition(Unloading, Unloaded, "unload")
    }

    fn state(&self) -> PartitionLoadUnloadState {
        self.state.load()
    }
}

#[async_trait]
impl PbsPartition for MockPartition {
    async fn execute_transaction(
        &self,
        request: TransactionRequest,
    ) -> PartitionResult<TransactionResponse> {
        self.admit()?;
        Ok(TransactionResponse {
            transaction_id: request.transaction_id,
            last_execution_timestamp: 1,
        })
    }

    async fn execute_transaction_phase(
        &self,
        request: TransactionPhaseRequest,
    ) -> PartitionResult<TransactionPhaseResponse> {
        self.admit()?;
        Ok(TransactionPhaseResponse {
            last_execution_timestamp: request.last_execution_timestamp + 1,
        })
    }

    async fn get_transaction_status(
        &self,
        _request: GetTransactionStatusRequest,
    ) -> PartitionResult<GetTransactionStatusResponse> {
        self.admit()?;
        Ok(GetTransactionStatusResponse::default())
    }

    async fn get_transaction_manager_status(
        &self,
        _request: GetTransactionManagerStatusRequest,
    ) -> PartitionResult<GetTransactionManagerStatusResponse> {
        self.admit()?;
        Ok(GetTransactionManagerStatusResponse::default())
    }
}

/// Factory that hands out the same partition for every load.
pub fn fixed_partition_factory(partition: Arc<MockPartition>) -> PartitionFactory {
    Arc::new(move |_: &PartitionMetadata, _: &LocalPartitionSettings| {
        let p: Arc<dyn PbsPartition> = partition.clone();
        Ok(p)
    })
}

/// Factory that builds a fresh mock per load, each with up to `max_delay` of
/// random delay per lifecycle step.
pub fn jittered_partition_factory(max_delay: Duration) -> PartitionFactory {
    Arc::new(move |metadata: &PartitionMetadata, _: &LocalPartitionSettings| {
        let partition = MockPartition::new(metadata.partition_id, metadata.partition_type);
        partition.random_delay(max_delay);
        let p: Arc<dyn PbsPartition> = Arc::new(partition);
        Ok(p)
    })
}

// ============================================================================
// MockPartitionManager
// ============================================================================

/// One call observed by [`MockPartitionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerCall {
    Load(PartitionMetadata),
    Unload(PartitionMetadata),
    Refresh(PartitionMetadata),
}

/// Registry-like manager that records calls.
///
/// Semantics follow the real manager: duplicate loads fail with
/// `AlreadyExists`, unloading or refreshing an unknown id fails with
/// `DoesNotExist`, and refreshing across types fails with `TypeMismatch`.
#[derive(Default)]
pub struct MockPartitionManager {
    calls: Mutex<Vec<ManagerCall>>,
    registered: Mutex<HashMap<PartitionId, (PartitionMetadata, Arc<MockPartition>)>>,
    fail_load: AtomicBool,
    fail_unload: AtomicBool,
    fail_refresh: AtomicBool,
    block_local_loads: AtomicBool,
    load_started: Notify,
    load_gate: Notify,
}

impl MockPartitionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ManagerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn load_count(&self, partition_id: PartitionId) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ManagerCall::Load(m) if m.partition_id == partition_id))
            .count()
    }

    pub fn unload_count(&self, partition_id: PartitionId) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ManagerCall::Unload(m) if m.partition_id == partition_id))
            .count()
    }

    /// Metadata of the registered partition, if any.
    pub fn registered(&self, partition_id: PartitionId) -> Option<PartitionMetadata> {
        self.registered
            .lock()
            .unwrap()
            .get(&partition_id)
            .map(|(m, _)| m.clone())
    }

    pub fn fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn fail_unload(&self, fail: bool) {
        self.fail_unload.store(fail, Ordering::SeqCst);
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::SeqCst);
    }

    /// Hold local loads until [`release_load`](Self::release_load).
    pub fn block_local_loads(&self, block: bool) {
        self.block_local_loads.store(block, Ordering::SeqCst);
    }

    pub fn release_load(&self) {
        self.load_gate.notify_one();
    }

    pub async fn wait_load_started(&self) {
        self.load_started.notified().await;
    }

    fn record(&self, call: ManagerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PartitionManager for MockPartitionManager {
    async fn init(&self) -> PartitionResult<()> {
        Ok(())
    }

    async fn run(&self) -> PartitionResult<()> {
        Ok(())
    }

    async fn stop(&self) -> PartitionResult<()> {
        self.registered.lock().unwrap().clear();
        Ok(())
    }

    async fn load_partition(&self, metadata: &PartitionMetadata) -> PartitionResult<()> {
        self.record(ManagerCall::Load(metadata.clone()));

        if metadata.partition_type == PartitionType::Local
            && self.block_local_loads.load(Ordering::SeqCst)
        {
            self.load_started.notify_one();
            self.load_gate.notified().await;
        }

        if self.fail_load.load(Ordering::SeqCst) {
            return Err(PartitionError::load_failure(
                metadata.partition_id,
                injected("mock_manager", "load"),
            ));
        }

        let mut registered = self.registered.lock().unwrap();
        if registered.contains_key(&metadata.partition_id) {
            return Err(PartitionError::AlreadyExists(metadata.partition_id));
        }
        let partition = Arc::new(MockPartition::new(
            metadata.partition_id,
            metadata.partition_type,
        ));
        partition.state.store(Loaded);
        registered.insert(metadata.partition_id, (metadata.clone(), partition));
        Ok(())
    }

    async fn unload_partition(&self, metadata: &PartitionMetadata) -> PartitionResult<()> {
        self.record(ManagerCall::Unload(metadata.clone()));

        if self.fail_unload.load(Ordering::SeqCst) {
            return Err(PartitionError::unload_failure(
                metadata.partition_id,
                injected("mock_manager", "unload"),
            ));
        }

        match self.registered.lock().unwrap().remove(&metadata.partition_id) {
            Some(_) => Ok(()),
            None => Err(PartitionError::DoesNotExist(metadata.partition_id)),
        }
    }

    async fn refresh_partition_address(
        &self,
        metadata: &PartitionMetadata,
    ) -> PartitionResult<()> {
        self.record(ManagerCall::Refresh(metadata.clone()));

        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(injected("mock_manager", "refresh"));
        }

        let mut registered = self.registered.lock().unwrap();
        let Some((current, _)) = registered.get_mut(&metadata.partition_id) else {
            return Err(PartitionError::DoesNotExist(metadata.partition_id));
        };
        if current.partition_type != metadata.partition_type {
            return Err(PartitionError::TypeMismatch {
                partition_id: metadata.partition_id,
                expected: metadata.partition_type,
                actual: current.partition_type,
            });
        }
        current.partition_address_uri = metadata.partition_address_uri.clone();
        Ok(())
    }

    async fn get_partition_address(
        &self,
        partition_id: PartitionId,
    ) -> PartitionResult<PartitionAddressUri> {
        self.registered(partition_id)
            .map(|m| m.partition_address_uri)
            .ok_or(PartitionError::DoesNotExist(partition_id))
    }

    fn get_partition_type(&self, partition_id: PartitionId) -> PartitionResult<PartitionType> {
        self.registered(partition_id)
            .map(|m| m.partition_type)
            .ok_or(PartitionError::DoesNotExist(partition_id))
    }

    fn get_partition(&self, partition_id: PartitionId) -> PartitionResult<Arc<dyn Partition>> {
        let registered = self.registered.lock().unwrap();
        match registered.get(&partition_id) {
            Some((_, partition)) => {
                let p: Arc<dyn Partition> = partition.clone();
                Ok(p)
            }
            None => Err(PartitionError::DoesNotExist(partition_id)),
        }
    }
}

// ============================================================================
// Lease manager seams
// ============================================================================

#[derive(Default)]
pub struct MockLeaseReleaseNotification {
    released: Mutex<Vec<LeasableLockId>>,
}

impl MockLeaseReleaseNotification {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock ids reported safe to release, in order.
    pub fn released(&self) -> Vec<LeasableLockId> {
        self.released.lock().unwrap().clone()
    }
}

impl LeaseReleaseNotification for MockLeaseReleaseNotification {
    fn safe_to_release_lease(&self, lock_id: LeasableLockId) {
        self.released.lock().unwrap().push(lock_id);
    }
}

pub struct MockLeaseStatistics {
    count: AtomicUsize,
}

impl MockLeaseStatistics {
    pub fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
        }
    }

    pub fn set(&self, count: usize) {
        self.count.store(count, Ordering::SeqCst);
    }
}

impl LeaseStatistics for MockLeaseStatistics {
    fn currently_leased_locks_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockLeaseAcquisitionPreference {
    preferences: Mutex<Vec<LeaseAcquisitionPreference>>,
    fail: AtomicBool,
}

impl MockLeaseAcquisitionPreference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn preferences(&self) -> Vec<LeaseAcquisitionPreference> {
        self.preferences.lock().unwrap().clone()
    }
}

impl LeaseAcquisitionPreferenceSetter for MockLeaseAcquisitionPreference {
    fn set_lease_acquisition_preference(
        &self,
        preference: LeaseAcquisitionPreference,
    ) -> PartitionResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(injected("lease_manager", "set_preference"));
        }
        self.preferences.lock().unwrap().push(preference);
        Ok(())
    }
}

// ============================================================================
// Partition-owned services
// ============================================================================

/// One service of a local partition. Logs `"<name>:<operation>"` events into
/// the log shared with its factory.
struct MockComponent {
    name: &'static str,
    events: Arc<Mutex<Vec<String>>>,
    fail_recovery: Arc<AtomicBool>,
    fail_stop: Arc<AtomicBool>,
}

impl MockComponent {
    fn log(&self, operation: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, operation));
    }
}

#[async_trait]
impl PartitionComponent for MockComponent {
    async fn init(&self) -> PartitionResult<()> {
        self.log("init");
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn run(&self) -> PartitionResult<()> {
        self.log("run");
        Ok(())
    }

    async fn stop(&self) -> PartitionResult<()> {
        self.log("stop");
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(injected(self.name, "stop"));
        }
        Ok(())
    }
}

#[async_trait]
impl JournalService for MockComponent {
    async fn recover(&self) -> PartitionResult<()> {
        self.log("recover");
        if self.fail_recovery.load(Ordering::SeqCst) {
            return Err(injected(self.name, "recover"));
        }
        Ok(())
    }
}

impl BudgetKeyProvider for MockComponent {}

impl CheckpointService for MockComponent {}

#[async_trait]
impl TransactionManager for MockComponent {
    async fn execute(&self, request: TransactionRequest) -> PartitionResult<TransactionResponse> {
        Ok(TransactionResponse {
            transaction_id: request.transaction_id,
            last_execution_timestamp: 1,
        })
    }

    async fn execute_phase(
        &self,
        request: TransactionPhaseRequest,
    ) -> PartitionResult<TransactionPhaseResponse> {
        Ok(TransactionPhaseResponse {
            last_execution_timestamp: request.last_execution_timestamp + 1,
        })
    }

    async fn get_transaction_status(
        &self,
        _request: GetTransactionStatusRequest,
    ) -> PartitionResult<GetTransactionStatusResponse> {
        Ok(GetTransactionStatusResponse::default())
    }

    async fn get_status(
        &self,
        _request: GetTransactionManagerStatusRequest,
    ) -> PartitionResult<GetTransactionManagerStatusResponse> {
        Ok(GetTransactionManagerStatusResponse::default())
    }
}

/// Builds mock services that share one event log.
#[derive(Default)]
pub struct MockPartitionServicesFactory {
    events: Arc<Mutex<Vec<String>>>,
    fail_recovery: Arc<AtomicBool>,
    fail_stop: Arc<AtomicBool>,
    fail_create: AtomicBool,
    created: AtomicUsize,
    settings_seen: Mutex<Vec<LocalPartitionSettings>>,
}

impl MockPartitionServicesFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn fail_recovery(&self, fail: bool) {
        self.fail_recovery.store(fail, Ordering::SeqCst);
    }

    /// Every service's `stop` fails, so an unload stalls in Unloading.
    pub fn fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Settings passed to each `create` call, in order.
    pub fn settings_seen(&self) -> Vec<LocalPartitionSettings> {
        self.settings_seen.lock().unwrap().clone()
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Number of service sets built so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn component(&self, name: &'static str) -> Arc<MockComponent> {
        Arc::new(MockComponent {
            name,
            events: self.events.clone(),
            fail_recovery: self.fail_recovery.clone(),
            fail_stop: self.fail_stop.clone(),
        })
    }
}

impl PartitionServicesFactory for MockPartitionServicesFactory {
    fn create(
        &self,
        _partition_id: PartitionId,
        settings: &LocalPartitionSettings,
    ) -> PartitionResult<PartitionServices> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(injected("services_factory", "create"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        self.settings_seen.lock().unwrap().push(settings.clone());

        Ok(PartitionServices {
            journal: self.component("journal"),
            budget_key_provider: self.component("budget_key_provider"),
            transaction_manager: self.component("transaction_manager"),
            checkpoint: self.component("checkpoint"),
        })
    }
}
