//! Registry-backed manager for partitions hosted or tracked by this process.
//!
//! The manager owns partition construction and sequences Init/Load/Unload.
//! It is the single source of truth for "which partitions are registered
//! here"; callers (the lease event sink, request routers) only ever go through
//! it.
//!
//! # Double-hosting guard
//!
//! `load_partition` inserts the registry entry *before* initializing or loading
//! the partition, and `unload_partition` erases it only *after* a successful
//! unload. A second load for the same id therefore fails with `AlreadyExists`
//! until the first instance is certainly gone.
//!
//! # Shutdown
//!
//! `stop` flips the running flag and then drains: it repeatedly walks the
//! registry, unloads every Loaded partition and erases every Unloaded one
//! until nothing is left. A load that inserted its entry just as `stop` ran
//! notices the cleared flag and removes its own entry.
//!
//! An entry whose unload fails, or whose partition sits between lifecycle
//! states with no manager call driving it, can never drain. `stop` sets such
//! entries aside, keeps draining the rest and returns the first failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::config::ConfigProvider;
use crate::constants::{
    DEFAULT_TRANSACTION_MANAGER_CAPACITY, PBS_JOURNAL_SERVICE_BUCKET_NAME,
    PBS_TRANSACTION_MANAGER_CAPACITY, STOP_DRAIN_PASS_INTERVAL,
};
use crate::error::{PartitionError, PartitionResult};
use crate::partition::{LocalPbsPartition, RemotePbsPartition};
use crate::partition_registry::{PartitionManagerMapEntry, PartitionRegistry};
use crate::partition_state::PartitionLoadUnloadState;
use crate::traits::{
    Partition, PartitionManager, PartitionServicesFactory, PbsPartition, PbsPartitionManager,
};
use crate::types::{
    LocalPartitionSettings, PartitionAddressUri, PartitionId, PartitionMetadata, PartitionType,
};

/// Builds the partition for a load request. Receives the settings read
/// during `init`.
pub type PartitionFactory = Arc<
    dyn Fn(&PartitionMetadata, &LocalPartitionSettings) -> PartitionResult<Arc<dyn PbsPartition>>
        + Send
        + Sync,
>;

/// Partition manager for the privacy budget service.
pub struct BudgetPartitionManager {
    config_provider: Arc<dyn ConfigProvider>,
    partition_factory: PartitionFactory,
    /// Read once by `init`.
    settings: OnceCell<LocalPartitionSettings>,
    registry: PartitionRegistry,
    running: AtomicBool,
}

impl BudgetPartitionManager {
    /// Create a manager whose local partitions own services built by
    /// `services_factory`.
    pub fn new(
        config_provider: Arc<dyn ConfigProvider>,
        services_factory: Arc<dyn PartitionServicesFactory>,
    ) -> Self {
        Self::with_partition_factory(config_provider, default_partition_factory(services_factory))
    }

    /// Create a manager with a custom partition constructor.
    pub fn with_partition_factory(
        config_provider: Arc<dyn ConfigProvider>,
        partition_factory: PartitionFactory,
    ) -> Self {
        Self {
            config_provider,
            partition_factory,
            settings: OnceCell::new(),
            registry: PartitionRegistry::new(),
            running: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Registered partitions that are currently Loaded.
    pub fn loaded_partition_count(&self) -> usize {
        self.registry
            .keys()
            .into_iter()
            .filter_map(|id| self.registry.find(id).ok())
            .filter(|entry| entry.partition().state() == PartitionLoadUnloadState::Loaded)
            .count()
    }

    /// Snapshot of every registered id, whatever its state.
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        self.registry.keys()
    }

    fn ensure_running(&self) -> PartitionResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(PartitionError::NotRunning)
        }
    }

    fn find_entry(&self, partition_id: PartitionId) -> PartitionResult<Arc<PartitionManagerMapEntry>> {
        self.ensure_running()?;
        self.registry.find(partition_id)
    }

    fn is_registered(&self, entry: &Arc<PartitionManagerMapEntry>) -> bool {
        self.registry
            .find(entry.partition_id())
            .is_ok_and(|current| Arc::ptr_eq(&current, entry))
    }

    /// Discard an entry whose load did not complete.
    fn discard(&self, entry: &Arc<PartitionManagerMapEntry>) {
        if let Err(e) = self.registry.erase(entry) {
            debug!(partition_id = %entry.partition_id(), error = %e, "Entry already gone");
        }
    }

    async fn drain(&self) -> PartitionResult<()> {
        let mut first_failure: Option<PartitionError> = None;
        // Entries that can never drain. Kept by identity, not id.
        let mut abandoned: Vec<Arc<PartitionManagerMapEntry>> = Vec::new();

        loop {
            let entries: Vec<_> = self
                .registry
                .keys()
                .into_iter()
                .filter_map(|id| self.registry.find(id).ok())
                .filter(|entry| !abandoned.iter().any(|a| Arc::ptr_eq(a, entry)))
                .collect();
            if entries.is_empty() {
                break;
            }

            for entry in entries {
                let id = entry.partition_id();
                let partition = entry.partition().clone();

                if partition.state() == PartitionLoadUnloadState::Loaded {
                    let unloaded = {
                        let _operation = entry.begin_operation();
                        partition.unload().await
                    };
                    // Invalid state means another caller won the unload.
                    if let Err(e) = unloaded
                        && !e.is_invalid_state()
                    {
                        error!(partition_id = %id, error = %e, "Failed to unload partition during stop");
                        first_failure.get_or_insert(PartitionError::unload_failure(id, e));
                        abandoned.push(entry);
                        continue;
                    }
                }

                match partition.state() {
                    PartitionLoadUnloadState::Unloaded => self.discard(&entry),
                    PartitionLoadUnloadState::Loaded => {}
                    // The state is only final once nobody is driving it. Loads
                    // that give up erase their entry before letting go.
                    state
                        if !entry.has_operation_in_flight()
                            && partition.state() == state
                            && self.is_registered(&entry) =>
                    {
                        error!(
                            partition_id = %id,
                            state = %state,
                            "Partition stuck between lifecycle states during stop"
                        );
                        first_failure.get_or_insert(PartitionError::unload_failure(
                            id,
                            PartitionError::InvalidState {
                                partition_id: id,
                                operation: "stop",
                                state,
                            },
                        ));
                        abandoned.push(entry);
                    }
                    _ => {}
                }
            }

            tokio::time::sleep(STOP_DRAIN_PASS_INTERVAL).await;
        }

        match first_failure {
            Some(e) => {
                warn!(
                    abandoned = abandoned.len(),
                    "Partition manager stopped with partitions left registered"
                );
                Err(e)
            }
            None => Ok(()),
        }
    }
}

/// Remote metadata yields a stub; local metadata yields a full partition.
pub fn default_partition_factory(
    services_factory: Arc<dyn PartitionServicesFactory>,
) -> PartitionFactory {
    Arc::new(move |metadata: &PartitionMetadata, settings: &LocalPartitionSettings| {
        let partition: Arc<dyn PbsPartition> = match metadata.partition_type {
            PartitionType::Remote => Arc::new(RemotePbsPartition::new(metadata.partition_id)),
            PartitionType::Local => Arc::new(LocalPbsPartition::new(
                metadata.partition_id,
                settings.clone(),
                services_factory.clone(),
            )),
        };
        Ok(partition)
    })
}

#[async_trait]
impl PartitionManager for BudgetPartitionManager {
    async fn init(&self) -> PartitionResult<()> {
        if self.is_running() {
            return Err(PartitionError::AlreadyRunning);
        }

        let journal_bucket_name = self
            .config_provider
            .get_string(PBS_JOURNAL_SERVICE_BUCKET_NAME)
            .inspect_err(|e| error!(error = %e, "Failed to read journal bucket name"))?;
        let transaction_manager_capacity = self
            .config_provider
            .get_u64_or(
                PBS_TRANSACTION_MANAGER_CAPACITY,
                DEFAULT_TRANSACTION_MANAGER_CAPACITY,
            )
            .inspect_err(|e| error!(error = %e, "Failed to read transaction manager capacity"))?;

        info!(
            journal_bucket_name = %journal_bucket_name,
            transaction_manager_capacity,
            "Partition manager initialized"
        );
        let settings = LocalPartitionSettings {
            journal_bucket_name,
            transaction_manager_capacity,
        };
        if self.settings.set(settings).is_err() {
            warn!("Partition manager initialized more than once, keeping first settings");
        }
        Ok(())
    }

    async fn run(&self) -> PartitionResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PartitionError::AlreadyRunning);
        }
        info!("Partition manager running");
        Ok(())
    }

    async fn stop(&self) -> PartitionResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(PartitionError::NotRunning);
        }

        info!(
            registered = self.registry.len(),
            "Stopping partition manager, unloading partitions"
        );
        self.drain().await?;
        info!("Partition manager stopped");
        Ok(())
    }

    async fn load_partition(&self, metadata: &PartitionMetadata) -> PartitionResult<()> {
        self.ensure_running()?;
        let partition_id = metadata.partition_id;

        let settings = self.settings.get().ok_or_else(|| {
            PartitionError::Config("partition manager loaded a partition before init".to_string())
        })?;
        let partition = (self.partition_factory)(metadata, settings)?;
        let entry = Arc::new(PartitionManagerMapEntry::new(metadata, partition.clone()));
        let _operation = entry.begin_operation();
        self.registry.insert(entry.clone())?;

        // Stop may have drained the registry between our running check and
        // the insert.
        if !self.is_running() {
            self.discard(&entry);
            info!(partition_id = %partition_id, "Discarded partition load racing with stop");
            return Ok(());
        }

        if let Err(e) = partition.init().await {
            self.discard(&entry);
            error!(partition_id = %partition_id, error = %e, "Cannot init partition");
            return Err(PartitionError::load_failure(partition_id, e));
        }

        if let Err(e) = partition.load().await {
            self.discard(&entry);
            error!(partition_id = %partition_id, error = %e, "Cannot load partition");
            return Err(PartitionError::load_failure(partition_id, e));
        }

        debug!(
            partition_id = %partition_id,
            partition_type = %metadata.partition_type,
            "Partition loaded"
        );
        Ok(())
    }

    async fn unload_partition(&self, metadata: &PartitionMetadata) -> PartitionResult<()> {
        let partition_id = metadata.partition_id;
        let entry = self.find_entry(partition_id)?;
        let _operation = entry.begin_operation();

        if let Err(e) = entry.partition().unload().await {
            error!(partition_id = %partition_id, error = %e, "Cannot unload partition");
            return Err(PartitionError::unload_failure(partition_id, e));
        }

        // Only now may another load for this id proceed.
        self.registry.erase(&entry)?;

        debug!(
            partition_id = %partition_id,
            partition_type = %entry.partition_type(),
            "Partition unloaded"
        );
        Ok(())
    }

    async fn refresh_partition_address(&self, metadata: &PartitionMetadata) -> PartitionResult<()> {
        let entry = self.find_entry(metadata.partition_id)?;
        if entry.partition_type() != metadata.partition_type {
            return Err(PartitionError::TypeMismatch {
                partition_id: metadata.partition_id,
                expected: metadata.partition_type,
                actual: entry.partition_type(),
            });
        }

        entry
            .set_address(metadata.partition_address_uri.clone())
            .await;
        Ok(())
    }

    async fn get_partition_address(
        &self,
        partition_id: PartitionId,
    ) -> PartitionResult<PartitionAddressUri> {
        Ok(self.find_entry(partition_id)?.address().await)
    }

    fn get_partition_type(&self, partition_id: PartitionId) -> PartitionResult<PartitionType> {
        Ok(self.find_entry(partition_id)?.partition_type())
    }

    fn get_partition(&self, partition_id: PartitionId) -> PartitionResult<Arc<dyn Partition>> {
        let partition: Arc<dyn Partition> = self.find_entry(partition_id)?.partition().clone();
        Ok(partition)
    }
}

impl PbsPartitionManager for BudgetPartitionManager {
    fn get_pbs_partition(
        &self,
        partition_id: PartitionId,
    ) -> PartitionResult<Arc<dyn PbsPartition>> {
        Ok(self.find_entry(partition_id)?.partition().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfigProvider;
    use crate::mock::{MockPartition, MockPartitionServicesFactory, fixed_partition_factory};

    fn provider() -> Arc<dyn ConfigProvider> {
        Arc::new(StaticConfigProvider::new().with(PBS_JOURNAL_SERVICE_BUCKET_NAME, "journals"))
    }

    async fn running_manager() -> BudgetPartitionManager {
        let manager =
            BudgetPartitionManager::new(provider(), Arc::new(MockPartitionServicesFactory::new()));
        manager.init().await.unwrap();
        manager.run().await.unwrap();
        manager
    }

    fn id(n: u64) -> PartitionId {
        PartitionId::from_words(0, n)
    }

    #[tokio::test]
    async fn test_init_requires_bucket_name() {
        let manager = BudgetPartitionManager::new(
            Arc::new(StaticConfigProvider::new()),
            Arc::new(MockPartitionServicesFactory::new()),
        );
        assert!(matches!(
            manager.init().await,
            Err(PartitionError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_load_before_init_is_config_error() {
        let factory = Arc::new(MockPartitionServicesFactory::new());
        let manager = BudgetPartitionManager::new(provider(), factory.clone());
        manager.run().await.unwrap();

        let err = manager
            .load_partition(&PartitionMetadata::local(id(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, PartitionError::Config(_)));
        assert!(manager.partition_ids().is_empty());
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_init_settings_reach_local_partitions() {
        let factory = Arc::new(MockPartitionServicesFactory::new());
        let manager = BudgetPartitionManager::new(
            Arc::new(
                StaticConfigProvider::new()
                    .with(PBS_JOURNAL_SERVICE_BUCKET_NAME, "journals")
                    .with(PBS_TRANSACTION_MANAGER_CAPACITY, "64"),
            ),
            factory.clone(),
        );
        manager.init().await.unwrap();
        manager.run().await.unwrap();

        manager
            .load_partition(&PartitionMetadata::local(id(1)))
            .await
            .unwrap();
        manager
            .load_partition(&PartitionMetadata::remote(id(2), "https://peer"))
            .await
            .unwrap();

        assert_eq!(
            factory.settings_seen(),
            vec![LocalPartitionSettings {
                journal_bucket_name: "journals".to_string(),
                transaction_manager_capacity: 64,
            }]
        );
    }

    #[tokio::test]
    async fn test_capacity_defaults_when_unset() {
        let factory = Arc::new(MockPartitionServicesFactory::new());
        let manager = BudgetPartitionManager::new(provider(), factory.clone());
        manager.init().await.unwrap();
        manager.run().await.unwrap();
        manager
            .load_partition(&PartitionMetadata::local(id(1)))
            .await
            .unwrap();

        assert_eq!(
            factory.settings_seen()[0].transaction_manager_capacity,
            DEFAULT_TRANSACTION_MANAGER_CAPACITY
        );
    }

    #[tokio::test]
    async fn test_init_rejects_malformed_capacity() {
        let manager = BudgetPartitionManager::new(
            Arc::new(
                StaticConfigProvider::new()
                    .with(PBS_JOURNAL_SERVICE_BUCKET_NAME, "journals")
                    .with(PBS_TRANSACTION_MANAGER_CAPACITY, "lots"),
            ),
            Arc::new(MockPartitionServicesFactory::new()),
        );
        assert!(matches!(
            manager.init().await,
            Err(PartitionError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_run_stop_lifecycle() {
        let manager = running_manager().await;
        assert!(matches!(manager.run().await, Err(PartitionError::AlreadyRunning)));
        assert!(matches!(manager.init().await, Err(PartitionError::AlreadyRunning)));
        manager.stop().await.unwrap();
        assert!(matches!(manager.stop().await, Err(PartitionError::NotRunning)));
    }

    #[tokio::test]
    async fn test_operations_fail_when_not_running() {
        let manager =
            BudgetPartitionManager::new(provider(), Arc::new(MockPartitionServicesFactory::new()));
        let metadata = PartitionMetadata::local(id(1));

        assert!(matches!(
            manager.load_partition(&metadata).await,
            Err(PartitionError::NotRunning)
        ));
        assert!(matches!(
            manager.unload_partition(&metadata).await,
            Err(PartitionError::NotRunning)
        ));
        assert!(matches!(
            manager.get_partition_type(id(1)),
            Err(PartitionError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_load_twice_already_exists() {
        let manager = running_manager().await;
        let metadata = PartitionMetadata::local(id(1));

        manager.load_partition(&metadata).await.unwrap();
        let err = manager.load_partition(&metadata).await.unwrap_err();
        assert!(matches!(err, PartitionError::AlreadyExists(p) if p == id(1)));
        assert_eq!(manager.loaded_partition_count(), 1);
    }

    #[tokio::test]
    async fn test_load_unload_round_trip() {
        let manager = running_manager().await;
        let metadata = PartitionMetadata::local(id(2));

        for _ in 0..3 {
            manager.load_partition(&metadata).await.unwrap();
            assert_eq!(
                manager.get_pbs_partition(id(2)).unwrap().state(),
                PartitionLoadUnloadState::Loaded
            );
            manager.unload_partition(&metadata).await.unwrap();
            assert!(manager.get_partition(id(2)).err().unwrap().is_does_not_exist());
        }
    }

    #[tokio::test]
    async fn test_failed_load_cleans_up_entry() {
        let mock = Arc::new(MockPartition::new(id(3), PartitionType::Local));
        mock.fail_load(true);
        let manager =
            BudgetPartitionManager::with_partition_factory(provider(), fixed_partition_factory(mock));
        manager.init().await.unwrap();
        manager.run().await.unwrap();

        let err = manager
            .load_partition(&PartitionMetadata::local(id(3)))
            .await
            .unwrap_err();
        assert!(matches!(err, PartitionError::LoadFailure { .. }));
        assert!(manager.partition_ids().is_empty());
    }

    #[tokio::test]
    async fn test_failed_unload_keeps_entry() {
        let mock = Arc::new(MockPartition::new(id(4), PartitionType::Local));
        mock.fail_unload(true);
        let manager =
            BudgetPartitionManager::with_partition_factory(provider(), fixed_partition_factory(mock));
        manager.init().await.unwrap();
        manager.run().await.unwrap();

        let metadata = PartitionMetadata::local(id(4));
        manager.load_partition(&metadata).await.unwrap();
        let err = manager.unload_partition(&metadata).await.unwrap_err();
        assert!(matches!(err, PartitionError::UnloadFailure { .. }));
        assert_eq!(manager.partition_ids(), vec![id(4)]);
    }

    #[tokio::test]
    async fn test_refresh_address_type_mismatch() {
        let manager = running_manager().await;
        manager
            .load_partition(&PartitionMetadata::remote(id(5), "https://a"))
            .await
            .unwrap();

        manager
            .refresh_partition_address(&PartitionMetadata::remote(id(5), "https://b"))
            .await
            .unwrap();
        assert_eq!(manager.get_partition_address(id(5)).await.unwrap(), "https://b");

        let err = manager
            .refresh_partition_address(&PartitionMetadata::local(id(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, PartitionError::TypeMismatch { .. }));
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_stop_drains_everything() {
        let manager = running_manager().await;
        for n in 10..15 {
            manager
                .load_partition(&PartitionMetadata::local(id(n)))
                .await
                .unwrap();
        }
        manager
            .load_partition(&PartitionMetadata::remote(id(20), "https://peer"))
            .await
            .unwrap();

        manager.stop().await.unwrap();
        assert!(manager.partition_ids().is_empty());
    }

    #[tokio::test]
    async fn test_stop_returns_hard_unload_failure() {
        let mock = Arc::new(MockPartition::new(id(6), PartitionType::Local));
        mock.fail_unload(true);
        let manager =
            BudgetPartitionManager::with_partition_factory(provider(), fixed_partition_factory(mock));
        manager.init().await.unwrap();
        manager.run().await.unwrap();
        manager
            .load_partition(&PartitionMetadata::local(id(6)))
            .await
            .unwrap();

        let err = manager.stop().await.unwrap_err();
        assert!(matches!(err, PartitionError::UnloadFailure { .. }));
    }

    #[tokio::test]
    async fn test_stop_keeps_draining_past_a_failure() {
        let failing = Arc::new(MockPartition::new(id(7), PartitionType::Local));
        failing.fail_unload(true);
        let healthy = Arc::new(MockPartition::new(id(8), PartitionType::Local));

        let factory: PartitionFactory = {
            let failing = failing.clone();
            let healthy = healthy.clone();
            Arc::new(move |metadata: &PartitionMetadata, _: &LocalPartitionSettings| {
                let p: Arc<dyn PbsPartition> = if metadata.partition_id == id(7) {
                    failing.clone()
                } else {
                    healthy.clone()
                };
                Ok(p)
            })
        };
        let manager = BudgetPartitionManager::with_partition_factory(provider(), factory);
        manager.init().await.unwrap();
        manager.run().await.unwrap();
        for n in [7, 8] {
            manager
                .load_partition(&PartitionMetadata::local(id(n)))
                .await
                .unwrap();
        }

        let err = manager.stop().await.unwrap_err();
        assert!(matches!(err, PartitionError::UnloadFailure { partition_id, .. } if partition_id == id(7)));
        assert_eq!(healthy.state(), PartitionLoadUnloadState::Unloaded);
        assert_eq!(manager.partition_ids(), vec![id(7)]);
    }
}
