use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::{error, info};

use crate::constants::REQUEST_LOG_SAMPLE_INTERVAL;
use crate::error::{PartitionError, PartitionResult};
use crate::metrics;
use crate::partition_state::{AtomicPartitionState, PartitionLoadUnloadState};
use crate::traits::{Partition, PartitionServices, PartitionServicesFactory, PbsPartition};
use crate::types::{
    GetTransactionManagerStatusRequest, GetTransactionManagerStatusResponse,
    GetTransactionStatusRequest, GetTransactionStatusResponse, LocalPartitionSettings, PartitionId,
    PartitionType, TransactionPhaseRequest, TransactionPhaseResponse, TransactionRequest, TransactionResponse,
};

use PartitionLoadUnloadState::*;

/// How often recovery progress is logged while waiting on the journal.
const RECOVERY_PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// A partition hosted and served by this process.
pub struct LocalPbsPartition {
    partition_id: PartitionId,
    settings: LocalPartitionSettings,
    services_factory: Arc<dyn PartitionServicesFactory>,
    /// Set by the one `init` call allowed to build services.
    init_claimed: AtomicBool,
    /// Built once by `init`.
    services: OnceCell<PartitionServices>,
    state: AtomicPartitionState,
    requests_seen: AtomicU64,
}

impl LocalPbsPartition {
    pub fn new(
        partition_id: PartitionId,
        settings: LocalPartitionSettings,
        services_factory: Arc<dyn PartitionServicesFactory>,
    ) -> Self {
        Self {
            partition_id,
            settings,
            services_factory,
            init_claimed: AtomicBool::new(false),
            services: OnceCell::new(),
            state: AtomicPartitionState::new(partition_id),
            requests_seen: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &LocalPartitionSettings {
        &self.settings
    }

    /// Requests accepted since construction.
    pub fn requests_seen(&self) -> u64 {
        self.requests_seen.load(Ordering::Relaxed)
    }

    fn services(&self) -> PartitionResult<&PartitionServices> {
        self.services
            .get()
            .ok_or(PartitionError::NotLoaded(self.partition_id))
    }

    /// Admit a request: the partition must be Loaded.
    fn admit_request(&self) -> PartitionResult<&PartitionServices> {
        if !self.state.load().is_serving() {
            return Err(PartitionError::NotLoaded(self.partition_id));
        }

        let seen = self.requests_seen.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_partition_request(self.partition_id);
        if seen % REQUEST_LOG_SAMPLE_INTERVAL == 0 {
            info!(
                partition_id = %self.partition_id,
                requests_seen = seen,
                "Partition request count"
            );
        }

        self.services()
    }

    async fn recover(&self, services: &PartitionServices) -> PartitionResult<()> {
        info!(partition_id = %self.partition_id, "Starting log recovery");
        let started = Instant::now();

        let recovery = services.journal.recover();
        tokio::pin!(recovery);

        let mut progress = tokio::time::interval(RECOVERY_PROGRESS_LOG_INTERVAL);
        progress.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut recovery => break result,
                _ = progress.tick() => {
                    info!(
                        partition_id = %self.partition_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Waiting on log recovery to complete"
                    );
                }
            }
        };

        if let Err(e) = result {
            error!(partition_id = %self.partition_id, error = %e, "CRITICAL: Log recovery failed");
            return Err(PartitionError::RecoveryFailed(e.to_string()));
        }

        info!(
            partition_id = %self.partition_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Done with log recovery"
        );
        Ok(())
    }
}

#[async_trait]
impl Partition for LocalPbsPartition {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn partition_type(&self) -> PartitionType {
        PartitionType::Local
    }

    async fn init(&self) -> PartitionResult<()> {
        let current = self.state.load();
        let claimed = current == Created
            && self
                .init_claimed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
        if !claimed {
            return Err(PartitionError::InvalidState {
                partition_id: self.partition_id,
                operation: "init",
                state: current,
            });
        }

        let services = self
            .services_factory
            .create(self.partition_id, &self.settings)?;

        services.journal.init().await?;
        services.budget_key_provider.init().await?;
        services.transaction_manager.init().await?;
        services.checkpoint.init().await?;

        if self.services.set(services).is_err() {
            return Err(PartitionError::InvalidState {
                partition_id: self.partition_id,
                operation: "init",
                state: self.state.load(),
            });
        }
        self.state.transition(Created, Initialized, "init")?;

        info!(partition_id = %self.partition_id, "Initialized partition");
        Ok(())
    }

    async fn load(&self) -> PartitionResult<()> {
        self.state.transition(Initialized, Loading, "load")?;
        info!(partition_id = %self.partition_id, "Loading partition");

        let services = self.services()?;
        self.recover(services).await?;

        services.journal.run().await?;
        services.budget_key_provider.run().await?;
        services.transaction_manager.run().await?;
        services.checkpoint.run().await?;

        self.state.transition(Loading, Loaded, "load")?;
        info!(partition_id = %self.partition_id, "Loaded partition");
        Ok(())
    }

    async fn unload(&self) -> PartitionResult<()> {
        self.state.transition(Loaded, Unloading, "unload")?;
        info!(partition_id = %self.partition_id, "Unloading partition");

        let services = self.services()?;
        services.checkpoint.stop().await?;
        services.transaction_manager.stop().await?;
        services.budget_key_provider.stop().await?;
        services.journal.stop().await?;

        self.state.transition(Unloading, Unloaded, "unload")?;
        info!(partition_id = %self.partition_id, "Unloaded partition");
        Ok(())
    }

    fn state(&self) -> PartitionLoadUnloadState {
        self.state.load()
    }
}

#[async_trait]
impl PbsPartition for LocalPbsPartition {
    async fn execute_transaction(
        &self,
        request: TransactionRequest,
    ) -> PartitionResult<TransactionResponse> {
        let services = self.admit_request()?;
        if request.commands.is_empty() {
            return Err(PartitionError::InvalidTransaction);
        }
        services.transaction_manager.execute(request).await
    }

    async fn execute_transaction_phase(
        &self,
        request: TransactionPhaseRequest,
    ) -> PartitionResult<TransactionPhaseResponse> {
        self.admit_request()?
            .transaction_manager
            .execute_phase(request)
            .await
    }

    async fn get_transaction_status(
        &self,
        request: GetTransactionStatusRequest,
    ) -> PartitionResult<GetTransactionStatusResponse> {
        self.admit_request()?
            .transaction_manager
            .get_transaction_status(request)
            .await
    }

    async fn get_transaction_manager_status(
        &self,
        request: GetTransactionManagerStatusRequest,
    ) -> PartitionResult<GetTransactionManagerStatusResponse> {
        self.admit_request()?
            .transaction_manager
            .get_status(request)
            .await
    }
}
