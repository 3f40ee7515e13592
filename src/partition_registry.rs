//! Concurrent registry of partitions known to the partition manager.
//!
//! # Atomicity
//!
//! - `insert` is a check-and-insert under the shard lock. A live entry for the
//!   same id makes it fail with `AlreadyExists`.
//! - `find` returns an `Arc` to the entry. The handle stays usable after a
//!   concurrent `erase`.
//! - `erase` removes the entry only if it is still the exact entry the caller
//!   holds (pointer identity). An erase that lost a race against a newer
//!   insert for the same id fails with `DoesNotExist` and leaves the newer
//!   entry alone.
//!
//! Sequences of these calls are not atomic. The manager re-validates after
//! inserting and only erases after a successful unload.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;

use crate::error::{PartitionError, PartitionResult};
use crate::metrics;
use crate::traits::PbsPartition;
use crate::types::{PartitionAddressUri, PartitionId, PartitionMetadata, PartitionType};

/// One registered partition.
pub struct PartitionManagerMapEntry {
    partition_id: PartitionId,
    partition_type: PartitionType,
    /// Guarded separately so address refreshes never wait on the registry.
    partition_address_uri: RwLock<PartitionAddressUri>,
    partition: Arc<dyn PbsPartition>,
    /// Manager calls currently driving `partition` through its lifecycle.
    operations_in_flight: AtomicUsize,
}

/// Marks a lifecycle call on an entry's partition until dropped.
#[must_use]
pub struct OperationGuard<'a> {
    entry: &'a PartitionManagerMapEntry,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.entry
            .operations_in_flight
            .fetch_sub(1, Ordering::SeqCst);
    }
}

impl PartitionManagerMapEntry {
    pub fn new(metadata: &PartitionMetadata, partition: Arc<dyn PbsPartition>) -> Self {
        Self {
            partition_id: metadata.partition_id,
            partition_type: metadata.partition_type,
            partition_address_uri: RwLock::new(metadata.partition_address_uri.clone()),
            partition,
            operations_in_flight: AtomicUsize::new(0),
        }
    }

    /// Take this before any call that may move the partition's state, and
    /// hold it until the call returns.
    pub fn begin_operation(&self) -> OperationGuard<'_> {
        self.operations_in_flight.fetch_add(1, Ordering::SeqCst);
        OperationGuard { entry: self }
    }

    pub fn has_operation_in_flight(&self) -> bool {
        self.operations_in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn partition_type(&self) -> PartitionType {
        self.partition_type
    }

    pub fn partition(&self) -> &Arc<dyn PbsPartition> {
        &self.partition
    }

    pub async fn address(&self) -> PartitionAddressUri {
        self.partition_address_uri.read().await.clone()
    }

    pub async fn set_address(&self, address: PartitionAddressUri) {
        *self.partition_address_uri.write().await = address;
    }
}

impl std::fmt::Debug for PartitionManagerMapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionManagerMapEntry")
            .field("partition_id", &self.partition_id)
            .field("partition_type", &self.partition_type)
            .field("state", &self.partition.state())
            .field(
                "operations_in_flight",
                &self.operations_in_flight.load(Ordering::SeqCst),
            )
            .finish()
    }
}

/// Partition id to registry entry.
#[derive(Default)]
pub struct PartitionRegistry {
    entries: DashMap<PartitionId, Arc<PartitionManagerMapEntry>>,
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: Arc<PartitionManagerMapEntry>) -> PartitionResult<()> {
        let partition_type = entry.partition_type;
        match self.entries.entry(entry.partition_id) {
            Entry::Occupied(existing) => Err(PartitionError::AlreadyExists(*existing.key())),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                metrics::record_partition_registered(partition_type);
                Ok(())
            }
        }
    }

    pub fn find(&self, partition_id: PartitionId) -> PartitionResult<Arc<PartitionManagerMapEntry>> {
        self.entries
            .get(&partition_id)
            .map(|e| e.value().clone())
            .ok_or(PartitionError::DoesNotExist(partition_id))
    }

    pub fn erase(&self, entry: &Arc<PartitionManagerMapEntry>) -> PartitionResult<()> {
        match self
            .entries
            .remove_if(&entry.partition_id, |_, current| Arc::ptr_eq(current, entry))
        {
            Some(_) => {
                metrics::record_partition_deregistered(entry.partition_type);
                Ok(())
            }
            None => Err(PartitionError::DoesNotExist(entry.partition_id)),
        }
    }

    /// Snapshot of the registered ids.
    pub fn keys(&self) -> Vec<PartitionId> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::RemotePbsPartition;

    fn entry(id: PartitionId, address: &str) -> Arc<PartitionManagerMapEntry> {
        Arc::new(PartitionManagerMapEntry::new(
            &PartitionMetadata::remote(id, address),
            Arc::new(RemotePbsPartition::new(id)),
        ))
    }

    #[test]
    fn test_insert_rejects_duplicate() {
        let registry = PartitionRegistry::new();
        let id = PartitionId::from_words(0, 1);

        registry.insert(entry(id, "a")).unwrap();
        let err = registry.insert(entry(id, "b")).unwrap_err();
        assert!(matches!(err, PartitionError::AlreadyExists(e) if e == id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_find_missing() {
        let registry = PartitionRegistry::new();
        assert!(registry.find(PartitionId::ZERO).unwrap_err().is_does_not_exist());
    }

    #[test]
    fn test_stale_erase_keeps_newer_entry() {
        let registry = PartitionRegistry::new();
        let id = PartitionId::from_words(0, 2);

        let first = entry(id, "a");
        registry.insert(first.clone()).unwrap();
        registry.erase(&first).unwrap();

        let second = entry(id, "b");
        registry.insert(second.clone()).unwrap();

        assert!(registry.erase(&first).unwrap_err().is_does_not_exist());
        assert!(Arc::ptr_eq(&registry.find(id).unwrap(), &second));
    }

    #[tokio::test]
    async fn test_found_entry_outlives_erase() {
        let registry = PartitionRegistry::new();
        let id = PartitionId::from_words(0, 3);
        registry.insert(entry(id, "a")).unwrap();

        let found = registry.find(id).unwrap();
        registry.erase(&found).unwrap();
        assert!(registry.is_empty());

        found.set_address("c".to_string()).await;
        assert_eq!(found.address().await, "c");
        assert_eq!(found.partition().partition_id(), id);
    }

    #[test]
    fn test_operation_guard_counts_until_dropped() {
        let e = entry(PartitionId::from_words(0, 4), "a");
        assert!(!e.has_operation_in_flight());

        let first = e.begin_operation();
        let second = e.begin_operation();
        drop(first);
        assert!(e.has_operation_in_flight());
        drop(second);
        assert!(!e.has_operation_in_flight());
    }

    #[test]
    fn test_keys_snapshot() {
        let registry = PartitionRegistry::new();
        for i in 0..5 {
            registry.insert(entry(PartitionId::from_words(1, i), "x")).unwrap();
        }
        let mut keys = registry.keys();
        keys.sort();
        assert_eq!(keys.len(), 5);
        assert_eq!(keys[0], PartitionId::from_words(1, 0));
    }
}
