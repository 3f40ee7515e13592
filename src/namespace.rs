//! Resource id to partition id mapping.
//!
//! The mapping hashes the resource id with XXH3-64 and reduces the hash modulo
//! the partition count. XXH3 is seedless here and platform independent, so
//! every process in the fleet computes the same answer.
//!
//! Changing the partition set is a redeployment, not a runtime operation:
//! there is no rebalancing support.

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{PartitionError, PartitionResult};
use crate::traits::PartitionNamespace;
use crate::types::PartitionId;

/// Fixed partition namespace for the privacy budget service.
#[derive(Debug, Clone)]
pub struct PbsPartitionNamespace {
    partitions: Vec<PartitionId>,
}

impl PbsPartitionNamespace {
    pub fn new(partitions: Vec<PartitionId>) -> PartitionResult<Self> {
        if partitions.is_empty() {
            return Err(PartitionError::Config(
                "partition namespace needs at least one partition".to_string(),
            ));
        }
        Ok(Self { partitions })
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

impl PartitionNamespace for PbsPartitionNamespace {
    fn map_resource_to_partition(&self, resource_id: &str) -> PartitionId {
        let index = xxh3_64(resource_id.as_bytes()) % self.partitions.len() as u64;
        self.partitions[index as usize]
    }

    fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }
}
