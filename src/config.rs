//! Configuration for the partition lifecycle components.
//!
//! Settings are read through a [`ConfigProvider`] so the same code runs
//! against process environment variables in production and an in-memory map
//! in tests.
//!
//! # Environment Variables
//!
//! | Variable | Default |
//! |----------|---------|
//! | `PBS_JOURNAL_SERVICE_BUCKET_NAME` | required by `PartitionManager::init` |
//! | `PBS_PARTITION_ID_LIST` | required |
//! | `PBS_PARTITION_LOAD_STARTUP_DELAY_SECS` | 5 |
//! | `PBS_PREFERENCE_APPLIER_STARTUP_DELAY_SECS` | 5 |
//! | `PBS_PREFERENCE_APPLIER_INTERVAL_SECS` | 1 |
//! | `PBS_TRANSACTION_MANAGER_CAPACITY` | 100000 |

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::constants::*;
use crate::error::{PartitionError, PartitionResult};
use crate::types::PartitionId;

/// Source of string, integer and boolean settings.
pub trait ConfigProvider: Send + Sync {
    fn get_string(&self, key: &str) -> PartitionResult<String>;

    fn get_u64(&self, key: &str) -> PartitionResult<u64> {
        let raw = self.get_string(key)?;
        raw.trim()
            .parse()
            .map_err(|e| PartitionError::Config(format!("Invalid {key} '{raw}': {e}")))
    }

    /// Like [`get_u64`](Self::get_u64), but a missing key yields `default`.
    /// A present but malformed value is still an error.
    fn get_u64_or(&self, key: &str, default: u64) -> PartitionResult<u64> {
        match self.get_string(key) {
            Ok(_) => self.get_u64(key),
            Err(_) => Ok(default),
        }
    }

    fn get_bool(&self, key: &str) -> PartitionResult<bool> {
        let raw = self.get_string(key)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(PartitionError::Config(format!(
                "Invalid {key} '{raw}': expected a boolean"
            ))),
        }
    }
}

/// Reads settings from process environment variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvConfigProvider;

impl ConfigProvider for EnvConfigProvider {
    fn get_string(&self, key: &str) -> PartitionResult<String> {
        std::env::var(key).map_err(|_| PartitionError::Config(format!("{key} is not set")))
    }
}

/// In-memory settings.
#[derive(Debug, Default, Clone)]
pub struct StaticConfigProvider {
    values: HashMap<String, String>,
}

impl StaticConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn get_string(&self, key: &str) -> PartitionResult<String> {
        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| PartitionError::Config(format!("{key} is not set")))
    }
}

/// Parse a comma-separated partition id list.
///
/// Whitespace around each id is ignored, as are empty segments produced by a
/// trailing comma.
pub fn parse_partition_id_list(raw: &str) -> PartitionResult<Vec<PartitionId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<PartitionId>()
                .map_err(|e| PartitionError::Config(format!("Invalid partition id '{s}': {e}")))
        })
        .collect()
}

/// Settings consumed by the partition manager, lease event sink and
/// preference applier.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionConfig {
    /// Fixed for the process lifetime.
    pub partition_ids: Vec<PartitionId>,
    pub journal_bucket_name: Option<String>,
    pub partition_load_startup_delay: Duration,
    pub preference_applier_startup_delay: Duration,
    pub preference_applier_interval: Duration,
    pub transaction_manager_capacity: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            partition_ids: vec![PartitionId::ZERO],
            journal_bucket_name: None,
            partition_load_startup_delay: DEFAULT_PARTITION_LOAD_STARTUP_DELAY,
            preference_applier_startup_delay: DEFAULT_PREFERENCE_APPLIER_STARTUP_DELAY,
            preference_applier_interval: DEFAULT_PREFERENCE_APPLIER_INTERVAL,
            transaction_manager_capacity: DEFAULT_TRANSACTION_MANAGER_CAPACITY,
        }
    }
}

impl PartitionConfig {
    /// Load settings from `provider`, falling back to defaults for the
    /// optional ones. A present but malformed value is an error.
    pub fn from_provider(provider: &dyn ConfigProvider) -> PartitionResult<Self> {
        let defaults = Self::default();

        let partition_ids = parse_partition_id_list(&provider.get_string(PBS_PARTITION_ID_LIST)?)?;

        let secs_or = |key: &str, default: Duration| -> PartitionResult<Duration> {
            provider
                .get_u64_or(key, default.as_secs())
                .map(Duration::from_secs)
        };

        Ok(Self {
            partition_ids,
            journal_bucket_name: provider.get_string(PBS_JOURNAL_SERVICE_BUCKET_NAME).ok(),
            partition_load_startup_delay: secs_or(
                PBS_PARTITION_LOAD_STARTUP_DELAY_SECS,
                defaults.partition_load_startup_delay,
            )?,
            preference_applier_startup_delay: secs_or(
                PBS_PREFERENCE_APPLIER_STARTUP_DELAY_SECS,
                defaults.preference_applier_startup_delay,
            )?,
            preference_applier_interval: secs_or(
                PBS_PREFERENCE_APPLIER_INTERVAL_SECS,
                defaults.preference_applier_interval,
            )?,
            transaction_manager_capacity: provider.get_u64_or(
                PBS_TRANSACTION_MANAGER_CAPACITY,
                defaults.transaction_manager_capacity,
            )?,
        })
    }

    /// Load settings from environment variables.
    pub fn from_env() -> PartitionResult<Self> {
        Self::from_provider(&EnvConfigProvider)
    }

    /// Validate the configuration and return any errors found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.partition_ids.is_empty() {
            errors.push("partition_ids must not be empty".to_string());
        }

        let mut seen = HashSet::new();
        for id in &self.partition_ids {
            if !seen.insert(id) {
                errors.push(format!("partition id {id} is listed more than once"));
            }
        }

        if self.preference_applier_interval.is_zero() {
            errors.push("preference_applier_interval must be greater than zero".to_string());
        }

        if self.transaction_manager_capacity == 0 {
            errors.push("transaction_manager_capacity must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
