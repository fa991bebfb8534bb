//! Configuration type definitions.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksum::{ChecksumOptions, DEFAULT_RETRY_BACKOFF, DEFAULT_TRANSPORT_RETRIES};
use crate::connector::{Key, RangeOptions};
use crate::error::{ReconcileError, Result};
use crate::nibbler::{NibblerOptions, DEFAULT_LIMIT, DEFAULT_MAX_LIMIT};
use crate::sampler::DEFAULT_SAMPLE_SIZE;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// What to compare and how.
    pub job: JobConfig,

    /// Store that drives window boundaries.
    pub master: SourceConfig,

    /// Store checked against the master.
    pub slave: SourceConfig,

    /// Where sessions are kept.
    #[serde(default)]
    pub state: StateConfig,
}

/// Reconciliation job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job id, also the session name.
    pub id: String,

    /// Walk from the highest key down (default: false).
    #[serde(default)]
    pub reverse: bool,

    /// Compare every window row by row (default: false).
    #[serde(default)]
    pub skip_batch: bool,

    /// Stop after this many consecutive clean windows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_on_streak: Option<u64>,

    /// Sample incorrect records and log field differences (default: false).
    #[serde(default)]
    pub sample: bool,

    /// Records sampled per window (default: 4).
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Seed for sampling; random when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_seed: Option<u64>,

    /// Delete records that only exist on the slave (default: false).
    #[serde(default)]
    pub should_delete: bool,

    /// Initial rows per window (default: 1000).
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Largest window the limit may grow to (default: 1000000).
    #[serde(default = "default_max_limit")]
    pub max_limit: u64,

    /// Lowest key to compare.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_key: Option<serde_json::Value>,

    /// Highest key to compare.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_key: Option<serde_json::Value>,

    /// Stop starting windows after this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_budget_secs: Option<u64>,

    /// Retries of a window after a transport failure (default: 3).
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,

    /// Delay before the first retry, doubled per attempt (default: 500).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl JobConfig {
    /// Comparison options for keys of type `K`.
    pub fn checksum_options<K: Key>(&self) -> Result<ChecksumOptions<K>> {
        let nibbler = NibblerOptions {
            limit: self.limit,
            max_limit: self.max_limit,
            reverse: self.reverse,
            range_options: RangeOptions {
                min: parse_key("job.min_key", &self.min_key)?,
                max: parse_key("job.max_key", &self.max_key)?,
            },
            ..NibblerOptions::default()
        };

        Ok(ChecksumOptions {
            nibbler,
            skip_batch: self.skip_batch,
            stop_on_streak: self.stop_on_streak,
            sample: self.sample,
            sample_size: self.sample_size,
            sample_seed: self.sample_seed,
            should_delete: self.should_delete,
            transport_retries: self.transport_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        })
    }

    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget_secs.map(Duration::from_secs)
    }
}

fn parse_key<K: Key>(field: &str, value: &Option<serde_json::Value>) -> Result<Option<K>> {
    value
        .clone()
        .map(|v| {
            serde_json::from_value(v).map_err(|e| {
                ReconcileError::Config(format!("{} does not match the key type: {}", field, e))
            })
        })
        .transpose()
}

/// Type of the key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// 64-bit signed integers.
    #[default]
    Integer,

    /// Strings, compared bytewise.
    String,
}

/// One side of the comparison: a JSON-lines file of records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Path to the JSON-lines file.
    pub path: PathBuf,

    /// Field holding the key (default: "id").
    #[serde(default = "default_key")]
    pub key: String,

    /// Type of the key field (default: integer).
    #[serde(default)]
    pub key_type: KeyType,

    /// Field reported as the record's alternate identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_id: Option<String>,
}

/// Session store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    /// One JSON file per job under `state.dir`.
    #[default]
    File,

    /// Kept in memory for the life of the process.
    Memory,

    /// Not persisted; every run starts fresh.
    None,
}

/// Session persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,

    /// Directory for session files (default: ".nibbler").
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackendKind::default(),
            dir: default_state_dir(),
        }
    }
}

// Default value functions for serde
fn default_sample_size() -> usize {
    DEFAULT_SAMPLE_SIZE
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_max_limit() -> u64 {
    DEFAULT_MAX_LIMIT
}

fn default_transport_retries() -> u32 {
    DEFAULT_TRANSPORT_RETRIES
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF.as_millis() as u64
}

fn default_key() -> String {
    "id".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".nibbler")
}
