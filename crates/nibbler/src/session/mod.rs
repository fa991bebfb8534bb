//! Resumable reconciliation sessions.
//!
//! A [`Session`] is the persisted record of one job: the cursor, the running
//! totals, a small rolling sample of differing ids and the connectors' own
//! session fragments. [`Reconciler`] drives a job from a session and writes
//! it back after every window.

mod budget;
mod reconciler;

pub use budget::TimeBudget;
pub use reconciler::{ReconcileOptions, Reconciler};

use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::checksum::{ComparisonTotals, DiffResult};
use crate::connector::{Key, KeyRange, SessionFragment};
use crate::error::{ReconcileError, Result};
use crate::nibbler::{Nibble, StopReason};
use crate::sampler::{Sampler, DEFAULT_SAMPLE_SIZE};

type HmacSha256 = Hmac<Sha256>;

/// Log lines kept in a session.
pub const MAX_LOG_LINES: usize = 50;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created; connectors not initialized yet.
    Initializing,
    /// Walking, or paused by a time budget or cancellation.
    Running,
    /// Stopped by an unrecovered error.
    Error,
    /// Range exhausted or streak satisfied.
    Complete,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Running => "running",
            SessionStatus::Error => "error",
            SessionStatus::Complete => "complete",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded random sample of differing ids, per category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingSample<K> {
    pub missing: Vec<K>,
    pub incorrect: Vec<K>,
    pub extra: Vec<K>,
}

impl<K> Default for RollingSample<K> {
    fn default() -> Self {
        Self {
            missing: Vec::new(),
            incorrect: Vec::new(),
            extra: Vec::new(),
        }
    }
}

impl<K: Key> RollingSample<K> {
    /// Fold the ids of one window diff in, keeping at most `cap` per category.
    pub fn merge(&mut self, diff: &DiffResult<K>, sampler: &mut Sampler, cap: usize) {
        sampler.merge_bounded(&mut self.missing, &diff.missing, cap);
        sampler.merge_bounded(&mut self.incorrect, &diff.incorrect, cap);
        sampler.merge_bounded(&mut self.extra, &diff.extra, cap);
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.incorrect.is_empty() && self.extra.is_empty()
    }
}

/// Persisted state of one reconciliation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "K: Key")]
pub struct Session<K> {
    /// Job id; one session per job.
    pub id: String,

    /// Identifier of the invocation that last wrote the session.
    pub run_id: String,

    /// SHA256 hash of the configuration the session was created with.
    pub config_hash: String,

    pub status: SessionStatus,

    /// Error message or pause reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,

    pub start_time: DateTime<Utc>,

    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub totals: ComparisonTotals,

    /// Range being walked, recorded when the walk starts.
    #[serde(default)]
    pub range: Option<KeyRange<K>>,

    /// Cursor positioned at the next window to process.
    #[serde(default)]
    pub nibble: Option<Nibble<K>>,

    #[serde(default)]
    pub sample: RollingSample<K>,

    /// Most recent progress lines.
    #[serde(default)]
    pub log: Vec<String>,

    /// Session fragment of the master connector.
    #[serde(default)]
    pub master: SessionFragment,

    /// Session fragment of the remote connector.
    #[serde(default)]
    pub slave: SessionFragment,

    /// HMAC-SHA256 signature for integrity validation.
    /// Computed over the serialized session (excluding this field) using config_hash as key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl<K: Key> Session<K> {
    /// Create a fresh session.
    pub fn new(id: impl Into<String>, config_hash: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            run_id: uuid::Uuid::new_v4().to_string(),
            config_hash: config_hash.into(),
            status: SessionStatus::Initializing,
            status_reason: None,
            start_time: Utc::now(),
            end_time: None,
            totals: ComparisonTotals::default(),
            range: None,
            nibble: None,
            sample: RollingSample::default(),
            log: Vec::new(),
            master: SessionFragment::Null,
            slave: SessionFragment::Null,
            hmac: None,
        }
    }

    /// Compute HMAC-SHA256 signature for session integrity validation.
    ///
    /// Keyed by `config_hash`, so a forged file also needs the configuration.
    pub fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)
            .map_err(|e| ReconcileError::State(format!("Failed to serialize session for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| ReconcileError::State(format!("Failed to create HMAC: {}", e)))?;

        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Store a fresh signature.
    pub fn sign(&mut self) -> Result<()> {
        self.hmac = Some(self.compute_hmac()?);
        Ok(())
    }

    /// Check the stored signature. Unsigned sessions are accepted with a warning.
    pub fn verify(&self) -> Result<()> {
        match &self.hmac {
            Some(stored) => {
                if stored != &self.compute_hmac()? {
                    return Err(ReconcileError::State(format!(
                        "Session {} integrity check failed: HMAC mismatch (possible tampering)",
                        self.id
                    )));
                }
            }
            None => warn!(
                "Session {} has no HMAC signature, integrity cannot be verified",
                self.id
            ),
        }
        Ok(())
    }

    /// Validate that the config hash matches for resume.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(ReconcileError::ConfigChanged);
        }
        Ok(())
    }

    /// Append a line, dropping the oldest beyond [`MAX_LOG_LINES`].
    pub fn push_log(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
        if self.log.len() > MAX_LOG_LINES {
            let excess = self.log.len() - MAX_LOG_LINES;
            self.log.drain(..excess);
        }
    }

    /// Share of the range accounted for, from the persisted cursor.
    pub fn percent_complete(&self) -> f64 {
        match (&self.nibble, self.status) {
            (_, SessionStatus::Complete) => 100.0,
            (Some(nibble), _) => nibble.percent_complete(),
            (None, _) => 0.0,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = SessionStatus::Running;
        self.status_reason = None;
    }

    pub fn mark_paused(&mut self, reason: &StopReason) {
        self.status = SessionStatus::Running;
        self.status_reason = Some(reason.to_string());
        self.end_time = Some(Utc::now());
    }

    pub fn mark_complete(&mut self) {
        self.status = SessionStatus::Complete;
        self.status_reason = None;
        self.end_time = Some(Utc::now());
    }

    pub fn mark_error(&mut self, reason: impl Into<String>) {
        self.status = SessionStatus::Error;
        self.status_reason = Some(reason.into());
        self.end_time = Some(Utc::now());
    }
}

/// Progress notification emitted after every window.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent<K> {
    pub job_id: String,
    pub percent_complete: f64,
    pub correct: u64,
    pub incorrect: u64,
    pub missing: u64,
    pub extra: u64,
    /// First and last key of the window just processed, both inclusive
    /// and in key order whatever the walk direction.
    pub start: Option<K>,
    pub end: Option<K>,
}

/// Result of a [`Reconciler::run`].
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport<K> {
    pub job_id: String,

    /// Identifier of this invocation.
    pub run_id: String,

    /// Session status after the run.
    pub status: SessionStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,

    /// Whether this invocation continued an earlier one.
    pub resumed: bool,

    pub totals: ComparisonTotals,

    pub percent_complete: f64,

    /// Windows resolved by this invocation.
    pub windows: u64,

    pub sample: RollingSample<K>,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    pub duration_seconds: f64,
}

impl<K: Key> ReconcileReport<K> {
    /// True when no difference was found over the walked range.
    pub fn is_consistent(&self) -> bool {
        self.totals.total_differences() == 0
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Default cap of the rolling sample, per category.
pub const ROLLING_SAMPLE_SIZE: usize = DEFAULT_SAMPLE_SIZE;
