//! Connector capability contract.
//!
//! Every data source taking part in a reconciliation implements [`Connector`]
//! over an ordered key column. The contract is intentionally small:
//!
//! - [`Connector::range`]: report `{min, max, total}` for the key column
//! - [`Connector::nibble`]: locate the window boundary `limit` rows from a cursor
//! - [`Connector::checksum`]: order-independent aggregate digest of a window
//! - [`Connector::individual_checksums`]: per-row digests of a window
//! - lifecycle hooks: [`Connector::initialize`], [`Connector::destroy`],
//!   [`Connector::set_session`]
//!
//! Optional capabilities ([`SampleOp`], [`DeleteOp`]) are narrower traits exposed
//! through [`Connector::sampler`] and [`Connector::deleter`], so the checksum
//! nibbler can check them once when it is composed instead of on every call.
//!
//! Transport adapters (HTTP, RPC) are just further implementations of this
//! trait; [`memory::MemoryConnector`] is the in-process one.

pub mod digest;
pub mod memory;
#[cfg(test)]
pub(crate) mod testing;

pub use digest::{digest_hex, record_digest};
pub use memory::{MemoryConnector, Record};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Bound;
use thiserror::Error;

/// Opaque key type of the reconciled column.
///
/// Anything totally ordered, cloneable and serializable qualifies; integer and
/// string keys are the common cases.
pub trait Key: Clone + Ord + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Key for T where
    T: Clone + Ord + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Per-connector state handed back by `initialize` and persisted in the session.
pub type SessionFragment = serde_json::Value;

/// Errors reported by a connector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// The call could not be completed (network, timeout, connection loss).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The connector does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The store answered with something the contract does not allow.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The underlying store failed.
    #[error("store failure: {0}")]
    Store(String),
}

impl ConnectorError {
    pub fn transport(message: impl Into<String>) -> Self {
        ConnectorError::Transport(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        ConnectorError::Store(message.into())
    }
}

/// Result type alias for connector calls.
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Full domain of a key column as reported by a connector.
///
/// `total` is a row count, not `max - min + 1`: keys may be sparse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange<K> {
    pub min: Option<K>,
    pub max: Option<K>,
    pub total: u64,
}

impl<K: Key> KeyRange<K> {
    /// Range of a store with no rows.
    pub fn empty() -> Self {
        Self {
            min: None,
            max: None,
            total: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.is_none() || self.max.is_none()
    }

    /// Smallest range covering both `self` and `other`.
    ///
    /// `total` stays the count of `self`, which is the side driving the walk.
    pub fn union(&self, other: &KeyRange<K>) -> KeyRange<K> {
        let min = match (&self.min, &other.min) {
            (Some(a), Some(b)) => Some(a.clone().min(b.clone())),
            (a, b) => a.clone().or_else(|| b.clone()),
        };
        let max = match (&self.max, &other.max) {
            (Some(a), Some(b)) => Some(a.clone().max(b.clone())),
            (a, b) => a.clone().or_else(|| b.clone()),
        };
        KeyRange {
            min,
            max,
            total: self.total,
        }
    }
}

/// Scope restriction for [`Connector::range`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeOptions<K> {
    pub min: Option<K>,
    pub max: Option<K>,
}

impl<K> Default for RangeOptions<K> {
    fn default() -> Self {
        Self {
            min: None,
            max: None,
        }
    }
}

/// Request for [`Connector::nibble`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NibbleRequest<K> {
    /// Forward cursor (inclusive).
    pub start: Option<K>,
    /// Reverse cursor (inclusive).
    pub end: Option<K>,
    /// Target rows per window.
    pub limit: u64,
    pub reverse: bool,
}

/// Boundary located by [`Connector::nibble`].
///
/// `current` is the key `limit - 1` rows from the cursor, `next` the key `limit`
/// rows from it. Both `None` means fewer than `limit` rows remain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NibbleResponse<K> {
    pub current: Option<K>,
    pub next: Option<K>,
}

/// The exact key interval covered by one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyWindow<K> {
    pub lower: Bound<K>,
    pub upper: Bound<K>,
}

impl<K: Key> KeyWindow<K> {
    /// Closed interval `[start, end]`.
    pub fn closed(start: K, end: K) -> Self {
        Self {
            lower: Bound::Included(start),
            upper: Bound::Included(end),
        }
    }

    /// Whether `key` falls inside the window.
    pub fn contains(&self, key: &K) -> bool {
        let above = match &self.lower {
            Bound::Included(l) => key >= l,
            Bound::Excluded(l) => key > l,
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(u) => key <= u,
            Bound::Excluded(u) => key < u,
            Bound::Unbounded => true,
        };
        above && below
    }

    /// True when no key can satisfy both bounds.
    ///
    /// `BTreeMap::range` panics on such bounds, so stores must check first.
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l), Bound::Excluded(u))
            | (Bound::Excluded(l), Bound::Included(u))
            | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
            _ => false,
        }
    }

    /// Key of the lower bound, if bounded.
    pub fn start_key(&self) -> Option<&K> {
        match &self.lower {
            Bound::Included(k) | Bound::Excluded(k) => Some(k),
            Bound::Unbounded => None,
        }
    }

    /// Key of the upper bound, if bounded.
    pub fn end_key(&self) -> Option<&K> {
        match &self.upper {
            Bound::Included(k) | Bound::Excluded(k) => Some(k),
            Bound::Unbounded => None,
        }
    }

    /// Borrowed bounds, usable with `BTreeMap::range`.
    pub fn as_bounds(&self) -> (Bound<&K>, Bound<&K>) {
        (self.lower.as_ref(), self.upper.as_ref())
    }
}

impl<K: fmt::Debug> fmt::Display for KeyWindow<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.lower {
            Bound::Included(l) => write!(f, "[{:?}", l)?,
            Bound::Excluded(l) => write!(f, "({:?}", l)?,
            Bound::Unbounded => write!(f, "(..")?,
        }
        match &self.upper {
            Bound::Included(u) => write!(f, ", {:?}]", u),
            Bound::Excluded(u) => write!(f, ", {:?})", u),
            Bound::Unbounded => write!(f, ", ..)"),
        }
    }
}

/// Order-independent aggregate digest of a window's rows.
///
/// Each accumulator is the wrapping sum of one big-endian 32-bit slice of every
/// row's MD5 digest. Equal `qty` and accumulators are accepted as proof that
/// the window is identical on both sides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchChecksum {
    pub qty: u64,
    pub hash: [u32; 4],
}

impl BatchChecksum {
    /// Fold one row digest into the aggregate.
    pub fn add_digest(&mut self, digest: &[u8; 16]) {
        for (i, acc) in self.hash.iter_mut().enumerate() {
            let o = i * 4;
            let slice = u32::from_be_bytes([digest[o], digest[o + 1], digest[o + 2], digest[o + 3]]);
            *acc = acc.wrapping_add(slice);
        }
        self.qty += 1;
    }

    /// Aggregate a sequence of row digests.
    pub fn from_digests<'a>(digests: impl IntoIterator<Item = &'a [u8; 16]>) -> Self {
        let mut checksum = Self::default();
        for digest in digests {
            checksum.add_digest(digest);
        }
        checksum
    }

    /// Reasons why `remote` differs from `self` (the master side).
    pub fn mismatches(&self, remote: &BatchChecksum) -> Vec<&'static str> {
        let mut reasons = Vec::new();
        if remote.qty < self.qty {
            reasons.push("too few");
        } else if remote.qty > self.qty {
            reasons.push("too many");
        }
        if remote.hash != self.hash {
            reasons.push("hashes do not match");
        }
        reasons
    }
}

/// Digest of a single row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndividualChecksum<K> {
    pub id: K,
    /// Lowercase hex MD5 of the row.
    pub hash: String,
    /// Identity of the row in a schema keyed by a different column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_id: Option<String>,
}

/// Full field values of one row, for operator diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledRecord<K> {
    pub id: K,
    pub fields: Vec<(String, serde_json::Value)>,
}

/// Options passed to [`Connector::initialize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitOptions {
    pub job_id: String,
}

/// A data source taking part in a reconciliation.
#[async_trait]
pub trait Connector<K: Key>: Send + Sync {
    /// Label used in logs and errors.
    fn name(&self) -> &str;

    /// Report the key range, optionally restricted to `opts.min..=opts.max`.
    async fn range(&self, opts: &RangeOptions<K>) -> ConnectorResult<KeyRange<K>>;

    /// Locate the boundary `limit` rows away from the request's cursor.
    async fn nibble(&self, req: &NibbleRequest<K>) -> ConnectorResult<NibbleResponse<K>>;

    /// Aggregate digest over the window.
    async fn checksum(&self, window: &KeyWindow<K>) -> ConnectorResult<BatchChecksum>;

    /// Per-row digests over the window, in key order.
    async fn individual_checksums(
        &self,
        window: &KeyWindow<K>,
    ) -> ConnectorResult<Vec<IndividualChecksum<K>>>;

    /// Acquire per-job resources. The returned fragment is persisted in the session.
    async fn initialize(&self, _opts: &InitOptions) -> ConnectorResult<SessionFragment> {
        Ok(SessionFragment::Null)
    }

    /// Release per-job resources. Called on every exit path.
    async fn destroy(&self) -> ConnectorResult<()> {
        Ok(())
    }

    /// Inject a previously persisted fragment before resuming.
    fn set_session(&self, _fragment: SessionFragment) {}

    /// Field sampling capability, if supported.
    fn sampler(&self) -> Option<&dyn SampleOp<K>> {
        None
    }

    /// Delete capability, if supported.
    fn deleter(&self) -> Option<&dyn DeleteOp<K>> {
        None
    }
}

/// Capability for fetching full field values of a few rows.
#[async_trait]
pub trait SampleOp<K: Key>: Send + Sync {
    /// Rows for the ids that exist; unknown ids are skipped.
    async fn sample(&self, ids: &[K]) -> ConnectorResult<Vec<SampledRecord<K>>>;
}

/// Capability for deleting rows (auto-repair of extras).
#[async_trait]
pub trait DeleteOp<K: Key>: Send + Sync {
    async fn delete(&self, ids: &[K]) -> ConnectorResult<()>;
}
