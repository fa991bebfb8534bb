//! In-process connector over an ordered in-memory table.
//!
//! `MemoryConnector` is the direct function-call realization of the connector
//! contract. It backs the CLI (rows loaded from JSON-lines files) and the test
//! suite, and computes digests with [`super::digest`].

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use super::digest::{digest_hex, record_digest};
use super::{
    BatchChecksum, Connector, ConnectorError, ConnectorResult, DeleteOp, IndividualChecksum,
    InitOptions, Key, KeyRange, KeyWindow, NibbleRequest, NibbleResponse, RangeOptions, SampleOp,
    SampledRecord, SessionFragment,
};
use crate::error::{ReconcileError, Result};

/// Field values of one row, in canonical order.
pub type Record = Vec<(String, Value)>;

/// Connector over a `BTreeMap` of rows.
pub struct MemoryConnector<K> {
    name: String,
    rows: RwLock<BTreeMap<K, Record>>,
    alt_id_field: Option<String>,
    session: Mutex<SessionFragment>,
    init_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
}

impl<K: Key> MemoryConnector<K> {
    /// Create an empty connector.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(BTreeMap::new()),
            alt_id_field: None,
            session: Mutex::new(SessionFragment::Null),
            init_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
        }
    }

    /// Create a connector holding the given rows.
    pub fn from_records(name: impl Into<String>, rows: impl IntoIterator<Item = (K, Record)>) -> Self {
        let connector = Self::new(name);
        if let Ok(mut guard) = connector.rows.write() {
            guard.extend(rows);
        }
        connector
    }

    /// Report `field` as the alternate identity of each row.
    pub fn with_alt_id_field(mut self, field: impl Into<String>) -> Self {
        self.alt_id_field = Some(field.into());
        self
    }

    /// Load rows from a JSON-lines file, one object per line.
    ///
    /// `key_field` is parsed into `K`; every field (the key included) takes part
    /// in the row digest, in sorted field-name order.
    pub fn from_json_lines<P: AsRef<Path>>(
        name: impl Into<String>,
        path: P,
        key_field: &str,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let mut rows = BTreeMap::new();

        for (line_no, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let object: Map<String, Value> = serde_json::from_str(&line)?;
            let key_value = object.get(key_field).cloned().ok_or_else(|| {
                ReconcileError::Config(format!(
                    "{}:{}: missing key field '{}'",
                    path.display(),
                    line_no + 1,
                    key_field
                ))
            })?;
            let key: K = serde_json::from_value(key_value)?;
            rows.insert(key, object.into_iter().collect());
        }

        debug!("Loaded {} rows from {}", rows.len(), path.display());
        Ok(Self::from_records(name, rows))
    }

    /// Insert or replace a row.
    pub fn insert(&self, key: K, record: Record) -> ConnectorResult<()> {
        self.write()?.insert(key, record);
        Ok(())
    }

    /// Number of rows currently held.
    pub fn len(&self) -> usize {
        self.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a row with this key exists.
    pub fn contains(&self, key: &K) -> bool {
        self.read().map(|rows| rows.contains_key(key)).unwrap_or(false)
    }

    /// Fragment last injected with `set_session`.
    pub fn session(&self) -> SessionFragment {
        self.session
            .lock()
            .map(|s| s.clone())
            .unwrap_or(SessionFragment::Null)
    }

    /// Number of `initialize` calls so far.
    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// Number of `destroy` calls so far.
    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    fn read(&self) -> ConnectorResult<RwLockReadGuard<'_, BTreeMap<K, Record>>> {
        self.rows
            .read()
            .map_err(|_| ConnectorError::store(format!("{}: row lock poisoned", self.name)))
    }

    fn write(&self) -> ConnectorResult<RwLockWriteGuard<'_, BTreeMap<K, Record>>> {
        self.rows
            .write()
            .map_err(|_| ConnectorError::store(format!("{}: row lock poisoned", self.name)))
    }

    fn alt_id(&self, record: &Record) -> Option<String> {
        let field = self.alt_id_field.as_ref()?;
        record
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    }
}

#[async_trait]
impl<K: Key> Connector<K> for MemoryConnector<K> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn range(&self, opts: &RangeOptions<K>) -> ConnectorResult<KeyRange<K>> {
        let rows = self.read()?;
        let mut keys = rows.keys().filter(|k| {
            opts.min.as_ref().map_or(true, |min| *k >= min)
                && opts.max.as_ref().map_or(true, |max| *k <= max)
        });

        let Some(first) = keys.next() else {
            return Ok(KeyRange::empty());
        };
        let mut last = first;
        let mut total = 1u64;
        for key in keys {
            last = key;
            total += 1;
        }

        Ok(KeyRange {
            min: Some(first.clone()),
            max: Some(last.clone()),
            total,
        })
    }

    async fn nibble(&self, req: &NibbleRequest<K>) -> ConnectorResult<NibbleResponse<K>> {
        let rows = self.read()?;
        let offset = req.limit.max(1) as usize - 1;

        let mut keys: Box<dyn Iterator<Item = &K> + '_> = match (req.reverse, &req.start, &req.end) {
            (false, Some(start), _) => Box::new(rows.range::<K, _>(start..).map(|(k, _)| k)),
            (false, None, _) => Box::new(rows.keys()),
            (true, _, Some(end)) => Box::new(rows.range::<K, _>(..=end).rev().map(|(k, _)| k)),
            (true, _, None) => Box::new(rows.keys().rev()),
        };

        let current = keys.nth(offset).cloned();
        let next = keys.next().cloned();
        Ok(NibbleResponse { current, next })
    }

    async fn checksum(&self, window: &KeyWindow<K>) -> ConnectorResult<BatchChecksum> {
        let rows = self.read()?;
        let mut checksum = BatchChecksum::default();
        if window.is_empty() {
            return Ok(checksum);
        }
        for (_, record) in rows.range::<K, _>(window.as_bounds()) {
            checksum.add_digest(&record_digest(record)?);
        }
        Ok(checksum)
    }

    async fn individual_checksums(
        &self,
        window: &KeyWindow<K>,
    ) -> ConnectorResult<Vec<IndividualChecksum<K>>> {
        let rows = self.read()?;
        if window.is_empty() {
            return Ok(Vec::new());
        }
        rows.range::<K, _>(window.as_bounds())
            .map(|(id, record)| {
                Ok(IndividualChecksum {
                    id: id.clone(),
                    hash: digest_hex(&record_digest(record)?),
                    alt_id: self.alt_id(record),
                })
            })
            .collect()
    }

    async fn initialize(&self, opts: &InitOptions) -> ConnectorResult<SessionFragment> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({
            "connector": self.name,
            "job_id": opts.job_id,
            "rows": self.len(),
        }))
    }

    async fn destroy(&self) -> ConnectorResult<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_session(&self, fragment: SessionFragment) {
        if let Ok(mut session) = self.session.lock() {
            *session = fragment;
        }
    }

    fn sampler(&self) -> Option<&dyn SampleOp<K>> {
        Some(self)
    }

    fn deleter(&self) -> Option<&dyn DeleteOp<K>> {
        Some(self)
    }
}

#[async_trait]
impl<K: Key> SampleOp<K> for MemoryConnector<K> {
    async fn sample(&self, ids: &[K]) -> ConnectorResult<Vec<SampledRecord<K>>> {
        let rows = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                rows.get(id).map(|record| SampledRecord {
                    id: id.clone(),
                    fields: record.clone(),
                })
            })
            .collect())
    }
}

#[async_trait]
impl<K: Key> DeleteOp<K> for MemoryConnector<K> {
    async fn delete(&self, ids: &[K]) -> ConnectorResult<()> {
        let mut rows = self.write()?;
        for id in ids {
            rows.remove(id);
        }
        debug!("{}: deleted {} rows", self.name, ids.len());
        Ok(())
    }
}
