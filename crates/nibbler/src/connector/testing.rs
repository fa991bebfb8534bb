//! Connectors used by unit tests across the crate.

use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    BatchChecksum, Connector, ConnectorError, ConnectorResult, DeleteOp, IndividualChecksum,
    InitOptions, KeyRange, KeyWindow, NibbleRequest, NibbleResponse, RangeOptions, SampleOp,
    SessionFragment,
};

/// Dense integer keys `0..rows` computed on the fly, so very large ranges
/// cost nothing to set up. Rows in `altered` hash differently.
pub struct DenseConnector {
    name: String,
    rows: i64,
    altered: Vec<i64>,
    pub nibble_limits: Mutex<Vec<u64>>,
    pub individual_sizes: Mutex<Vec<usize>>,
}

impl DenseConnector {
    pub fn new(name: &str, rows: i64, altered: Vec<i64>) -> Self {
        Self {
            name: name.to_string(),
            rows,
            altered,
            nibble_limits: Mutex::new(Vec::new()),
            individual_sizes: Mutex::new(Vec::new()),
        }
    }

    fn span(&self, window: &KeyWindow<i64>) -> Option<(i64, i64)> {
        let lo = match window.lower {
            Bound::Included(l) => l,
            Bound::Excluded(l) => l + 1,
            Bound::Unbounded => 0,
        }
        .max(0);
        let hi = match window.upper {
            Bound::Included(u) => u,
            Bound::Excluded(u) => u - 1,
            Bound::Unbounded => self.rows - 1,
        }
        .min(self.rows - 1);
        (lo <= hi).then_some((lo, hi))
    }
}

#[async_trait]
impl Connector<i64> for DenseConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn range(&self, _opts: &RangeOptions<i64>) -> ConnectorResult<KeyRange<i64>> {
        if self.rows == 0 {
            return Ok(KeyRange::empty());
        }
        Ok(KeyRange {
            min: Some(0),
            max: Some(self.rows - 1),
            total: self.rows as u64,
        })
    }

    async fn nibble(&self, req: &NibbleRequest<i64>) -> ConnectorResult<NibbleResponse<i64>> {
        self.nibble_limits.lock().unwrap().push(req.limit);
        let limit = req.limit as i64;
        let last = self.rows - 1;
        let (current, next) = if req.reverse {
            let end = req.end.unwrap_or(last);
            (end - limit + 1, end - limit)
        } else {
            let start = req.start.unwrap_or(0);
            (start + limit - 1, start + limit)
        };
        let inside = |k: i64| (0..=last).contains(&k).then_some(k);
        Ok(NibbleResponse {
            current: inside(current),
            next: inside(next),
        })
    }

    async fn checksum(&self, window: &KeyWindow<i64>) -> ConnectorResult<BatchChecksum> {
        let Some((lo, hi)) = self.span(window) else {
            return Ok(BatchChecksum::default());
        };
        let altered = self.altered.iter().filter(|k| (lo..=hi).contains(*k)).count() as u32;
        Ok(BatchChecksum {
            qty: (hi - lo + 1) as u64,
            hash: [0, 0, 0, altered],
        })
    }

    async fn individual_checksums(
        &self,
        window: &KeyWindow<i64>,
    ) -> ConnectorResult<Vec<IndividualChecksum<i64>>> {
        let Some((lo, hi)) = self.span(window) else {
            return Ok(Vec::new());
        };
        let rows: Vec<IndividualChecksum<i64>> = (lo..=hi)
            .map(|id| IndividualChecksum {
                id,
                hash: if self.altered.contains(&id) { "x" } else { "h" }.to_string(),
                alt_id: None,
            })
            .collect();
        self.individual_sizes.lock().unwrap().push(rows.len());
        Ok(rows)
    }
}

/// Wraps a connector and fails scheduled calls with a transport error.
///
/// `schedule` is consumed one entry per batch or individual checksum call:
/// `true` fails the call. Calls past the end of the schedule succeed.
pub struct FlakyConnector<C> {
    inner: Arc<C>,
    schedule: Mutex<VecDeque<bool>>,
    pub failures: AtomicUsize,
    pub fail_init: bool,
    pub fail_destroy: bool,
}

impl<C> FlakyConnector<C> {
    pub fn new(inner: Arc<C>, schedule: impl IntoIterator<Item = bool>) -> Self {
        Self {
            inner,
            schedule: Mutex::new(schedule.into_iter().collect()),
            failures: AtomicUsize::new(0),
            fail_init: false,
            fail_destroy: false,
        }
    }

    /// Fails every scheduled call.
    pub fn always(inner: Arc<C>) -> Self {
        Self::new(inner, std::iter::repeat(true).take(10_000))
    }

    fn trip(&self) -> ConnectorResult<()> {
        let fail = self.schedule.lock().unwrap().pop_front().unwrap_or(false);
        if fail {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(ConnectorError::transport("connection reset by peer"));
        }
        Ok(())
    }
}

#[async_trait]
impl<C: Connector<i64>> Connector<i64> for FlakyConnector<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn range(&self, opts: &RangeOptions<i64>) -> ConnectorResult<KeyRange<i64>> {
        self.inner.range(opts).await
    }

    async fn nibble(&self, req: &NibbleRequest<i64>) -> ConnectorResult<NibbleResponse<i64>> {
        self.inner.nibble(req).await
    }

    async fn checksum(&self, window: &KeyWindow<i64>) -> ConnectorResult<BatchChecksum> {
        self.trip()?;
        self.inner.checksum(window).await
    }

    async fn individual_checksums(
        &self,
        window: &KeyWindow<i64>,
    ) -> ConnectorResult<Vec<IndividualChecksum<i64>>> {
        self.trip()?;
        self.inner.individual_checksums(window).await
    }

    async fn initialize(&self, opts: &InitOptions) -> ConnectorResult<SessionFragment> {
        if self.fail_init {
            return Err(ConnectorError::transport("authentication failed"));
        }
        self.inner.initialize(opts).await
    }

    async fn destroy(&self) -> ConnectorResult<()> {
        self.inner.destroy().await?;
        if self.fail_destroy {
            return Err(ConnectorError::transport("pool already closed"));
        }
        Ok(())
    }

    fn set_session(&self, fragment: SessionFragment) {
        self.inner.set_session(fragment)
    }

    fn sampler(&self) -> Option<&dyn SampleOp<i64>> {
        self.inner.sampler()
    }

    fn deleter(&self) -> Option<&dyn DeleteOp<i64>> {
        self.inner.deleter()
    }
}

/// Wraps a connector and delays every batch checksum, so windows take
/// measurable wall time.
pub struct SlowConnector<C> {
    inner: Arc<C>,
    delay: Duration,
}

impl<C> SlowConnector<C> {
    pub fn new(inner: Arc<C>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl<C: Connector<i64>> Connector<i64> for SlowConnector<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn range(&self, opts: &RangeOptions<i64>) -> ConnectorResult<KeyRange<i64>> {
        self.inner.range(opts).await
    }

    async fn nibble(&self, req: &NibbleRequest<i64>) -> ConnectorResult<NibbleResponse<i64>> {
        self.inner.nibble(req).await
    }

    async fn checksum(&self, window: &KeyWindow<i64>) -> ConnectorResult<BatchChecksum> {
        tokio::time::sleep(self.delay).await;
        self.inner.checksum(window).await
    }

    async fn individual_checksums(
        &self,
        window: &KeyWindow<i64>,
    ) -> ConnectorResult<Vec<IndividualChecksum<i64>>> {
        self.inner.individual_checksums(window).await
    }

    async fn initialize(&self, opts: &InitOptions) -> ConnectorResult<SessionFragment> {
        self.inner.initialize(opts).await
    }

    async fn destroy(&self) -> ConnectorResult<()> {
        self.inner.destroy().await
    }

    fn set_session(&self, fragment: SessionFragment) {
        self.inner.set_session(fragment)
    }

    fn sampler(&self) -> Option<&dyn SampleOp<i64>> {
        self.inner.sampler()
    }

    fn deleter(&self) -> Option<&dyn DeleteOp<i64>> {
        self.inner.deleter()
    }
}
