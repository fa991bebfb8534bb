//! Two-tier checksum comparison of a master and a remote store.
//!
//! Tier 1 compares one [`BatchChecksum`] per window. A window that does not
//! match is either narrowed (the limit shrinks and the window is retried) or,
//! once small enough, compared row by row (tier 2) and reported as a
//! [`DiffResult`].
//!
//! [`ChecksumNibbler`] plugs this into a [`Nibbler`] walking the master.

pub mod diff;

use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::connector::{
    BatchChecksum, Connector, ConnectorError, Key, KeyRange, KeyWindow, NibbleRequest,
};
use crate::error::{ReconcileError, Result};
use crate::nibbler::{
    BiteFailure, Nibble, NibbleRun, Nibbler, NibblerOptions, Recovery, StopReason, WindowHandler,
};
use crate::sampler::{Sampler, DEFAULT_SAMPLE_SIZE};

pub use diff::{ComparisonTotals, DiffResult, FieldChange, FieldDiff, WindowCounts};

/// Most rows either side fetches in one row-by-row comparison. Also the floor
/// the limit shrinks to.
pub const INDIVIDUAL_THRESHOLD: u64 = 20_000;

/// Default transport retries per window.
pub const DEFAULT_TRANSPORT_RETRIES: u32 = 3;

/// Default delay before the first transport retry.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Options for a [`ChecksumNibbler`].
#[derive(Debug, Clone)]
pub struct ChecksumOptions<K> {
    pub nibbler: NibblerOptions<K>,
    /// Compare every window row by row.
    pub skip_batch: bool,
    /// Stop after this many consecutive clean windows.
    pub stop_on_streak: Option<u64>,
    /// Sample incorrect records and report field-level differences.
    pub sample: bool,
    pub sample_size: usize,
    pub sample_seed: Option<u64>,
    /// Delete extra records from the remote.
    pub should_delete: bool,
    pub transport_retries: u32,
    pub retry_backoff: Duration,
}

impl<K> Default for ChecksumOptions<K> {
    fn default() -> Self {
        Self {
            nibbler: NibblerOptions::default(),
            skip_batch: false,
            stop_on_streak: None,
            sample: false,
            sample_size: DEFAULT_SAMPLE_SIZE,
            sample_seed: None,
            should_delete: false,
            transport_retries: DEFAULT_TRANSPORT_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// Tier that resolved a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Batch,
    Individual,
}

/// Payload of a tier 1 failure.
#[derive(Debug, Clone)]
pub struct BatchMismatch {
    pub master: Option<BatchChecksum>,
    pub remote: Option<BatchChecksum>,
    pub reasons: Vec<&'static str>,
}

impl BatchMismatch {
    /// Tier 1 was not attempted.
    pub fn skipped() -> Self {
        Self {
            master: None,
            remote: None,
            reasons: vec!["batch comparison skipped"],
        }
    }

    /// Rows in the window on the larger side, when known.
    pub fn rows(&self) -> Option<u64> {
        match (&self.master, &self.remote) {
            (Some(m), Some(r)) => Some(m.qty.max(r.qty)),
            _ => None,
        }
    }
}

/// Summary of one resolved window, handed to [`ReconcileObserver::on_window`].
#[derive(Debug, Clone)]
pub struct WindowReport<K> {
    /// Cursor after moving past the window.
    pub nibble: Nibble<K>,
    pub window: KeyWindow<K>,
    /// First key of the window in key order, inclusive.
    pub first: Option<K>,
    /// Last key of the window in key order, inclusive.
    pub last: Option<K>,
    pub tier: Tier,
    pub counts: WindowCounts,
    pub totals: ComparisonTotals,
}

/// Receives results as the comparison walks.
///
/// Every hook may fail; an error aborts the walk.
#[async_trait]
pub trait ReconcileObserver<K: Key>: Send {
    /// Cursor is positioned and the walk is about to begin.
    async fn on_start(&mut self, _nibble: &Nibble<K>) -> Result<()> {
        Ok(())
    }

    /// A window was compared row by row. `samples` holds field-level
    /// differences of sampled incorrect records, when sampling is on.
    async fn on_diff(
        &mut self,
        _window: &KeyWindow<K>,
        _diff: &DiffResult<K>,
        _samples: &[FieldDiff<K>],
    ) -> Result<()> {
        Ok(())
    }

    /// A window was resolved and folded into the totals.
    async fn on_window(&mut self, _report: &WindowReport<K>) -> Result<()> {
        Ok(())
    }

    /// Checked before every window after the streak condition.
    fn stop_reason(&mut self, _nibble: &Nibble<K>) -> Option<StopReason> {
        None
    }
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl<K: Key> ReconcileObserver<K> for NullObserver {}

struct Pending<K> {
    window: KeyWindow<K>,
    first: Option<K>,
    last: Option<K>,
    tier: Tier,
    counts: WindowCounts,
}

impl<K: Key> Pending<K> {
    /// The cursor holds the window's inclusive edges while it is in flight.
    fn new(nibble: &Nibble<K>, window: &KeyWindow<K>, tier: Tier, counts: WindowCounts) -> Self {
        Self {
            window: window.clone(),
            first: nibble.start.clone(),
            last: nibble.end.clone(),
            tier,
            counts,
        }
    }
}

/// Compares two connectors window by window.
pub struct ChecksumNibbler<K: Key, O> {
    master: Arc<dyn Connector<K>>,
    remote: Arc<dyn Connector<K>>,
    opts: ChecksumOptions<K>,
    totals: ComparisonTotals,
    observer: O,
    sampler: Sampler,
    transport_attempts: u32,
    pending: Option<Pending<K>>,
}

impl<K: Key> ChecksumNibbler<K, NullObserver> {
    /// Fails when an option needs a capability a connector lacks.
    pub fn new(
        master: Arc<dyn Connector<K>>,
        remote: Arc<dyn Connector<K>>,
        opts: ChecksumOptions<K>,
    ) -> Result<Self> {
        if opts.sample {
            for side in [&master, &remote] {
                if side.sampler().is_none() {
                    return Err(ReconcileError::Config(format!(
                        "sampling requested but {} cannot sample records",
                        side.name()
                    )));
                }
            }
        }
        if opts.should_delete && remote.deleter().is_none() {
            return Err(ReconcileError::Config(format!(
                "deletion requested but {} cannot delete records",
                remote.name()
            )));
        }

        let sampler = Sampler::new(opts.sample_seed);
        Ok(Self {
            master,
            remote,
            opts,
            totals: ComparisonTotals::default(),
            observer: NullObserver,
            sampler,
            transport_attempts: 0,
            pending: None,
        })
    }
}

impl<K: Key, O: ReconcileObserver<K>> ChecksumNibbler<K, O> {
    /// Replace the observer.
    pub fn with_observer<P: ReconcileObserver<K>>(self, observer: P) -> ChecksumNibbler<K, P> {
        ChecksumNibbler {
            master: self.master,
            remote: self.remote,
            opts: self.opts,
            totals: self.totals,
            observer,
            sampler: self.sampler,
            transport_attempts: self.transport_attempts,
            pending: None,
        }
    }

    /// Continue from a persisted cursor instead of resolving the range.
    pub fn resume_from(mut self, nibble: Nibble<K>) -> Self {
        self.opts.nibbler.resume = Some(nibble);
        self
    }

    /// Walk `range` instead of resolving it from the connectors.
    pub fn with_range(mut self, range: KeyRange<K>) -> Self {
        self.opts.nibbler.range = Some(range);
        self
    }

    /// Start from previously accumulated totals.
    pub fn with_totals(mut self, totals: ComparisonTotals) -> Self {
        self.totals = totals;
        self
    }

    pub fn totals(&self) -> &ComparisonTotals {
        &self.totals
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn into_observer(self) -> O {
        self.observer
    }

    /// Walk the master's range until it is exhausted or a stop condition fires.
    pub async fn run(&mut self) -> Result<NibbleRun<K>> {
        let mut nibbler_opts = self.opts.nibbler.clone();
        if nibbler_opts.resume.is_none() && nibbler_opts.range.is_none() {
            nibbler_opts.range = Some(self.union_range(&nibbler_opts).await?);
        }

        let nibbler = Nibbler::new(self.master.clone(), nibbler_opts);
        nibbler.run(self).await
    }

    /// Union of both ranges, so keys only the remote holds are visited.
    async fn union_range(&self, opts: &NibblerOptions<K>) -> Result<KeyRange<K>> {
        let (master, remote) = tokio::join!(
            self.master.range(&opts.range_options),
            self.remote.range(&opts.range_options)
        );
        let master = master.map_err(|e| ReconcileError::range(self.master.name(), e))?;
        let remote = remote.map_err(|e| ReconcileError::range(self.remote.name(), e))?;

        info!(
            "Master {}: {} rows ({:?}..{:?}), remote {}: {} rows ({:?}..{:?})",
            self.master.name(),
            master.total,
            master.min,
            master.max,
            self.remote.name(),
            remote.total,
            remote.min,
            remote.max
        );
        Ok(master.union(&remote))
    }

    /// Tier 2: fetch per-row checksums from both sides and diff them.
    ///
    /// `rows` is the larger side's row count from tier 1. When it is unknown
    /// or above [`INDIVIDUAL_THRESHOLD`], the window is split first.
    async fn compare_individual(
        &mut self,
        nibble: &Nibble<K>,
        window: &KeyWindow<K>,
        rows: Option<u64>,
    ) -> Result<u64> {
        let diff = match rows {
            Some(rows) if rows <= INDIVIDUAL_THRESHOLD => self.diff_window(window).await?,
            _ => {
                let mut diff = DiffResult::empty();
                let mut parts = 0;
                let mut rest = Some(window.clone());
                while let Some(current) = rest.take() {
                    let (part, remainder) = self.split_off(&current, nibble.reverse).await?;
                    diff.absorb(self.diff_window(&part).await?);
                    parts += 1;
                    rest = remainder;
                }
                if parts > 1 {
                    debug!("Window {} compared row by row in {} parts", window, parts);
                }
                diff
            }
        };
        let counts = diff.counts();

        let samples = if self.opts.sample && !diff.incorrect.is_empty() {
            self.sample_incorrect(&diff.incorrect).await?
        } else {
            Vec::new()
        };
        for sample in &samples {
            info!("Field differences in {}:\n{}", window, sample.render());
        }

        if self.opts.should_delete && !diff.extra.is_empty() {
            if let Some(deleter) = self.remote.deleter() {
                deleter
                    .delete(&diff.extra)
                    .await
                    .map_err(|e| ReconcileError::bite(self.remote.name(), e))?;
                info!(
                    "{}: deleted {} extra records",
                    self.remote.name(),
                    diff.extra.len()
                );
            }
        }

        if diff.has_differences() {
            info!(
                "Window {}: {} missing, {} incorrect, {} extra of {} rows",
                window,
                diff.missing.len(),
                diff.incorrect.len(),
                diff.extra.len(),
                diff.qty
            );
        }

        self.observer.on_diff(window, &diff, &samples).await?;
        self.pending = Some(Pending::new(nibble, window, Tier::Individual, counts));
        Ok(counts.qty)
    }

    async fn diff_window(&mut self, window: &KeyWindow<K>) -> Result<DiffResult<K>> {
        let (master, remote) = tokio::join!(
            self.master.individual_checksums(window),
            self.remote.individual_checksums(window)
        );
        let master = master.map_err(|e| ReconcileError::bite(self.master.name(), e))?;
        let remote = remote.map_err(|e| ReconcileError::bite(self.remote.name(), e))?;
        Ok(DiffResult::compare(&master, &remote))
    }

    /// Cut the leading part of `window` (trailing part when reversed) that
    /// holds at most [`INDIVIDUAL_THRESHOLD`] rows on both sides. Returns the
    /// part and whatever remains of the window.
    async fn split_off(
        &mut self,
        window: &KeyWindow<K>,
        reverse: bool,
    ) -> Result<(KeyWindow<K>, Option<KeyWindow<K>>)> {
        let cursor = if reverse {
            window.end_key()
        } else {
            window.start_key()
        };
        let req = NibbleRequest {
            start: if reverse { None } else { cursor.cloned() },
            end: if reverse { cursor.cloned() } else { None },
            limit: INDIVIDUAL_THRESHOLD,
            reverse,
        };
        let (master, remote) = tokio::join!(self.master.nibble(&req), self.remote.nibble(&req));
        let master = master.map_err(|e| ReconcileError::bite(self.master.name(), e))?;
        let remote = remote.map_err(|e| ReconcileError::bite(self.remote.name(), e))?;

        // The nearer boundary keeps both sides under the threshold.
        let boundaries = [master.next, remote.next]
            .into_iter()
            .flatten()
            .filter(|k| window.contains(k) && Some(k) != cursor);
        let cut = if reverse {
            boundaries.max()
        } else {
            boundaries.min()
        };

        let Some(cut) = cut else {
            return Ok((window.clone(), None));
        };
        Ok(if reverse {
            (
                KeyWindow {
                    lower: Bound::Excluded(cut.clone()),
                    upper: window.upper.clone(),
                },
                Some(KeyWindow {
                    lower: window.lower.clone(),
                    upper: Bound::Included(cut),
                }),
            )
        } else {
            (
                KeyWindow {
                    lower: window.lower.clone(),
                    upper: Bound::Excluded(cut.clone()),
                },
                Some(KeyWindow {
                    lower: Bound::Included(cut),
                    upper: window.upper.clone(),
                }),
            )
        })
    }

    async fn sample_incorrect(&mut self, ids: &[K]) -> Result<Vec<FieldDiff<K>>> {
        let picked = self.sampler.pick(ids, self.opts.sample_size);
        let (Some(ours), Some(theirs)) = (self.master.sampler(), self.remote.sampler()) else {
            return Err(ReconcileError::Config(
                "sampling requested but a connector cannot sample records".to_string(),
            ));
        };

        let (master, remote) = tokio::join!(ours.sample(&picked), theirs.sample(&picked));
        let master = master.map_err(|e| ReconcileError::bite(self.master.name(), e))?;
        let remote = remote.map_err(|e| ReconcileError::bite(self.remote.name(), e))?;

        Ok(picked
            .into_iter()
            .map(|id| {
                let m = master.iter().find(|r| r.id == id);
                let r = remote.iter().find(|r| r.id == id);
                FieldDiff::between(id, m, r)
            })
            .collect())
    }

    /// Retry the window after a backoff, or give up once retries are spent.
    async fn retry_transport(&mut self, connector: String, err: ConnectorError) -> Recovery {
        if self.transport_attempts >= self.opts.transport_retries {
            error!(
                "{}: giving up after {} retries: {}",
                connector, self.transport_attempts, err
            );
            return Recovery::Abort(ReconcileError::bite(connector, err));
        }

        let delay = backoff_delay(self.opts.retry_backoff, self.transport_attempts);
        self.transport_attempts += 1;
        warn!(
            "{}: {} (retry {}/{} in {:?})",
            connector, err, self.transport_attempts, self.opts.transport_retries, delay
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Recovery::Retry
    }
}

#[async_trait]
impl<K: Key, O: ReconcileObserver<K>> WindowHandler<K> for ChecksumNibbler<K, O> {
    type Mismatch = BatchMismatch;

    async fn on_init(&mut self, nibble: &Nibble<K>) -> Result<()> {
        self.observer.on_start(nibble).await
    }

    async fn bite(
        &mut self,
        nibble: &Nibble<K>,
        window: &KeyWindow<K>,
    ) -> std::result::Result<u64, BiteFailure<BatchMismatch>> {
        if self.opts.skip_batch {
            return Err(BiteFailure::Mismatch(BatchMismatch::skipped()));
        }

        let (master, remote) = tokio::join!(
            self.master.checksum(window),
            self.remote.checksum(window)
        );
        let master = master.map_err(|e| BiteFailure::transport(self.master.name(), e))?;
        let remote = remote.map_err(|e| BiteFailure::transport(self.remote.name(), e))?;

        let reasons = master.mismatches(&remote);
        if !reasons.is_empty() {
            debug!(
                "Window {} batch mismatch ({}): master {} rows, remote {} rows",
                window,
                reasons.join(", "),
                master.qty,
                remote.qty
            );
            return Err(BiteFailure::Mismatch(BatchMismatch {
                master: Some(master),
                remote: Some(remote),
                reasons,
            }));
        }

        self.transport_attempts = 0;
        self.pending = Some(Pending::new(
            nibble,
            window,
            Tier::Batch,
            WindowCounts::matched(master.qty),
        ));
        Ok(master.qty)
    }

    async fn recover(
        &mut self,
        failure: BiteFailure<BatchMismatch>,
        nibble: &mut Nibble<K>,
    ) -> Recovery {
        let mismatch = match failure {
            BiteFailure::Transport { connector, error } => {
                return self.retry_transport(connector, error).await
            }
            BiteFailure::Mismatch(mismatch) => mismatch,
        };

        let known = mismatch.rows();
        let rows = known.unwrap_or(nibble.limit);
        let individual = rows <= INDIVIDUAL_THRESHOLD
            || self.opts.skip_batch
            || nibble.limit <= INDIVIDUAL_THRESHOLD;

        if !individual {
            let shrunk = shrink_limit(nibble.limit);
            info!(
                "Batch mismatch over {} rows ({}): limit {} -> {}",
                rows,
                mismatch.reasons.join(", "),
                nibble.limit,
                shrunk
            );
            nibble.limit = shrunk;
            return Recovery::Retry;
        }

        let Some(window) = nibble.window() else {
            return Recovery::Abort(ReconcileError::Terminal(
                "mismatch reported past the end of the range".to_string(),
            ));
        };
        match self.compare_individual(nibble, &window, known).await {
            Ok(rows) => {
                self.transport_attempts = 0;
                Recovery::Advanced { rows }
            }
            Err(ReconcileError::Bite { connector, source }) => {
                self.retry_transport(connector, source).await
            }
            Err(e) => Recovery::Abort(e),
        }
    }

    async fn on_advance(&mut self, nibble: &Nibble<K>) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        self.totals.update(&pending.counts);

        let report = WindowReport {
            nibble: nibble.clone(),
            window: pending.window,
            first: pending.first,
            last: pending.last,
            tier: pending.tier,
            counts: pending.counts,
            totals: self.totals.clone(),
        };
        self.observer.on_window(&report).await
    }

    fn stop_reason(&mut self, nibble: &Nibble<K>) -> Option<StopReason> {
        if let Some(streak) = self.opts.stop_on_streak {
            if self.totals.streak >= streak {
                return Some(StopReason::Streak);
            }
        }
        self.observer.stop_reason(nibble)
    }

    async fn on_end(&mut self, nibble: &Nibble<K>, error: Option<&ReconcileError>) -> Result<()> {
        match error {
            Some(e) => warn!("Comparison ended at {:.2}% with error: {}", nibble.percent_complete(), e),
            None => info!(
                "Comparison at {:.2}%: {} correct, {} incorrect, {} missing, {} extra",
                nibble.percent_complete(),
                self.totals.total_correct,
                self.totals.total_incorrect,
                self.totals.total_missing,
                self.totals.total_extra
            ),
        }
        Ok(())
    }
}

/// Next limit after a batch mismatch too large to compare row by row.
///
/// Halves, but drops straight to [`INDIVIDUAL_THRESHOLD`] once halving would
/// leave less than twice the threshold.
pub fn shrink_limit(limit: u64) -> u64 {
    let halved = limit / 2;
    if halved < INDIVIDUAL_THRESHOLD * 2 {
        INDIVIDUAL_THRESHOLD.min(limit)
    } else {
        halved
    }
}

/// Delay before transport retry number `attempt` (zero-based).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::testing::{DenseConnector, FlakyConnector};
    use crate::connector::{MemoryConnector, Record};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn record(value: i64) -> Record {
        vec![
            ("name".to_string(), json!(format!("row-{}", value))),
            ("qty".to_string(), json!(value)),
        ]
    }

    fn store(name: &str, rows: impl IntoIterator<Item = (i64, i64)>) -> Arc<MemoryConnector<i64>> {
        Arc::new(MemoryConnector::from_records(
            name,
            rows.into_iter().map(|(k, v)| (k, record(v))),
        ))
    }

    /// M = 1..=10; R lacks 5, alters 7 and adds 11.
    fn exact_diff_pair() -> (Arc<MemoryConnector<i64>>, Arc<MemoryConnector<i64>>) {
        let master = store("master", (1..=10).map(|k| (k, k)));
        let remote = store(
            "remote",
            (1..=4)
                .chain(6..=11)
                .map(|k| (k, if k == 7 { 700 } else { k })),
        );
        (master, remote)
    }

    fn opts(limit: u64) -> ChecksumOptions<i64> {
        ChecksumOptions {
            nibbler: NibblerOptions {
                limit,
                max_limit: limit,
                ..Default::default()
            },
            retry_backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        started: bool,
        diffs: Vec<DiffResult<i64>>,
        samples: Vec<FieldDiff<i64>>,
        windows: Vec<(String, Tier, WindowCounts)>,
        stop_after: Option<usize>,
    }

    impl Recorder {
        fn ids(&self) -> (BTreeSet<i64>, BTreeSet<i64>, BTreeSet<i64>) {
            let mut missing = BTreeSet::new();
            let mut incorrect = BTreeSet::new();
            let mut extra = BTreeSet::new();
            for diff in &self.diffs {
                missing.extend(diff.missing.iter().copied());
                incorrect.extend(diff.incorrect.iter().copied());
                extra.extend(diff.extra.iter().copied());
            }
            (missing, incorrect, extra)
        }
    }

    #[async_trait]
    impl ReconcileObserver<i64> for Recorder {
        async fn on_start(&mut self, _nibble: &Nibble<i64>) -> Result<()> {
            self.started = true;
            Ok(())
        }

        async fn on_diff(
            &mut self,
            _window: &KeyWindow<i64>,
            diff: &DiffResult<i64>,
            samples: &[FieldDiff<i64>],
        ) -> Result<()> {
            self.diffs.push(diff.clone());
            self.samples.extend(samples.iter().cloned());
            Ok(())
        }

        async fn on_window(&mut self, report: &WindowReport<i64>) -> Result<()> {
            self.windows
                .push((report.window.to_string(), report.tier, report.counts));
            Ok(())
        }

        fn stop_reason(&mut self, _nibble: &Nibble<i64>) -> Option<StopReason> {
            match self.stop_after {
                Some(n) if self.windows.len() >= n => Some(StopReason::Custom("paused".into())),
                _ => None,
            }
        }
    }

    async fn compare(
        master: Arc<dyn Connector<i64>>,
        remote: Arc<dyn Connector<i64>>,
        opts: ChecksumOptions<i64>,
    ) -> (Result<NibbleRun<i64>>, ComparisonTotals, Recorder) {
        let mut checker = ChecksumNibbler::new(master, remote, opts)
            .unwrap()
            .with_observer(Recorder::default());
        let run = checker.run().await;
        let totals = checker.totals().clone();
        (run, totals, checker.into_observer())
    }

    // =========================================================================
    // Diff correctness
    // =========================================================================

    #[tokio::test]
    async fn test_exact_diff_law() {
        let (master, remote) = exact_diff_pair();
        let (run, totals, recorder) = compare(master, remote, opts(1000)).await;
        run.unwrap();

        assert!(recorder.started);
        assert_eq!(recorder.diffs.len(), 1);
        let diff = &recorder.diffs[0];
        assert_eq!(diff.qty, 10);
        assert_eq!(diff.missing, vec![5]);
        assert_eq!(diff.incorrect, vec![7]);
        assert_eq!(diff.extra, vec![11]);

        assert_eq!(totals.total_correct, 8);
        assert_eq!(totals.total_incorrect, 1);
        assert_eq!(totals.total_missing, 1);
        assert_eq!(totals.total_extra, 1);
        assert_eq!(totals.progress, 10);
        assert_eq!(totals.streak, 0);
    }

    #[tokio::test]
    async fn test_batch_and_individual_agree_on_equal_data() {
        let master = store("master", (1..=50).map(|k| (k, k)));
        let remote = store("remote", (1..=50).map(|k| (k, k)));

        let (run, batch_totals, batch) =
            compare(master.clone(), remote.clone(), opts(10)).await;
        run.unwrap();
        assert!(batch.diffs.is_empty());
        assert!(batch.windows.iter().all(|(_, tier, _)| *tier == Tier::Batch));

        let mut skip = opts(10);
        skip.skip_batch = true;
        let (run, individual_totals, individual) = compare(master, remote, skip).await;
        run.unwrap();
        assert!(individual
            .windows
            .iter()
            .all(|(_, tier, _)| *tier == Tier::Individual));
        assert!(individual.diffs.iter().all(|d| !d.has_differences()));

        assert_eq!(batch_totals, individual_totals);
        assert_eq!(batch_totals.total_correct, 50);
        assert_eq!(batch_totals.streak, 5);
    }

    #[tokio::test]
    async fn test_repeated_runs_are_idempotent() {
        let (master, remote) = exact_diff_pair();
        let mut small = opts(3);
        small.sample = true;
        small.sample_seed = Some(9);

        let (first_run, first_totals, first) =
            compare(master.clone(), remote.clone(), small.clone()).await;
        let (second_run, second_totals, second) = compare(master, remote, small).await;

        assert_eq!(first_run.unwrap().windows, second_run.unwrap().windows);
        assert_eq!(first_totals, second_totals);
        assert_eq!(first.diffs, second.diffs);
        assert_eq!(first.samples, second.samples);
    }

    #[tokio::test]
    async fn test_reverse_walk_reports_same_differences() {
        let (master, remote) = exact_diff_pair();
        let (run, forward_totals, forward) =
            compare(master.clone(), remote.clone(), opts(3)).await;
        run.unwrap();

        let mut reverse = opts(3);
        reverse.nibbler.reverse = true;
        let (run, reverse_totals, backward) = compare(master, remote, reverse).await;
        run.unwrap();

        assert_eq!(forward_totals.total_correct, reverse_totals.total_correct);
        assert_eq!(forward_totals.total_incorrect, reverse_totals.total_incorrect);
        assert_eq!(forward_totals.total_missing, reverse_totals.total_missing);
        assert_eq!(forward_totals.total_extra, reverse_totals.total_extra);
        assert_eq!(forward.ids(), backward.ids());
        assert_eq!(
            backward.ids(),
            (BTreeSet::from([5]), BTreeSet::from([7]), BTreeSet::from([11]))
        );
    }

    // =========================================================================
    // Window sizing
    // =========================================================================

    #[test]
    fn test_shrink_limit_sequence() {
        let mut limit = 400_000;
        let mut seen = vec![limit];
        while limit > INDIVIDUAL_THRESHOLD {
            limit = shrink_limit(limit);
            seen.push(limit);
        }
        assert_eq!(seen, vec![400_000, 200_000, 100_000, 50_000, 20_000]);
        assert_eq!(shrink_limit(30_000), 20_000);
    }

    #[tokio::test]
    async fn test_large_mismatch_shrinks_before_individual_compare() {
        let master = Arc::new(DenseConnector::new("master", 1_000_000, vec![]));
        let remote = Arc::new(DenseConnector::new("remote", 1_000_000, vec![7]));
        let mut options = opts(400_000);
        options.nibbler.max_limit = 400_000;

        let (run, totals, recorder) = compare(master.clone(), remote.clone(), options).await;
        run.unwrap();

        let limits = master.nibble_limits.lock().unwrap().clone();
        assert_eq!(limits[..5], [400_000, 200_000, 100_000, 50_000, 20_000]);
        let sizes = master.individual_sizes.lock().unwrap().clone();
        assert_eq!(sizes, vec![20_000]);
        assert!(sizes.iter().all(|s| *s as u64 <= INDIVIDUAL_THRESHOLD));

        assert_eq!(recorder.diffs.len(), 1);
        assert_eq!(recorder.diffs[0].incorrect, vec![7]);
        assert_eq!(totals.total_incorrect, 1);
        assert_eq!(totals.total_correct, 999_999);
        assert_eq!(totals.progress, 1_000_000);
    }

    #[tokio::test]
    async fn test_limit_grows_again_after_recovery() {
        let master = Arc::new(DenseConnector::new("master", 200_000, vec![]));
        let remote = Arc::new(DenseConnector::new("remote", 200_000, vec![3]));
        let mut options = opts(1_000);
        options.nibbler.max_limit = 100_000;

        let (run, _, _) = compare(master.clone(), remote, options).await;
        run.unwrap();

        let limits = master.nibble_limits.lock().unwrap().clone();
        // window 1 mismatches; growth resumes only after two clean windows
        assert_eq!(limits[0], 1_000);
        assert_eq!(limits[1], 1_000);
        assert_eq!(limits[2], 1_000);
        assert!(limits[3] > 1_000);
        assert!(limits.iter().all(|l| *l <= 100_000));
    }

    #[tokio::test]
    async fn test_crowded_remote_window_is_compared_in_parts() {
        // Two master keys around a remote that holds every key in between
        for reverse in [false, true] {
            let master = store("master", [(0, 0), (100_000, 100_000)]);
            let remote = Arc::new(DenseConnector::new("remote", 100_001, vec![]));
            let mut options = opts(1_000);
            options.nibbler.reverse = reverse;

            let (run, totals, recorder) = compare(master, remote.clone(), options).await;
            run.unwrap();

            let sizes = remote.individual_sizes.lock().unwrap().clone();
            assert!(sizes.len() > 1);
            assert!(sizes.iter().all(|s| *s as u64 <= INDIVIDUAL_THRESHOLD));
            assert_eq!(sizes.iter().sum::<usize>(), 100_001);

            assert_eq!(recorder.diffs.len(), 1);
            let diff = &recorder.diffs[0];
            assert_eq!(diff.qty, 2);
            assert_eq!(diff.incorrect, vec![0, 100_000]);
            assert_eq!(diff.extra.len(), 99_999);
            assert_eq!(diff.extra.first(), Some(&1));
            assert_eq!(diff.extra.last(), Some(&99_999));
            assert!(diff.extra.windows(2).all(|pair| pair[0] < pair[1]));

            assert_eq!(totals.total_extra, 99_999);
            assert_eq!(totals.progress, 2);
        }
    }

    // =========================================================================
    // Stop conditions and resume
    // =========================================================================

    #[tokio::test]
    async fn test_streak_stops_walk() {
        let master = store("master", (1..=100).map(|k| (k, k)));
        let remote = store("remote", (1..=100).map(|k| (k, k)));
        let mut options = opts(10);
        options.stop_on_streak = Some(3);

        let (run, totals, recorder) = compare(master, remote, options).await;
        let run = run.unwrap();

        assert_eq!(run.stop_reason, Some(StopReason::Streak));
        assert_eq!(recorder.windows.len(), 3);
        assert_eq!(totals.streak, 3);
        assert_eq!(totals.progress, 30);
        assert!(!run.nibble.is_exhausted());
    }

    #[tokio::test]
    async fn test_resume_matches_uninterrupted_run() {
        let master = store("master", (1..=40).map(|k| (k, k)));
        let remote = store(
            "remote",
            (1..=40)
                .filter(|k| *k != 33)
                .map(|k| (k, if k == 25 { 0 } else { k })),
        );

        let (run, full_totals, full) = compare(master.clone(), remote.clone(), opts(5)).await;
        run.unwrap();

        let mut first = ChecksumNibbler::new(master.clone(), remote.clone(), opts(5))
            .unwrap()
            .with_observer(Recorder {
                stop_after: Some(3),
                ..Default::default()
            });
        let paused = first.run().await.unwrap();
        assert_eq!(paused.stop_reason, Some(StopReason::Custom("paused".into())));

        // persisted cursor survives a JSON round trip
        let saved = serde_json::to_string(&paused.nibble).unwrap();
        let nibble: Nibble<i64> = serde_json::from_str(&saved).unwrap();

        let mut second = ChecksumNibbler::new(master, remote, opts(5))
            .unwrap()
            .with_observer(Recorder::default())
            .resume_from(nibble)
            .with_totals(first.totals().clone());
        second.run().await.unwrap();

        assert_eq!(second.totals(), &full_totals);
        let mut windows = first.observer().windows.clone();
        windows.extend(second.observer().windows.clone());
        assert_eq!(windows, full.windows);
    }

    // =========================================================================
    // Transport failures
    // =========================================================================

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_transport_failure_retries_same_window() {
        let (master, remote) = exact_diff_pair();
        let flaky = Arc::new(FlakyConnector::new(remote, [true, true]));

        let (run, totals, recorder) = compare(master, flaky.clone(), opts(1000)).await;
        run.unwrap();

        assert_eq!(flaky.failures.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(recorder.diffs.len(), 1);
        assert_eq!(totals.total_missing, 1);
        assert_eq!(totals.total_extra, 1);
    }

    #[tokio::test]
    async fn test_retry_counter_resets_after_success() {
        let master = store("master", (1..=30).map(|k| (k, k)));
        let remote = store("remote", (1..=30).map(|k| (k, k)));
        // two failures on the first window, two on the second
        let flaky = Arc::new(FlakyConnector::new(
            remote,
            [true, true, false, true, true, false],
        ));
        let mut options = opts(10);
        options.transport_retries = 2;

        let (run, totals, _) = compare(master, flaky, options).await;
        run.unwrap();
        assert_eq!(totals.total_correct, 30);
    }

    #[tokio::test]
    async fn test_transport_failure_escalates_after_retries() {
        let (master, remote) = exact_diff_pair();
        let flaky = Arc::new(FlakyConnector::always(remote));

        let (run, totals, recorder) = compare(master, flaky.clone(), opts(1000)).await;
        let err = run.unwrap_err();

        assert!(matches!(err, ReconcileError::Bite { ref connector, .. } if connector == "remote"));
        assert_eq!(flaky.failures.load(std::sync::atomic::Ordering::SeqCst), 4);
        assert!(recorder.diffs.is_empty());
        assert_eq!(totals.progress, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_retries_wait_with_doubling_backoff() {
        let (master, remote) = exact_diff_pair();
        let flaky = Arc::new(FlakyConnector::always(remote));
        let mut options = opts(1000);
        options.retry_backoff = Duration::from_millis(100);

        let started = tokio::time::Instant::now();
        let (run, _, _) = compare(master, flaky.clone(), options).await;
        assert!(run.is_err());
        assert_eq!(flaky.failures.load(std::sync::atomic::Ordering::SeqCst), 4);

        // 100 + 200 + 400 ms before the fourth failure gives up
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(700), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(800), "waited {:?}", waited);
    }

    // =========================================================================
    // Sampling, deletion and capability checks
    // =========================================================================

    #[tokio::test]
    async fn test_sampling_reports_field_differences() {
        let (master, remote) = exact_diff_pair();
        let mut options = opts(1000);
        options.sample = true;
        options.sample_seed = Some(1);

        let (run, _, recorder) = compare(master, remote, options).await;
        run.unwrap();

        assert_eq!(recorder.samples.len(), 1);
        let sample = &recorder.samples[0];
        assert_eq!(sample.id, 7);
        let fields: Vec<&str> = sample.fields.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(fields, vec!["name", "qty"]);
        assert_eq!(sample.fields[1].remote, Some(json!(700)));
    }

    #[tokio::test]
    async fn test_should_delete_removes_extras_from_remote() {
        let (master, remote) = exact_diff_pair();
        let mut options = opts(1000);
        options.should_delete = true;

        let (run, totals, _) = compare(master, remote.clone(), options).await;
        run.unwrap();

        assert_eq!(totals.total_extra, 1);
        assert!(!remote.contains(&11));
        assert!(remote.contains(&4));
    }

    #[test]
    fn test_capability_checks_at_construction() {
        let master: Arc<dyn Connector<i64>> = Arc::new(DenseConnector::new("master", 10, vec![]));
        let remote: Arc<dyn Connector<i64>> = Arc::new(DenseConnector::new("remote", 10, vec![]));

        let mut sampling = opts(10);
        sampling.sample = true;
        let err = ChecksumNibbler::new(master.clone(), remote.clone(), sampling)
            .err()
            .unwrap();
        assert!(matches!(err, ReconcileError::Config(ref msg) if msg.contains("master")));

        let mut deleting = opts(10);
        deleting.should_delete = true;
        let err = ChecksumNibbler::new(master, remote, deleting).err().unwrap();
        assert!(matches!(err, ReconcileError::Config(ref msg) if msg.contains("remote")));
    }
}
