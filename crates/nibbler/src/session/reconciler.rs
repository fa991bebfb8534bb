//! Runs one job from its persisted session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    ProgressEvent, ReconcileReport, Session, SessionStatus, TimeBudget, ROLLING_SAMPLE_SIZE,
};
use crate::checksum::{
    ChecksumNibbler, ChecksumOptions, DiffResult, FieldDiff, NullObserver, ReconcileObserver,
    WindowReport,
};
use crate::connector::{Connector, InitOptions, Key, KeyWindow};
use crate::error::{ReconcileError, Result};
use crate::nibbler::{Nibble, NibbleRun, StopReason};
use crate::sampler::Sampler;
use crate::state::SessionStore;

/// Options for a [`Reconciler`].
#[derive(Debug, Clone)]
pub struct ReconcileOptions<K> {
    pub job_id: String,
    /// Hash of the configuration; a resumed session must match it.
    pub config_hash: String,
    /// Discard any saved session and start over.
    pub restart: bool,
    /// Stop starting new windows once this much time has passed.
    pub time_budget: Option<Duration>,
    pub checksum: ChecksumOptions<K>,
}

impl<K> ReconcileOptions<K> {
    pub fn new(job_id: impl Into<String>, config_hash: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            config_hash: config_hash.into(),
            restart: false,
            time_budget: None,
            checksum: ChecksumOptions::default(),
        }
    }
}

/// Drives a reconciliation job: load or create its session, run the
/// comparison, persist after every window and release the connectors.
pub struct Reconciler<K: Key> {
    master: Arc<dyn Connector<K>>,
    remote: Arc<dyn Connector<K>>,
    store: Arc<dyn SessionStore<K>>,
    opts: ReconcileOptions<K>,
    progress_tx: Option<mpsc::Sender<ProgressEvent<K>>>,
    cancel: CancellationToken,
}

impl<K: Key> Reconciler<K> {
    pub fn new(
        master: Arc<dyn Connector<K>>,
        remote: Arc<dyn Connector<K>>,
        store: Arc<dyn SessionStore<K>>,
        opts: ReconcileOptions<K>,
    ) -> Self {
        Self {
            master,
            remote,
            store,
            opts,
            progress_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set a progress channel for real-time updates.
    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressEvent<K>>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// Stop between windows once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the job. Connectors are destroyed on every path.
    pub async fn run(self) -> Result<ReconcileReport<K>> {
        let started_at = Utc::now();
        let budget = match self.opts.time_budget {
            Some(budget) => TimeBudget::from_now(budget),
            None => TimeBudget::unlimited(),
        };

        let checker = match ChecksumNibbler::new(
            self.master.clone(),
            self.remote.clone(),
            self.opts.checksum.clone(),
        ) {
            Ok(checker) => checker,
            Err(e) => {
                self.log_destroy(self.destroy_all().await);
                return Err(e);
            }
        };

        let (mut session, resumed) = match self.load_or_create().await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.log_destroy(self.destroy_all().await);
                return Err(e);
            }
        };
        session.run_id = uuid::Uuid::new_v4().to_string();

        info!(
            "Starting reconciliation {} (run {}, {}, store: {})",
            session.id,
            session.run_id,
            if resumed { "resuming" } else { "fresh" },
            self.store.backend_type()
        );

        let (session, walked) = self.walk(checker, session, resumed, budget).await;
        let destroyed = self.destroy_all().await;
        self.finish(session, walked, destroyed, resumed, started_at)
            .await
    }

    async fn load_or_create(&self) -> Result<(Session<K>, bool)> {
        let job_id = &self.opts.job_id;
        let fresh = || Session::new(job_id.clone(), self.opts.config_hash.clone());

        if self.opts.restart {
            if self.store.remove(job_id).await? {
                info!("Discarded previous session for {}", job_id);
            }
            return Ok((fresh(), false));
        }

        match self.store.load(job_id).await? {
            None => Ok((fresh(), false)),
            Some(session) if session.status == SessionStatus::Initializing => {
                info!("Previous session for {} was never initialized", job_id);
                Ok((fresh(), false))
            }
            Some(session) if session.status == SessionStatus::Complete => {
                info!("Previous session for {} is complete, starting a new pass", job_id);
                Ok((fresh(), false))
            }
            Some(session) => {
                session.validate_config(&self.opts.config_hash)?;
                info!(
                    "Resuming session {} ({}, {:.2}%)",
                    job_id,
                    session.status,
                    session.percent_complete()
                );
                Ok((session, true))
            }
        }
    }

    /// Everything between loading the session and destroying the connectors.
    /// The session is always handed back so its final state can be saved.
    async fn walk(
        &self,
        checker: ChecksumNibbler<K, NullObserver>,
        mut session: Session<K>,
        resumed: bool,
        budget: TimeBudget,
    ) -> (Session<K>, Result<NibbleRun<K>>) {
        if let Err(e) = self.start_connectors(&mut session, resumed).await {
            return (session, Err(e));
        }
        session.mark_running();
        if let Err(e) = self.store.save(&session).await {
            return (session, Err(e));
        }

        let mut checker = checker.with_totals(session.totals.clone());
        if let Some(nibble) = &session.nibble {
            checker = checker.resume_from(nibble.clone());
        } else if let Some(range) = &session.range {
            checker = checker.with_range(range.clone());
        }

        let observer = SessionObserver {
            session,
            store: self.store.clone(),
            progress_tx: self.progress_tx.clone(),
            progress_closed: false,
            budget,
            cancel: self.cancel.clone(),
            sampler: Sampler::new(self.opts.checksum.sample_seed),
        };
        let mut checker = checker.with_observer(observer);
        let walked = checker.run().await;
        (checker.into_observer().session, walked)
    }

    async fn start_connectors(&self, session: &mut Session<K>, resumed: bool) -> Result<()> {
        if resumed {
            self.master.set_session(session.master.clone());
            self.remote.set_session(session.slave.clone());
            return Ok(());
        }

        self.store.save(session).await?;
        let init = InitOptions {
            job_id: session.id.clone(),
        };
        let (master, remote) = tokio::join!(
            self.master.initialize(&init),
            self.remote.initialize(&init)
        );
        session.master = master.map_err(|e| ReconcileError::lifecycle(self.master.name(), e))?;
        session.slave = remote.map_err(|e| ReconcileError::lifecycle(self.remote.name(), e))?;
        Ok(())
    }

    async fn destroy_all(&self) -> Result<()> {
        let (master, remote) = tokio::join!(self.master.destroy(), self.remote.destroy());

        let mut failures = Vec::new();
        if let Err(e) = master {
            failures.push(format!("{}: {}", self.master.name(), e));
        }
        if let Err(e) = remote {
            failures.push(format!("{}: {}", self.remote.name(), e));
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ReconcileError::Terminal(format!(
                "destroy failed ({})",
                failures.join("; ")
            )))
        }
    }

    fn log_destroy(&self, destroyed: Result<()>) {
        if let Err(e) = destroyed {
            warn!("{}", e);
        }
    }

    async fn finish(
        &self,
        mut session: Session<K>,
        walked: Result<NibbleRun<K>>,
        destroyed: Result<()>,
        resumed: bool,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<ReconcileReport<K>> {
        let (stop_reason, windows, walk_error) = match walked {
            Ok(run) => (run.stop_reason, run.windows, None),
            Err(e) => (None, 0, Some(e)),
        };
        let failure = match (walk_error, destroyed) {
            (Some(e), destroyed) => {
                self.log_destroy(destroyed);
                Some(e)
            }
            (None, Err(e)) => Some(e),
            (None, Ok(())) => None,
        };

        match (&failure, &stop_reason) {
            (Some(e), _) => session.mark_error(e.to_string()),
            (None, Some(StopReason::Streak)) | (None, None) => session.mark_complete(),
            (None, Some(reason)) => session.mark_paused(reason),
        }
        session.push_log(format!(
            "{} {}{}",
            Utc::now().to_rfc3339(),
            session.status,
            session
                .status_reason
                .as_ref()
                .map(|r| format!(": {}", r))
                .unwrap_or_default()
        ));

        let saved = self.store.save(&session).await;
        if let Some(e) = failure {
            error!("Reconciliation {} failed: {}", session.id, e);
            if let Err(save_err) = saved {
                warn!("Could not persist failed session {}: {}", session.id, save_err);
            }
            return Err(e);
        }
        saved?;

        let completed_at = Utc::now();
        let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
        let report = ReconcileReport {
            job_id: session.id.clone(),
            run_id: session.run_id.clone(),
            status: session.status,
            stop_reason,
            resumed,
            totals: session.totals.clone(),
            percent_complete: session.percent_complete(),
            windows,
            sample: session.sample.clone(),
            started_at,
            completed_at,
            duration_seconds,
        };

        info!(
            "Reconciliation {} {}: {} correct, {} incorrect, {} missing, {} extra ({:.2}%) in {:.1}s",
            report.job_id,
            report.status,
            report.totals.total_correct,
            report.totals.total_incorrect,
            report.totals.total_missing,
            report.totals.total_extra,
            report.percent_complete,
            report.duration_seconds
        );
        Ok(report)
    }
}

/// Keeps the session current as windows resolve.
struct SessionObserver<K: Key> {
    session: Session<K>,
    store: Arc<dyn SessionStore<K>>,
    progress_tx: Option<mpsc::Sender<ProgressEvent<K>>>,
    /// Set once the receiver is gone, so the drop is logged only once.
    progress_closed: bool,
    budget: TimeBudget,
    cancel: CancellationToken,
    sampler: Sampler,
}

#[async_trait]
impl<K: Key> ReconcileObserver<K> for SessionObserver<K> {
    async fn on_start(&mut self, nibble: &Nibble<K>) -> Result<()> {
        if self.session.nibble.is_none() {
            self.session.range = Some(nibble.range());
            self.session.nibble = Some(nibble.clone());
            self.store.save(&self.session).await?;
        }
        Ok(())
    }

    async fn on_diff(
        &mut self,
        _window: &KeyWindow<K>,
        diff: &DiffResult<K>,
        _samples: &[FieldDiff<K>],
    ) -> Result<()> {
        self.session
            .sample
            .merge(diff, &mut self.sampler, ROLLING_SAMPLE_SIZE);
        Ok(())
    }

    async fn on_window(&mut self, report: &WindowReport<K>) -> Result<()> {
        self.budget
            .record_window(Duration::from_millis(report.nibble.last_duration_ms));
        self.session.totals = report.totals.clone();
        self.session.nibble = Some(report.nibble.clone());

        let percent = report.nibble.percent_complete();
        self.session.push_log(format!(
            "{} {}: {} rows, {} incorrect, {} missing, {} extra ({:.2}%)",
            Utc::now().to_rfc3339(),
            report.window,
            report.counts.qty,
            report.counts.incorrect,
            report.counts.missing,
            report.counts.extra,
            percent
        ));

        if let Some(tx) = &self.progress_tx {
            let event = ProgressEvent {
                job_id: self.session.id.clone(),
                percent_complete: percent,
                correct: report.totals.total_correct,
                incorrect: report.totals.total_incorrect,
                missing: report.totals.total_missing,
                extra: report.totals.total_extra,
                start: report.first.clone(),
                end: report.last.clone(),
            };
            if tx.send(event).await.is_err() && !self.progress_closed {
                debug!(
                    "Progress receiver for {} dropped, no further events are sent",
                    self.session.id
                );
                self.progress_closed = true;
            }
        }

        self.store.save(&self.session).await
    }

    fn stop_reason(&mut self, _nibble: &Nibble<K>) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        if !self.budget.allows(Instant::now()) {
            return Some(StopReason::TimeBudget);
        }
        None
    }
}
