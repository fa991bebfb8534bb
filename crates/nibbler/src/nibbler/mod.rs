//! Adaptive walk over a key range.
//!
//! A [`Nibbler`] asks one connector for window boundaries, hands each window
//! to a [`WindowHandler`], and advances a persisted [`Nibble`] cursor. The
//! walk is an explicit state machine:
//!
//! ```text
//! Init -> (Bite -> [Failure -> Recover] -> Advance)* -> End
//! ```
//!
//! The handler never touches the cursor position. It returns tagged results
//! ([`BiteFailure`], [`Recovery`]) and may only adjust `limit` while
//! recovering, so every window is processed exactly once in key order.

use std::fmt;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::connector::{
    Connector, ConnectorError, ConnectorResult, Key, KeyRange, KeyWindow, NibbleRequest,
    NibbleResponse, RangeOptions,
};
use crate::error::{ReconcileError, Result};

/// Default rows per window for a fresh walk.
pub const DEFAULT_LIMIT: u64 = 1_000;

/// Default ceiling for limit growth.
pub const DEFAULT_MAX_LIMIT: u64 = 1_000_000;

/// Wall time a window should take once the limit has adapted.
pub const TARGET_WINDOW_MS: u64 = 1_000;

/// Largest multiplier applied to the limit after a clean window.
pub const GROWTH_FACTOR: u64 = 5;

/// Cursor over the key range. Serialized into the session after every window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nibble<K> {
    /// Forward cursor; in reverse mode, the start of the current window.
    pub start: Option<K>,
    /// Reverse cursor; in forward mode, the end of the current window.
    pub end: Option<K>,
    pub min: Option<K>,
    pub max: Option<K>,
    /// Row count reported by the walking connector.
    pub total: u64,
    pub limit: u64,
    /// Boundary of the following window, set while a window is in flight.
    pub next: Option<K>,
    /// Rows accounted for so far.
    pub progress: u64,
    pub reverse: bool,
    #[serde(default)]
    pub had_recent_errors: bool,
    #[serde(default)]
    pub last_duration_ms: u64,
}

impl<K: Key> Nibble<K> {
    /// Fresh cursor positioned at the beginning (or end, when reversed) of `range`.
    pub fn new(range: &KeyRange<K>, limit: u64, reverse: bool) -> Self {
        Self {
            start: range.min.clone(),
            end: range.max.clone(),
            min: range.min.clone(),
            max: range.max.clone(),
            total: range.total,
            limit: limit.max(1),
            next: None,
            progress: 0,
            reverse,
            had_recent_errors: false,
            last_duration_ms: 0,
        }
    }

    /// True once the cursor has moved past the last window.
    pub fn is_exhausted(&self) -> bool {
        if self.reverse {
            self.end.is_none()
        } else {
            self.start.is_none()
        }
    }

    /// Boundary request for the window at the cursor.
    pub fn request(&self) -> NibbleRequest<K> {
        NibbleRequest {
            start: self.start.clone(),
            end: self.end.clone(),
            limit: self.limit,
            reverse: self.reverse,
        }
    }

    /// Record the boundary returned by the connector.
    ///
    /// A `next` outside `[min, max]` means the rest of the range fits in this
    /// window, so it is dropped and the window runs to the range edge.
    pub fn apply_boundary(&mut self, resp: NibbleResponse<K>) -> ConnectorResult<()> {
        let NibbleResponse { current, mut next } = resp;

        if self.reverse {
            if let (Some(n), Some(min)) = (&next, &self.min) {
                if n < min {
                    next = None;
                }
            }
            if let (Some(n), Some(end)) = (&next, &self.end) {
                if n >= end {
                    return Err(ConnectorError::InvalidResponse(format!(
                        "reverse boundary {:?} does not precede cursor {:?}",
                        n, end
                    )));
                }
            }
            self.start = if next.is_some() {
                current
            } else {
                self.min.clone()
            };
        } else {
            if let (Some(n), Some(max)) = (&next, &self.max) {
                if n > max {
                    next = None;
                }
            }
            if let (Some(n), Some(start)) = (&next, &self.start) {
                if n <= start {
                    return Err(ConnectorError::InvalidResponse(format!(
                        "boundary {:?} does not follow cursor {:?}",
                        n, start
                    )));
                }
            }
            self.end = if next.is_some() {
                current
            } else {
                self.max.clone()
            };
        }

        self.next = next;
        Ok(())
    }

    /// Window covered by the boundary last applied.
    ///
    /// Forward windows are `[start, next)`, reverse windows `(next, end]`; the
    /// last window of a walk is closed at the range edge.
    pub fn window(&self) -> Option<KeyWindow<K>> {
        if self.reverse {
            let end = self.end.clone()?;
            let lower = match (&self.next, &self.min) {
                (Some(next), _) => Bound::Excluded(next.clone()),
                (None, Some(min)) => Bound::Included(min.clone()),
                (None, None) => Bound::Unbounded,
            };
            Some(KeyWindow {
                lower,
                upper: Bound::Included(end),
            })
        } else {
            let start = self.start.clone()?;
            let upper = match (&self.next, &self.max) {
                (Some(next), _) => Bound::Excluded(next.clone()),
                (None, Some(max)) => Bound::Included(max.clone()),
                (None, None) => Bound::Unbounded,
            };
            Some(KeyWindow {
                lower: Bound::Included(start),
                upper,
            })
        }
    }

    /// Move the cursor to the following window.
    pub fn advance(&mut self) {
        if self.reverse {
            self.end = self.next.take();
        } else {
            self.start = self.next.take();
        }
    }

    /// Adapt the limit after a window that resolved without a failure.
    ///
    /// The first clean window after a failure only clears the error flag.
    pub fn adapt_limit(&mut self, max_limit: u64) {
        if self.had_recent_errors {
            self.had_recent_errors = false;
            return;
        }
        self.limit = grown_limit(self.limit, self.last_duration_ms, max_limit);
    }

    /// Share of the walking connector's rows accounted for.
    ///
    /// Capped below 100 until the cursor is exhausted, since `total` may be
    /// stale by the time the walk ends.
    pub fn percent_complete(&self) -> f64 {
        if self.is_exhausted() {
            return 100.0;
        }
        if self.total == 0 {
            return 0.0;
        }
        let percent = self.progress as f64 / self.total as f64 * 100.0;
        percent.min(99.99)
    }

    /// Range this cursor walks.
    pub fn range(&self) -> KeyRange<K> {
        KeyRange {
            min: self.min.clone(),
            max: self.max.clone(),
            total: self.total,
        }
    }
}

/// Next limit after a clean window that took `last_duration_ms`.
///
/// Aims for [`TARGET_WINDOW_MS`] per window, growing at most
/// [`GROWTH_FACTOR`]x and never past `max_limit`.
pub fn grown_limit(limit: u64, last_duration_ms: u64, max_limit: u64) -> u64 {
    let estimate = limit.saturating_mul(TARGET_WINDOW_MS) / last_duration_ms.max(1);
    limit
        .saturating_mul(GROWTH_FACTOR)
        .min(max_limit)
        .min(estimate)
        .max(1)
}

/// Why a walk ended before exhausting its range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Enough consecutive clean windows were seen.
    Streak,
    /// The next window would likely overrun the deadline.
    TimeBudget,
    /// Shutdown was requested.
    Cancelled,
    Custom(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Streak => write!(f, "streak"),
            StopReason::TimeBudget => write!(f, "time_budget"),
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::Custom(reason) => write!(f, "{}", reason),
        }
    }
}

/// Failed window, as reported by [`WindowHandler::bite`].
#[derive(Debug)]
pub enum BiteFailure<M> {
    /// The window was examined and did not agree.
    Mismatch(M),
    /// A connector call failed.
    Transport {
        connector: String,
        error: ConnectorError,
    },
}

impl<M> BiteFailure<M> {
    pub fn transport(connector: impl Into<String>, error: ConnectorError) -> Self {
        BiteFailure::Transport {
            connector: connector.into(),
            error,
        }
    }
}

/// Decision returned by [`WindowHandler::recover`].
#[derive(Debug)]
pub enum Recovery {
    /// The handler resolved the window itself, accounting for `rows` rows.
    Advanced { rows: u64 },
    /// Try the window at the cursor again, with whatever limit is now set.
    Retry,
    /// Give up on the walk.
    Abort(ReconcileError),
}

/// Per-window behavior plugged into a [`Nibbler`].
#[async_trait]
pub trait WindowHandler<K: Key>: Send {
    /// Payload of [`BiteFailure::Mismatch`].
    type Mismatch: Send;

    /// Called once the cursor is positioned, before the first window.
    async fn on_init(&mut self, _nibble: &Nibble<K>) -> Result<()> {
        Ok(())
    }

    /// Examine one window. Returns the number of rows it accounts for.
    async fn bite(
        &mut self,
        nibble: &Nibble<K>,
        window: &KeyWindow<K>,
    ) -> std::result::Result<u64, BiteFailure<Self::Mismatch>>;

    /// Handle a failed window. Only `nibble.limit` may be changed.
    async fn recover(
        &mut self,
        failure: BiteFailure<Self::Mismatch>,
        nibble: &mut Nibble<K>,
    ) -> Recovery;

    /// Called after the cursor moved past a resolved window.
    async fn on_advance(&mut self, _nibble: &Nibble<K>) -> Result<()> {
        Ok(())
    }

    /// Checked before every window; `Some` ends the walk early.
    fn stop_reason(&mut self, _nibble: &Nibble<K>) -> Option<StopReason> {
        None
    }

    /// Final bookkeeping. `error` is set when the walk failed.
    async fn on_end(&mut self, _nibble: &Nibble<K>, _error: Option<&ReconcileError>) -> Result<()> {
        Ok(())
    }
}

/// Options for a [`Nibbler`].
#[derive(Debug, Clone)]
pub struct NibblerOptions<K> {
    /// Initial rows per window.
    pub limit: u64,
    pub max_limit: u64,
    pub reverse: bool,
    /// Use this range instead of asking the connector.
    pub range: Option<KeyRange<K>>,
    /// Restriction passed to [`Connector::range`].
    pub range_options: RangeOptions<K>,
    /// Initial forward cursor, overriding the range minimum.
    pub start: Option<K>,
    /// Initial reverse cursor, overriding the range maximum.
    pub end: Option<K>,
    /// Persisted cursor to continue from. Takes precedence over everything above.
    pub resume: Option<Nibble<K>>,
}

impl<K> Default for NibblerOptions<K> {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            max_limit: DEFAULT_MAX_LIMIT,
            reverse: false,
            range: None,
            range_options: RangeOptions::default(),
            start: None,
            end: None,
            resume: None,
        }
    }
}

/// Outcome of [`Nibbler::run`].
#[derive(Debug, Clone)]
pub struct NibbleRun<K> {
    /// Cursor at the end of the walk.
    pub nibble: Nibble<K>,
    /// Set when the walk stopped before exhausting the range.
    pub stop_reason: Option<StopReason>,
    /// Windows resolved during this run.
    pub windows: u64,
}

/// Drives a [`WindowHandler`] across the key range of one connector.
pub struct Nibbler<K> {
    connector: Arc<dyn Connector<K>>,
    opts: NibblerOptions<K>,
}

impl<K: Key> Nibbler<K> {
    pub fn new(connector: Arc<dyn Connector<K>>, opts: NibblerOptions<K>) -> Self {
        Self { connector, opts }
    }

    /// Walk the range to the end or until the handler asks to stop.
    pub async fn run<H: WindowHandler<K>>(&self, handler: &mut H) -> Result<NibbleRun<K>> {
        let mut nibble = self.init().await?;
        handler.on_init(&nibble).await?;

        let mut windows = 0u64;
        let walked = self.walk(&mut nibble, handler, &mut windows).await;

        let ended = handler.on_end(&nibble, walked.as_ref().err()).await;
        let stop_reason = walked?;
        ended.map_err(|e| ReconcileError::Terminal(e.to_string()))?;

        Ok(NibbleRun {
            nibble,
            stop_reason,
            windows,
        })
    }

    async fn init(&self) -> Result<Nibble<K>> {
        if let Some(resume) = &self.opts.resume {
            info!(
                "{}: resuming walk at {:?} ({}/{} rows, limit {})",
                self.connector.name(),
                if resume.reverse { &resume.end } else { &resume.start },
                resume.progress,
                resume.total,
                resume.limit,
            );
            let mut nibble = resume.clone();
            nibble.next = None;
            return Ok(nibble);
        }

        let range = match &self.opts.range {
            Some(range) => range.clone(),
            None => self
                .connector
                .range(&self.opts.range_options)
                .await
                .map_err(|e| ReconcileError::range(self.connector.name(), e))?,
        };

        let limit = self.opts.limit.min(self.opts.max_limit).max(1);
        let mut nibble = Nibble::new(&range, limit, self.opts.reverse);
        if let Some(start) = &self.opts.start {
            nibble.start = Some(start.clone());
        }
        if let Some(end) = &self.opts.end {
            nibble.end = Some(end.clone());
        }

        info!(
            "{}: walking {} rows ({:?}..{:?}, limit {}, {})",
            self.connector.name(),
            nibble.total,
            nibble.min,
            nibble.max,
            nibble.limit,
            if nibble.reverse { "reverse" } else { "forward" },
        );
        Ok(nibble)
    }

    async fn walk<H: WindowHandler<K>>(
        &self,
        nibble: &mut Nibble<K>,
        handler: &mut H,
        windows: &mut u64,
    ) -> Result<Option<StopReason>> {
        loop {
            if nibble.is_exhausted() {
                info!(
                    "{}: range exhausted after {} windows",
                    self.connector.name(),
                    windows
                );
                return Ok(None);
            }
            if let Some(reason) = handler.stop_reason(nibble) {
                info!(
                    "{}: stopping at {:.2}% ({})",
                    self.connector.name(),
                    nibble.percent_complete(),
                    reason
                );
                return Ok(Some(reason));
            }

            let started = Instant::now();
            let bitten = match self.locate(nibble).await {
                Ok(window) => handler.bite(nibble, &window).await,
                Err(failure) => Err(failure),
            };

            let resolved = match bitten {
                Ok(rows) => Some((rows, true)),
                Err(failure) => {
                    nibble.had_recent_errors = true;
                    match handler.recover(failure, nibble).await {
                        Recovery::Advanced { rows } => Some((rows, false)),
                        Recovery::Retry => None,
                        Recovery::Abort(err) => return Err(err),
                    }
                }
            };
            nibble.last_duration_ms = started.elapsed().as_millis() as u64;

            let Some((rows, clean)) = resolved else {
                nibble.next = None;
                continue;
            };

            nibble.progress += rows;
            nibble.advance();
            if clean {
                nibble.adapt_limit(self.opts.max_limit);
            }
            *windows += 1;
            debug!(
                "{}: window {} resolved {} rows in {}ms, next limit {}",
                self.connector.name(),
                windows,
                rows,
                nibble.last_duration_ms,
                nibble.limit
            );
            handler.on_advance(nibble).await?;
        }
    }

    /// Ask the connector where the window at the cursor ends.
    async fn locate<M>(
        &self,
        nibble: &mut Nibble<K>,
    ) -> std::result::Result<KeyWindow<K>, BiteFailure<M>> {
        let name = self.connector.name();
        let resp = self
            .connector
            .nibble(&nibble.request())
            .await
            .map_err(|e| BiteFailure::transport(name, e))?;
        nibble
            .apply_boundary(resp)
            .map_err(|e| BiteFailure::transport(name, e))?;
        nibble.window().ok_or_else(|| {
            BiteFailure::transport(
                name,
                ConnectorError::InvalidResponse("no window at exhausted cursor".to_string()),
            )
        })
    }
}
