use std::time::{Duration, Instant};

/// Safety margin applied to the last window's duration.
const OVERRUN_FACTOR: f64 = 1.33;

/// Deadline for a run, checked before each window.
///
/// The next window is assumed to take about as long as the last one; it is
/// only started if it would finish, with margin, before the deadline.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeBudget {
    stop_at: Option<Instant>,
    last_window: Option<Duration>,
}

impl TimeBudget {
    /// No deadline.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn until(stop_at: Instant) -> Self {
        Self {
            stop_at: Some(stop_at),
            last_window: None,
        }
    }

    /// Deadline `budget` from now.
    pub fn from_now(budget: Duration) -> Self {
        Self::until(Instant::now() + budget)
    }

    pub fn stop_at(&self) -> Option<Instant> {
        self.stop_at
    }

    pub fn record_window(&mut self, duration: Duration) {
        self.last_window = Some(duration);
    }

    /// Whether a window starting at `now` is expected to finish in time.
    pub fn allows(&self, now: Instant) -> bool {
        let Some(stop_at) = self.stop_at else {
            return true;
        };
        let expected = self
            .last_window
            .map(|d| d.mul_f64(OVERRUN_FACTOR))
            .unwrap_or_default();
        now + expected <= stop_at
    }
}
