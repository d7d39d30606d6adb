//! Approximated sliding-window limiter over a current/previous window pair.

use crate::error::{LimiterError, LimiterResult};
use crate::window::{from_unix_nanos, unix_nanos, StopFn, Window};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, SystemTime};

/// Start and count of one window, as seen by the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowSnapshot {
    /// Unix nanoseconds
    pub start: i64,
    pub count: i64,
}

struct LimiterState {
    limit: i64,
    curr: Box<dyn Window>,
    prev: Box<dyn Window>,
}

/// Admits events while the interpolated count over the last `size` stays
/// within `limit`.
///
/// The count is estimated from two adjacent fixed windows, assuming events in
/// the previous window were evenly spread:
///
/// ```text
/// count = floor(prev.count * (size - elapsed) / size) + curr.count
/// ```
pub struct Limiter {
    size: Duration,
    size_nanos: i64,
    state: Mutex<LimiterState>,
}

impl Limiter {
    /// Creates a limiter whose two windows both come from `new_window`.
    ///
    /// The returned action stops both windows' synchronization and must be
    /// called once the limiter is no longer used.
    pub fn new<F>(size: Duration, limit: i64, new_window: F) -> LimiterResult<(Self, StopFn)>
    where
        F: Fn() -> LimiterResult<(Box<dyn Window>, StopFn)>,
    {
        let size_nanos = i64::try_from(size.as_nanos()).unwrap_or(0);
        if size_nanos <= 0 {
            return Err(LimiterError::ValidationError(
                "Window size must be greater than 0".to_string(),
            ));
        }

        let (curr, curr_stop) = new_window()?;
        let (prev, prev_stop) = match new_window() {
            Ok(window) => window,
            Err(e) => {
                curr_stop();
                return Err(e);
            }
        };

        let limiter = Self {
            size,
            size_nanos,
            state: Mutex::new(LimiterState { limit, curr, prev }),
        };
        let stop: StopFn = Box::new(move || {
            curr_stop();
            prev_stop();
        });

        Ok((limiter, stop))
    }

    /// Window size. Fixed for the limiter's lifetime; build a new limiter to
    /// change it.
    pub fn size(&self) -> Duration {
        self.size
    }

    /// Maximum events permitted during one window size.
    pub fn limit(&self) -> i64 {
        self.state.lock().limit
    }

    pub fn set_limit(&self, new_limit: i64) {
        self.state.lock().limit = new_limit;
    }

    /// Shorthand for `allow_n(SystemTime::now(), 1)`.
    pub fn allow(&self) -> bool {
        self.allow_n(SystemTime::now(), 1)
    }

    /// Reports whether `n` events may happen at time `now`, recording them
    /// if so.
    pub fn allow_n(&self, now: SystemTime, n: i64) -> bool {
        let mut state = self.state.lock();
        let now_nanos = unix_nanos(now);

        self.advance(&mut state, now_nanos);

        let count = self.estimate(&state, now_nanos);
        let allowed = count.saturating_add(n) <= state.limit;
        if allowed {
            state.curr.add_count(n);
        }

        state.curr.sync(now);
        allowed
    }

    /// Returns the `(previous, current)` windows.
    pub fn snapshot(&self) -> (WindowSnapshot, WindowSnapshot) {
        let state = self.state.lock();
        (snapshot(state.prev.as_ref()), snapshot(state.curr.as_ref()))
    }

    /// Rolls the window pair forward to the window containing `now`.
    fn advance(&self, state: &mut LimiterState, now_nanos: i64) {
        let new_curr_start = now_nanos - now_nanos.rem_euclid(self.size_nanos);
        let curr_start = unix_nanos(state.curr.start());

        let diff = (new_curr_start - curr_start) / self.size_nanos;
        if diff < 1 {
            return;
        }

        // Only a contiguous old window carries its count over. The count is a
        // snapshot and may itself lag behind the datastore.
        let new_prev_count = if diff == 1 { state.curr.count() } else { 0 };
        state.prev.reset(
            from_unix_nanos(new_curr_start - self.size_nanos),
            new_prev_count,
        );
        state.curr.reset(from_unix_nanos(new_curr_start), 0);
    }

    fn estimate(&self, state: &LimiterState, now_nanos: i64) -> i64 {
        let curr_start = unix_nanos(state.curr.start());
        let elapsed = (now_nanos - curr_start).clamp(0, self.size_nanos);

        let weight = (self.size_nanos - elapsed) as f64 / self.size_nanos as f64;
        (weight * state.prev.count() as f64) as i64 + state.curr.count()
    }
}

fn snapshot(window: &dyn Window) -> WindowSnapshot {
    WindowSnapshot {
        start: unix_nanos(window.start()),
        count: window.count(),
    }
}
