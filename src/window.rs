//! Fixed windows: how one interval's count is stored and kept current.

use crate::error::LimiterResult;
use crate::synchronizer::{SyncRequest, SyncResponse, Synchronizer};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// A fixed window `[start, start + size)` with one accumulated count.
pub trait Window: Send {
    /// Returns the start boundary.
    fn start(&self) -> SystemTime;

    /// Returns the accumulated count.
    fn count(&self) -> i64;

    /// Increments the accumulated count by `n`.
    fn add_count(&mut self, n: i64);

    /// Moves the window to `start` with an initial count of `count`.
    fn reset(&mut self, start: SystemTime, count: i64);

    /// Tries to exchange data with the central datastore at time `now`.
    fn sync(&mut self, now: SystemTime);
}

/// Stops a window's background synchronization, if any.
pub type StopFn = Box<dyn FnOnce() + Send>;

pub fn noop_stop() -> StopFn {
    Box::new(|| {})
}

pub(crate) fn unix_nanos(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}

pub(crate) fn from_unix_nanos(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}

/// Window that only keeps its count in memory.
#[derive(Debug, Clone, Default)]
pub struct LocalWindow {
    // Unix nanoseconds
    start: i64,
    count: i64,
}

impl LocalWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Boxed window plus its (no-op) stop action, for `Limiter::new`.
    pub fn boxed() -> LimiterResult<(Box<dyn Window>, StopFn)> {
        Ok((Box::new(Self::new()), noop_stop()))
    }

    pub(crate) fn start_nanos(&self) -> i64 {
        self.start
    }
}

impl Window for LocalWindow {
    fn start(&self) -> SystemTime {
        from_unix_nanos(self.start)
    }

    fn count(&self) -> i64 {
        self.count
    }

    fn add_count(&mut self, n: i64) {
        self.count += n;
    }

    fn reset(&mut self, start: SystemTime, count: i64) {
        self.start = unix_nanos(start);
        self.count = count;
    }

    fn sync(&mut self, _now: SystemTime) {}
}

/// Window whose count is periodically reconciled with the central datastore
/// through a [`Synchronizer`].
///
/// Synchronization is not automatic; it is driven by calls to [`Window::sync`].
pub struct SyncWindow<S> {
    base: LocalWindow,
    // Admitted in this window but not yet delivered to the datastore.
    changes: i64,
    key: String,
    syncer: S,
}

impl<S: Synchronizer> SyncWindow<S> {
    /// Starts `syncer` and returns the window with the action that stops it.
    pub fn new(key: impl Into<String>, mut syncer: S) -> LimiterResult<(Self, StopFn)> {
        syncer.start()?;
        let stop = syncer.stop_fn();

        let window = Self {
            base: LocalWindow::new(),
            changes: 0,
            key: key.into(),
            syncer,
        };
        Ok((window, stop))
    }

    /// Boxed variant of [`SyncWindow::new`], for `Limiter::new`.
    pub fn boxed(key: impl Into<String>, syncer: S) -> LimiterResult<(Box<dyn Window>, StopFn)> {
        let (window, stop) = Self::new(key, syncer)?;
        Ok((Box::new(window), stop))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pending_changes(&self) -> i64 {
        self.changes
    }

    fn handle_sync_response(&mut self, resp: SyncResponse) {
        if !resp.ok {
            return;
        }

        if resp.start != self.base.start_nanos() {
            debug!(
                key = %self.key,
                response_start = resp.start,
                window_start = self.base.start_nanos(),
                "discarding sync response for a window that has been reset"
            );
            return;
        }

        // Counts contributed by other limiters since our last observation.
        self.base.count += resp.other_changes;
        self.changes -= resp.changes;
    }
}

impl<S: Synchronizer> Window for SyncWindow<S> {
    fn start(&self) -> SystemTime {
        self.base.start()
    }

    fn count(&self) -> i64 {
        self.base.count()
    }

    fn add_count(&mut self, n: i64) {
        self.changes += n;
        self.base.add_count(n);
    }

    fn reset(&mut self, start: SystemTime, count: i64) {
        // Undelivered changes of the old window are dropped rather than
        // flushed; periodic synchronization alone keeps the count accurate.
        self.changes = 0;
        self.base.reset(start, count);
    }

    fn sync(&mut self, now: SystemTime) {
        let base = &self.base;
        let key = &self.key;
        let changes = self.changes;

        let resp = self.syncer.sync(now, || SyncRequest {
            key: key.clone(),
            start: base.start,
            count: base.count,
            changes,
        });

        if let Some(resp) = resp {
            self.handle_sync_response(resp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Synchronizer that records requests and replays scripted responses.
    #[derive(Default)]
    struct ScriptedSynchronizer {
        requests: Vec<SyncRequest>,
        responses: VecDeque<SyncResponse>,
        stops: Arc<AtomicUsize>,
    }

    impl Synchronizer for ScriptedSynchronizer {
        fn start(&mut self) -> LimiterResult<()> {
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn stop_fn(&self) -> StopFn {
            let stops = self.stops.clone();
            Box::new(move || {
                stops.fetch_add(1, Ordering::SeqCst);
            })
        }

        fn sync<F>(&mut self, _now: SystemTime, make_request: F) -> Option<SyncResponse>
        where
            F: FnOnce() -> SyncRequest,
        {
            self.requests.push(make_request());
            self.responses.pop_front()
        }
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_local_window() {
        let mut window = LocalWindow::new();
        assert_eq!(window.start(), UNIX_EPOCH);
        assert_eq!(window.count(), 0);

        window.add_count(3);
        window.add_count(2);
        assert_eq!(window.count(), 5);

        window.reset(at(10), 7);
        assert_eq!(window.start(), at(10));
        assert_eq!(window.count(), 7);

        // Sync is a no-op for local windows
        window.sync(at(11));
        assert_eq!(window.count(), 7);
    }

    #[test]
    fn test_unix_nanos_conversion() {
        let t = UNIX_EPOCH + Duration::from_nanos(1_500_000_123);
        assert_eq!(unix_nanos(t), 1_500_000_123);
        assert_eq!(from_unix_nanos(1_500_000_123), t);

        let before = UNIX_EPOCH - Duration::from_secs(1);
        assert_eq!(unix_nanos(before), -1_000_000_000);
        assert_eq!(from_unix_nanos(-1_000_000_000), before);
    }

    #[test]
    fn test_sync_window_tracks_pending_changes() {
        let (mut window, _stop) = SyncWindow::new("test", ScriptedSynchronizer::default()).unwrap();
        window.reset(at(10), 0);

        window.add_count(2);
        window.add_count(3);
        assert_eq!(window.count(), 5);
        assert_eq!(window.pending_changes(), 5);
    }

    #[test]
    fn test_sync_window_reset_discards_pending_changes() {
        let (mut window, _stop) = SyncWindow::new("test", ScriptedSynchronizer::default()).unwrap();
        window.add_count(4);
        window.reset(at(10), 4);

        assert_eq!(window.pending_changes(), 0);
        assert_eq!(window.count(), 4);
        assert_eq!(window.start(), at(10));
    }

    #[test]
    fn test_sync_window_builds_request_from_current_state() {
        let (mut window, _stop) = SyncWindow::new("api", ScriptedSynchronizer::default()).unwrap();
        window.reset(at(10), 1);
        window.add_count(2);
        window.sync(at(10));

        let req = &window.syncer.requests[0];
        assert_eq!(req.key, "api");
        assert_eq!(req.start, unix_nanos(at(10)));
        assert_eq!(req.count, 3);
        assert_eq!(req.changes, 2);
    }

    #[test]
    fn test_sync_window_applies_matching_response() {
        let start = unix_nanos(at(10));
        let mut syncer = ScriptedSynchronizer::default();
        syncer.responses.push_back(SyncResponse {
            ok: true,
            start,
            changes: 2,
            other_changes: 4,
        });

        let (mut window, _stop) = SyncWindow::new("test", syncer).unwrap();
        window.reset(at(10), 0);
        window.add_count(3);
        window.sync(at(10));

        assert_eq!(window.count(), 7);
        assert_eq!(window.pending_changes(), 1);
    }

    #[test]
    fn test_sync_window_discards_stale_response() {
        let mut syncer = ScriptedSynchronizer::default();
        syncer.responses.push_back(SyncResponse {
            ok: true,
            start: unix_nanos(at(9)),
            changes: 2,
            other_changes: 4,
        });

        let (mut window, _stop) = SyncWindow::new("test", syncer).unwrap();
        window.reset(at(10), 0);
        window.add_count(3);
        window.sync(at(10));

        assert_eq!(window.count(), 3);
        assert_eq!(window.pending_changes(), 3);
    }

    #[test]
    fn test_sync_window_ignores_failed_response() {
        let mut syncer = ScriptedSynchronizer::default();
        syncer.responses.push_back(SyncResponse::failed());

        let (mut window, _stop) = SyncWindow::new("test", syncer).unwrap();
        window.add_count(3);
        window.sync(at(0));

        assert_eq!(window.count(), 3);
        assert_eq!(window.pending_changes(), 3);
    }

    #[test]
    fn test_sync_window_stop_fn_stops_synchronizer() {
        let syncer = ScriptedSynchronizer::default();
        let stops = syncer.stops.clone();

        let (_window, stop) = SyncWindow::boxed("test", syncer).unwrap();
        stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
