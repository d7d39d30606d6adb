//! Exchanges window counts with the central datastore, either inline on the
//! caller's thread or through a dedicated worker thread.

use crate::datastore::Datastore;
use crate::error::{LimiterError, LimiterResult};
use crate::window::{noop_stop, StopFn};
use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, trace, warn};

/// Snapshot of a window pushed to the datastore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub key: String,
    /// Window start in Unix nanoseconds.
    pub start: i64,
    pub count: i64,
    /// Undelivered delta to add.
    pub changes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncResponse {
    /// Whether the exchange succeeded.
    pub ok: bool,
    pub start: i64,
    /// The changes delivered on behalf of the local window.
    pub changes: i64,
    /// The changes accumulated by all other limiters.
    pub other_changes: i64,
}

impl SyncResponse {
    pub fn failed() -> Self {
        Self::default()
    }
}

/// Drives the request/response exchange between a window and the datastore.
pub trait Synchronizer: Send + 'static {
    /// Starts the background worker, if any.
    fn start(&mut self) -> LimiterResult<()>;

    /// Stops the background worker, if any, and waits for it to exit.
    fn stop(&self);

    /// Returns an action equivalent to [`Synchronizer::stop`] that can be
    /// called after the synchronizer has been moved into a window.
    fn stop_fn(&self) -> StopFn;

    /// Exchanges data with the datastore if an exchange is due.
    ///
    /// `make_request` is only called when a request is actually dispatched.
    /// Returns a response once one is ready to be applied by the window.
    fn sync<F>(&mut self, now: SystemTime, make_request: F) -> Option<SyncResponse>
    where
        F: FnOnce() -> SyncRequest;
}

/// Performs one exchange: pushes pending changes, or just reads the total
/// when there is nothing to push.
pub fn exchange(store: &dyn Datastore, req: &SyncRequest) -> LimiterResult<SyncResponse> {
    let new_count = if req.changes > 0 {
        store.add(&req.key, req.start, req.changes)?
    } else {
        store.get(&req.key, req.start)?
    };

    Ok(SyncResponse {
        ok: true,
        start: req.start,
        changes: req.changes,
        other_changes: new_count - req.count,
    })
}

fn exchange_or_failed(store: &dyn Datastore, req: &SyncRequest) -> SyncResponse {
    match exchange(store, req) {
        Ok(resp) => {
            debug!(
                key = %req.key,
                start = req.start,
                changes = resp.changes,
                other_changes = resp.other_changes,
                "synchronized window"
            );
            resp
        }
        Err(e) => {
            warn!(key = %req.key, start = req.start, error = %e, "window synchronization failed");
            SyncResponse::failed()
        }
    }
}

/// Interval bookkeeping shared by both synchronizers.
#[derive(Debug, Clone)]
pub struct SyncHelper {
    sync_interval: Duration,
    in_progress: bool,
    last_synced: Option<SystemTime>,
}

impl SyncHelper {
    pub fn new(sync_interval: Duration) -> Self {
        Self {
            sync_interval,
            in_progress: false,
            last_synced: None,
        }
    }

    /// Whether no exchange is in flight and the interval has elapsed since
    /// the last one started.
    pub fn is_time_up(&self, now: SystemTime) -> bool {
        if self.in_progress {
            return false;
        }

        match self.last_synced {
            None => true,
            Some(last) => now
                .duration_since(last)
                .map(|elapsed| elapsed >= self.sync_interval)
                .unwrap_or(false),
        }
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn begin(&mut self, now: SystemTime) {
        self.in_progress = true;
        self.last_synced = Some(now);
    }

    pub fn end(&mut self) {
        self.in_progress = false;
    }
}

/// Synchronizes inline, on the caller's thread, with no worker thread.
///
/// Suited to low call volumes, or when a fresher view of the other
/// instances is worth adding datastore latency to admission.
pub struct BlockingSynchronizer {
    store: Arc<dyn Datastore>,
    helper: SyncHelper,
}

impl BlockingSynchronizer {
    pub fn new(store: Arc<dyn Datastore>, sync_interval: Duration) -> Self {
        Self {
            store,
            helper: SyncHelper::new(sync_interval),
        }
    }
}

impl Synchronizer for BlockingSynchronizer {
    fn start(&mut self) -> LimiterResult<()> {
        Ok(())
    }

    fn stop(&self) {}

    fn stop_fn(&self) -> StopFn {
        noop_stop()
    }

    fn sync<F>(&mut self, now: SystemTime, make_request: F) -> Option<SyncResponse>
    where
        F: FnOnce() -> SyncRequest,
    {
        if !self.helper.is_time_up(now) {
            return None;
        }

        self.helper.begin(now);
        let resp = exchange_or_failed(self.store.as_ref(), &make_request());
        self.helper.end();

        Some(resp)
    }
}

/// Receiving ends handed to the worker thread on start.
struct SyncWorker {
    store: Arc<dyn Datastore>,
    requests: Receiver<SyncRequest>,
    responses: Sender<SyncResponse>,
    stop: Receiver<()>,
}

impl SyncWorker {
    fn run(self) {
        debug!("sync worker started");

        loop {
            crossbeam::select! {
                recv(self.requests) -> msg => {
                    let Ok(req) = msg else { break };
                    let resp = exchange_or_failed(self.store.as_ref(), &req);

                    // Delivery must stay interruptible, or stopping could
                    // deadlock on a response nobody consumes.
                    crossbeam::select! {
                        send(self.responses, resp) -> res => {
                            if res.is_err() {
                                break;
                            }
                        }
                        recv(self.stop) -> _ => break,
                    }
                }
                recv(self.stop) -> _ => break,
            }
        }

        debug!("sync worker exited");
    }
}

/// Shared between the synchronizer and its stop actions.
struct WorkerControl {
    // Dropping the sender is the stop signal.
    stop: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerControl {
    fn shutdown(&self) {
        drop(self.stop.lock().take());

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("sync worker panicked");
            }
        }
    }
}

/// Synchronizes on a dedicated worker thread; [`Synchronizer::sync`] never
/// blocks.
///
/// At most one exchange is outstanding. Since an exchange is always slower
/// than a call to `sync`, at least two calls are needed before the window
/// sees the result of one round trip.
pub struct NonblockingSynchronizer {
    helper: SyncHelper,
    requests: Sender<SyncRequest>,
    responses: Receiver<SyncResponse>,
    worker: Option<SyncWorker>,
    control: Arc<WorkerControl>,
}

impl NonblockingSynchronizer {
    pub fn new(store: Arc<dyn Datastore>, sync_interval: Duration) -> Self {
        let (request_tx, request_rx) = bounded(1);
        let (response_tx, response_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded(0);

        Self {
            helper: SyncHelper::new(sync_interval),
            requests: request_tx,
            responses: response_rx,
            worker: Some(SyncWorker {
                store,
                requests: request_rx,
                responses: response_tx,
                stop: stop_rx,
            }),
            control: Arc::new(WorkerControl {
                stop: Mutex::new(Some(stop_tx)),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Whether an exchange has been dispatched and not yet collected.
    pub fn in_progress(&self) -> bool {
        self.helper.in_progress()
    }
}

impl Synchronizer for NonblockingSynchronizer {
    fn start(&mut self) -> LimiterResult<()> {
        if self.control.stop.lock().is_none() {
            return Err(LimiterError::Internal(
                "sync worker has already been stopped".to_string(),
            ));
        }

        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        let handle = thread::Builder::new()
            .name("slidingwindow-sync".to_string())
            .spawn(move || worker.run())
            .map_err(|e| LimiterError::Internal(format!("Failed to spawn sync worker: {}", e)))?;

        *self.control.handle.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.control.shutdown();
    }

    fn stop_fn(&self) -> StopFn {
        let control = self.control.clone();
        Box::new(move || control.shutdown())
    }

    fn sync<F>(&mut self, now: SystemTime, make_request: F) -> Option<SyncResponse>
    where
        F: FnOnce() -> SyncRequest,
    {
        if self.helper.is_time_up(now) {
            match self.requests.try_send(make_request()) {
                Ok(()) => self.helper.begin(now),
                Err(TrySendError::Full(_)) => {
                    trace!("sync worker busy, skipping this round");
                }
                Err(TrySendError::Disconnected(_)) => {
                    trace!("sync worker stopped, skipping this round");
                }
            }
        }

        if !self.helper.in_progress() {
            return None;
        }

        match self.responses.try_recv() {
            Ok(resp) => {
                self.helper.end();
                Some(resp)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                // The worker is gone; stop waiting on it.
                self.helper.end();
                None
            }
        }
    }
}

impl Drop for NonblockingSynchronizer {
    fn drop(&mut self) {
        self.control.shutdown();
    }
}
