//! The upstream API request queue.
//!
//! One background worker dispatches requests strictly in FIFO order with a
//! minimum wall-clock gap between dispatch starts, and identical concurrent
//! submissions collapse into a single upstream call whose result every
//! submitter shares. Callers interact only through [`RequestQueue`]: the
//! FIFO, the in-flight index, the counters, and the last-dispatch timestamp
//! are all owned by the queue instance.

mod inflight;
mod metrics;
mod request;
mod worker;

pub use metrics::MetricsSnapshot;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::key::RequestKey;

use inflight::{InFlightIndex, Registration};
use metrics::{Counters, Instruments};
use request::{Call, ErasedValue, QueuedRequest, SlotReceiver};
use worker::Worker;

/// Serializes and deduplicates calls to the upstream weather API.
///
/// Cheap to clone; clones share the same worker, counters, and in-flight
/// index. Construct one per upstream API and hand clones to whichever
/// components submit calls — there is no global instance.
#[derive(Clone)]
pub struct RequestQueue {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    config: QueueConfig,
    running: AtomicBool,
    in_flight: InFlightIndex,
    counters: Counters,
    instruments: Instruments,
    /// Signalled by the worker each time a request finishes; shutdown's
    /// drain loop waits on it.
    drained: Notify,
    state: Mutex<State>,
}

/// Lifecycle state behind a lock. Touched only by start/shutdown and the
/// non-suspending front of the submission path.
#[derive(Default)]
struct State {
    submit_tx: Option<mpsc::Sender<QueuedRequest>>,
    worker: Option<JoinHandle<()>>,
    /// Runtime the queue was started from, kept so foreign threads can
    /// marshal submissions into it.
    runtime: Option<Handle>,
}

impl RequestQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                running: AtomicBool::new(false),
                in_flight: InFlightIndex::new(),
                counters: Counters::default(),
                instruments: Instruments::new(),
                drained: Notify::new(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Spawn the background worker. Idempotent: calling `start` on a running
    /// queue is a logged no-op, not an error.
    ///
    /// Must be called from within a tokio runtime; the runtime handle is
    /// captured so that [`enqueue_threadsafe`](Self::enqueue_threadsafe) can
    /// submit into it from foreign threads later.
    pub fn start(&self) -> Result<()> {
        let mut state = self.shared.state();
        if self.shared.running.load(Ordering::SeqCst) {
            debug!("request queue already running, start() ignored");
            return Ok(());
        }

        let runtime = Handle::try_current().map_err(|_| QueueError::NoRuntime)?;
        let (tx, rx) = mpsc::channel(self.shared.config.submit_channel_capacity);
        let worker = Worker::new(&self.shared, rx);

        state.worker = Some(runtime.spawn(worker.run()));
        state.submit_tx = Some(tx);
        state.runtime = Some(runtime);
        self.shared.running.store(true, Ordering::SeqCst);

        info!(
            rate_limit_seconds = self.shared.config.rate_limit_seconds,
            "request queue started"
        );
        Ok(())
    }

    /// Submit an async call. Resolves when the request — or the identical
    /// in-flight request it deduplicated into — completes, and returns the
    /// shared result. Upstream failures arrive as [`QueueError::Upstream`]
    /// with the original error intact, identical for every waiter.
    ///
    /// Fails fast with [`QueueError::NotRunning`] if the queue has not been
    /// started. If an identical request is already queued or executing, `f`
    /// is never invoked.
    pub async fn enqueue<F, Fut, T>(&self, key: RequestKey, f: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + Sync + 'static,
    {
        let call = Call::Async(
            async move { f().await.map(|value| Arc::new(value) as ErasedValue) }.boxed(),
        );
        let waiter = self.submit(key, call).await?;
        Self::resolve(waiter).await
    }

    /// Submit a plain blocking call. Same contract as
    /// [`enqueue`](Self::enqueue); the closure runs on the blocking pool so
    /// a slow upstream cannot distort the worker's dispatch timing.
    pub async fn enqueue_blocking<F, T>(&self, key: RequestKey, f: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + Sync + 'static,
    {
        let call = Call::Blocking(Box::new(move || {
            f().map(|value| Arc::new(value) as ErasedValue)
        }));
        let waiter = self.submit(key, call).await?;
        Self::resolve(waiter).await
    }

    /// Submit from a thread outside the queue's runtime and block until the
    /// result arrives or `wait_timeout` elapses.
    ///
    /// The timeout is mandatory so an unresponsive runtime cannot hang the
    /// submitting thread forever. On timeout only this caller's wait is
    /// abandoned — the request itself keeps running for any other waiters.
    /// Calling this from inside the queue's runtime deadlocks the caller; it
    /// is for foreign threads (e.g. a thread-based job scheduler) only.
    pub fn enqueue_threadsafe<F, Fut, T>(
        &self,
        key: RequestKey,
        f: F,
        wait_timeout: Duration,
    ) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + Sync + 'static,
    {
        let runtime = {
            let state = self.shared.state();
            if !self.shared.running.load(Ordering::SeqCst) {
                return Err(QueueError::NotRunning);
            }
            state.runtime.clone().ok_or(QueueError::NotRunning)?
        };

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let queue = self.clone();
        let operation = key.operation().to_string();
        runtime.spawn(async move {
            let result = queue.enqueue(key, f).await;
            // A dropped receiver means the submitting thread already gave up.
            let _ = reply_tx.send(result);
        });

        match reply_rx.recv_timeout(wait_timeout) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                warn!(
                    %operation,
                    timeout_ms = wait_timeout.as_millis() as u64,
                    "cross-thread wait timed out; request continues for other waiters"
                );
                Err(QueueError::WaitTimeout(wait_timeout))
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(QueueError::ShutDown),
        }
    }

    /// Stop accepting submissions, wait up to `timeout` for queued and
    /// executing requests to drain, then stop the worker. Safe to call on a
    /// queue that is not running.
    ///
    /// Requests still outstanding when the timeout expires are logged and
    /// their waiters resolved with [`QueueError::ShutDown`] rather than left
    /// hanging.
    pub async fn shutdown(&self, timeout: Duration) {
        let worker = {
            let mut state = self.shared.state();
            if !self.shared.running.swap(false, Ordering::SeqCst) {
                debug!("shutdown called on a queue that is not running");
                return;
            }
            // Dropping the sender closes the FIFO: the worker drains what is
            // already buffered, then exits on its own.
            state.submit_tx = None;
            state.runtime = None;
            state.worker.take()
        };

        info!("request queue shutting down, draining outstanding requests");

        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.counters.outstanding() == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    outstanding = self.shared.counters.outstanding(),
                    "drain timed out, stopping the worker anyway"
                );
                break;
            }
            let notified = self.shared.drained.notified();
            if self.shared.counters.outstanding() == 0 {
                break;
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }

        if let Some(worker) = worker {
            // No-op if the worker already exited after draining.
            worker.abort();
            let _ = worker.await;
        }

        let abandoned = self.shared.in_flight.drain_with_shutdown();
        if abandoned > 0 {
            warn!(abandoned, "resolved unfinished result slots with a shutdown error");
        }
        self.shared.counters.reset_in_progress();
        self.shared.instruments.set_depth(0);

        info!("request queue stopped");
    }

    /// Point-in-time metrics. Safe to call concurrently with the worker.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.counters.snapshot(self.is_running())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Fail fast, compute the dedup registration, and hand a fresh request
    /// to the worker. Returns the receiver half of the result slot.
    async fn submit(&self, key: RequestKey, call: Call) -> Result<SlotReceiver> {
        let submit_tx = {
            let state = self.shared.state();
            if !self.shared.running.load(Ordering::SeqCst) {
                return Err(QueueError::NotRunning);
            }
            state.submit_tx.clone().ok_or(QueueError::NotRunning)?
        };

        match self.shared.in_flight.register(&key) {
            Registration::Joined(waiter) => {
                self.shared.counters.record_deduplicated();
                self.shared.instruments.record_deduplicated(key.operation());
                debug!(key = %key, "joined identical in-flight request");
                Ok(waiter)
            }
            Registration::New { slot, waiter } => {
                let depth = self.shared.counters.record_submitted();
                self.shared
                    .instruments
                    .record_submitted(key.operation(), depth);
                let queued = QueuedRequest {
                    key,
                    call,
                    enqueued_at: Instant::now(),
                    slot,
                };
                if let Err(send_err) = submit_tx.send(queued).await {
                    // Worker already gone (shutdown raced us): roll back.
                    let queued = send_err.0;
                    self.shared.in_flight.remove(&queued.key);
                    self.shared.counters.record_submit_rollback();
                    return Err(QueueError::ShutDown);
                }
                Ok(waiter)
            }
        }
    }

    async fn resolve<T>(mut waiter: SlotReceiver) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        match waiter.recv().await {
            Ok(Ok(value)) => value
                .downcast::<T>()
                .map_err(|_| QueueError::TypeMismatch(std::any::type_name::<T>())),
            Ok(Err(err)) => Err(err),
            // Slot dropped without resolving — forced shutdown.
            Err(_) => Err(QueueError::ShutDown),
        }
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        // Poisoning here would mean a panic inside start/shutdown's own
        // bookkeeping; the state is still usable.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last handle dropped without an explicit shutdown: stop the worker
        // so it does not linger on the runtime.
        if let Some(worker) = self.state().worker.take() {
            worker.abort();
        }
    }
}
