use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::QueueError;

use super::request::{Call, Outcome, QueuedRequest};
use super::Shared;

/// The queue's single background task: pulls requests in strict FIFO order,
/// enforces the minimum dispatch gap, executes each call, and resolves its
/// result slot. A failing (or panicking) call never terminates the loop.
pub(super) struct Worker {
    /// Weak so the worker does not keep the queue alive after the last
    /// handle is dropped.
    shared: Weak<Shared>,
    rx: mpsc::Receiver<QueuedRequest>,
    rate_limit: Duration,
    idle_timeout: Duration,
    last_dispatch: Option<Instant>,
}

impl Worker {
    pub(super) fn new(shared: &Arc<Shared>, rx: mpsc::Receiver<QueuedRequest>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            rx,
            rate_limit: shared.config.rate_limit(),
            idle_timeout: shared.config.idle_timeout(),
            last_dispatch: None,
        }
    }

    pub(super) async fn run(mut self) {
        info!("request queue worker started");
        loop {
            let request = match timeout(self.idle_timeout, self.rx.recv()).await {
                Ok(Some(request)) => request,
                Ok(None) => {
                    // Shutdown dropped the last sender and the buffered
                    // requests are drained.
                    info!("submit channel closed, worker exiting");
                    break;
                }
                Err(_) => {
                    // Idle. Shutdown is signalled by closing the channel, so
                    // the only liveness check needed here is whether the
                    // queue itself still exists.
                    if self.shared.upgrade().is_none() {
                        break;
                    }
                    continue;
                }
            };

            let Some(shared) = self.shared.upgrade() else {
                break;
            };
            let depth = shared.counters.record_pulled();
            shared.instruments.set_depth(depth);

            self.pace(&request.key).await;
            self.dispatch(&shared, request).await;
        }
        info!("request queue worker stopped");
    }

    /// Sleep out whatever remains of the minimum gap since the previous
    /// dispatch. The new dispatch time is recorded at the start of dispatch,
    /// not at completion, so a slow call does not widen later gaps.
    async fn pace(&mut self, key: &crate::key::RequestKey) {
        if let Some(last) = self.last_dispatch {
            let since_last = last.elapsed();
            if since_last < self.rate_limit {
                let wait = self.rate_limit - since_last;
                debug!(
                    key = %key,
                    wait_ms = wait.as_millis() as u64,
                    "rate limit gap, sleeping before dispatch"
                );
                tokio::time::sleep(wait).await;
            }
        }
        self.last_dispatch = Some(Instant::now());
    }

    async fn dispatch(&mut self, shared: &Shared, request: QueuedRequest) {
        let QueuedRequest {
            key,
            call,
            enqueued_at,
            slot,
        } = request;
        let dispatched_at = Instant::now();

        let result = match call {
            Call::Async(fut) => match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("request panicked during dispatch")),
            },
            Call::Blocking(f) => match tokio::task::spawn_blocking(f).await {
                Ok(result) => result,
                Err(join_err) => Err(anyhow::anyhow!("blocking request panicked: {join_err}")),
            },
        };

        // Remove from the in-flight index before broadcasting, so a new
        // submission with the same key registers fresh instead of joining a
        // slot that already resolved.
        shared.in_flight.remove(&key);

        let outcome: Outcome = match result {
            Ok(value) => {
                let waited = dispatched_at.saturating_duration_since(enqueued_at);
                shared.counters.record_completed(waited);
                shared.instruments.record_completed(key.operation());
                debug!(key = %key, wait_ms = waited.as_millis() as u64, "request completed");
                Ok(value)
            }
            Err(err) => {
                shared.counters.record_failed();
                shared.instruments.record_failed(key.operation());
                warn!(key = %key, error = %err, "request failed");
                Err(QueueError::Upstream(Arc::new(err)))
            }
        };

        // A send error only means every waiter gave up; not a problem.
        let _ = slot.send(outcome);

        shared.counters.finish_one();
        shared.drained.notify_waiters();
    }
}
