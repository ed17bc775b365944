use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use opentelemetry::metrics::{Counter, Gauge};
use opentelemetry::KeyValue;

/// Point-in-time view of queue activity, returned by
/// [`RequestQueue::metrics`](super::RequestQueue::metrics).
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// Unique requests accepted (deduplicated joiners not included).
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    /// Submissions that attached to an existing in-flight request.
    pub deduplicated_requests: u64,
    /// Mean time between enqueue and dispatch across completed requests.
    pub average_wait: Duration,
    pub peak_queue_depth: u64,
    /// Requests currently sitting in the FIFO, not yet dispatched.
    pub queue_depth: u64,
    pub running: bool,
}

/// Counter storage shared between the submission path and the worker.
/// Plain atomics, so reading a snapshot never contends with dispatch.
#[derive(Default)]
pub(crate) struct Counters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    deduplicated: AtomicU64,
    cumulative_wait_us: AtomicU64,
    peak_depth: AtomicU64,
    depth: AtomicU64,
    /// Queued plus executing. Drives shutdown's drain, not the snapshot.
    outstanding: AtomicU64,
}

impl Counters {
    /// Account for a freshly registered request. Returns the new FIFO depth.
    pub(crate) fn record_submitted(&self) -> u64 {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);
        depth
    }

    /// Undo [`record_submitted`](Self::record_submitted) when the handoff to
    /// the worker failed and the registration was rolled back.
    pub(crate) fn record_submit_rollback(&self) {
        self.total.fetch_sub(1, Ordering::Relaxed);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deduplicated(&self) {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    /// The worker pulled a request off the FIFO. Returns the new depth.
    pub(crate) fn record_pulled(&self) -> u64 {
        self.depth.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub(crate) fn record_completed(&self, waited: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.cumulative_wait_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A request finished (either way) and is no longer outstanding.
    pub(crate) fn finish_one(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Clear the in-progress counts after a forced shutdown abandoned what
    /// was left. Cumulative counters are preserved.
    pub(crate) fn reset_in_progress(&self) {
        self.depth.store(0, Ordering::Relaxed);
        self.outstanding.store(0, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self, running: bool) -> MetricsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let cumulative_us = self.cumulative_wait_us.load(Ordering::Relaxed);
        let average_wait = if completed == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(cumulative_us / completed)
        };
        MetricsSnapshot {
            total_requests: self.total.load(Ordering::Relaxed),
            completed_requests: completed,
            failed_requests: self.failed.load(Ordering::Relaxed),
            deduplicated_requests: self.deduplicated.load(Ordering::Relaxed),
            average_wait,
            peak_queue_depth: self.peak_depth.load(Ordering::Relaxed),
            queue_depth: self.depth.load(Ordering::Relaxed),
            running,
        }
    }
}

/// OTel instruments recorded alongside the atomic counters. No-op unless a
/// meter provider is installed.
pub(crate) struct Instruments {
    requests_submitted: Counter<u64>,
    requests_completed: Counter<u64>,
    requests_failed: Counter<u64>,
    requests_deduplicated: Counter<u64>,
    queue_depth: Gauge<u64>,
}

impl Instruments {
    pub(crate) fn new() -> Self {
        let meter = opentelemetry::global::meter("nimbus");
        Self {
            requests_submitted: meter
                .u64_counter("nimbus.requests.submitted")
                .with_description("Unique requests accepted by the queue")
                .build(),
            requests_completed: meter
                .u64_counter("nimbus.requests.completed")
                .with_description("Requests that resolved successfully")
                .build(),
            requests_failed: meter
                .u64_counter("nimbus.requests.failed")
                .with_description("Requests whose upstream call failed")
                .build(),
            requests_deduplicated: meter
                .u64_counter("nimbus.requests.deduplicated")
                .with_description("Submissions that joined an in-flight request")
                .build(),
            queue_depth: meter
                .u64_gauge("nimbus.queue.depth")
                .with_description("Requests waiting for dispatch")
                .build(),
        }
    }

    pub(crate) fn record_submitted(&self, operation: &str, depth: u64) {
        self.requests_submitted
            .add(1, &[KeyValue::new("operation", operation.to_string())]);
        self.queue_depth.record(depth, &[]);
    }

    pub(crate) fn record_deduplicated(&self, operation: &str) {
        self.requests_deduplicated
            .add(1, &[KeyValue::new("operation", operation.to_string())]);
    }

    pub(crate) fn record_completed(&self, operation: &str) {
        self.requests_completed
            .add(1, &[KeyValue::new("operation", operation.to_string())]);
    }

    pub(crate) fn record_failed(&self, operation: &str) {
        self.requests_failed
            .add(1, &[KeyValue::new("operation", operation.to_string())]);
    }

    pub(crate) fn set_depth(&self, depth: u64) {
        self.queue_depth.record(depth, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_wait_is_zero_with_no_completions() {
        let counters = Counters::default();
        counters.record_submitted();
        let snapshot = counters.snapshot(true);
        assert_eq!(snapshot.average_wait, Duration::ZERO);
        assert_eq!(snapshot.total_requests, 1);
    }

    #[test]
    fn average_wait_divides_cumulative_by_completed() {
        let counters = Counters::default();
        for _ in 0..2 {
            counters.record_submitted();
            counters.record_pulled();
        }
        counters.record_completed(Duration::from_millis(100));
        counters.record_completed(Duration::from_millis(300));

        let snapshot = counters.snapshot(true);
        assert_eq!(snapshot.average_wait, Duration::from_millis(200));
    }

    #[test]
    fn peak_depth_tracks_high_water_mark() {
        let counters = Counters::default();
        counters.record_submitted();
        counters.record_submitted();
        counters.record_submitted();
        counters.record_pulled();
        counters.record_pulled();

        let snapshot = counters.snapshot(true);
        assert_eq!(snapshot.peak_queue_depth, 3);
        assert_eq!(snapshot.queue_depth, 1);
    }

    #[test]
    fn rollback_restores_counts() {
        let counters = Counters::default();
        counters.record_submitted();
        counters.record_submit_rollback();

        let snapshot = counters.snapshot(false);
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.queue_depth, 0);
        assert_eq!(counters.outstanding(), 0);
    }
}
