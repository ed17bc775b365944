//! Deduplication: identical concurrent submissions share one upstream call;
//! distinct arguments never interfere.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nimbus_core::{QueueConfig, QueueError, RequestKey, RequestQueue};
use serde_json::json;

fn fast_queue() -> RequestQueue {
    RequestQueue::new(QueueConfig {
        rate_limit_seconds: 0.005,
        ..QueueConfig::default()
    })
}

fn observations_key(station: &str) -> RequestKey {
    RequestKey::new("observations", &json!({ "station": station })).unwrap()
}

#[tokio::test]
async fn identical_concurrent_submissions_invoke_once() {
    let queue = fast_queue();
    queue.start().unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    let submit = |_: usize| {
        let invocations = Arc::clone(&invocations);
        queue.enqueue(observations_key("KSEA"), move || async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, anyhow::Error>(21.5f64)
        })
    };

    // On a current-thread runtime all five registrations happen before the
    // worker gets a chance to dispatch, so they must all coalesce.
    let (a, b, c, d, e) = tokio::join!(submit(0), submit(1), submit(2), submit(3), submit(4));
    let results = [a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap(), e.unwrap()];

    for result in &results {
        assert_eq!(**result, 21.5);
    }
    // All waiters share the very same allocation, not copies.
    assert!(Arc::ptr_eq(&results[0], &results[4]));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let metrics = queue.metrics();
    assert_eq!(metrics.total_requests, 1);
    assert_eq!(metrics.deduplicated_requests, 4);
    assert_eq!(metrics.completed_requests, 1);

    queue.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn distinct_arguments_each_execute() {
    let queue = fast_queue();
    queue.start().unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    let submit = |station: &str| {
        let invocations = Arc::clone(&invocations);
        queue.enqueue(observations_key(station), move || async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        })
    };

    let (a, b, c) = tokio::join!(submit("KSEA"), submit("KPDX"), submit("KBOI"));
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    let metrics = queue.metrics();
    assert_eq!(metrics.total_requests, 3);
    assert_eq!(metrics.deduplicated_requests, 0);

    queue.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn sequential_identical_submissions_both_execute() {
    let queue = fast_queue();
    queue.start().unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let invocations = Arc::clone(&invocations);
        queue
            .enqueue(observations_key("KSEA"), move || async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap();
    }

    // The key is released the moment the first request resolves.
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(queue.metrics().total_requests, 2);

    queue.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn failure_propagates_to_every_waiter() {
    let queue = fast_queue();
    queue.start().unwrap();

    let submit = || {
        queue.enqueue(observations_key("KSEA"), || async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Err::<(), _>(anyhow::anyhow!("station offline"))
        })
    };

    let (a, b, c) = tokio::join!(submit(), submit(), submit());
    for result in [a, b, c] {
        match result {
            Err(QueueError::Upstream(err)) => {
                assert!(err.to_string().contains("station offline"));
            }
            other => panic!("expected an upstream failure, got {other:?}"),
        }
    }

    let metrics = queue.metrics();
    assert_eq!(metrics.total_requests, 1);
    assert_eq!(metrics.failed_requests, 1);
    assert_eq!(metrics.completed_requests, 0);
    assert_eq!(metrics.deduplicated_requests, 2);

    queue.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn joiner_with_wrong_result_type_gets_type_mismatch() {
    let queue = fast_queue();
    queue.start().unwrap();

    let original = queue.enqueue(observations_key("KSEA"), || async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok::<_, anyhow::Error>(7u32)
    });
    // Same key, but this call site expects a String. The callable is never
    // invoked; the shared u32 result fails to downcast.
    let joiner = queue.enqueue(observations_key("KSEA"), || async {
        Ok::<_, anyhow::Error>("unreachable".to_string())
    });

    let (original, joiner) = tokio::join!(original, joiner);
    assert_eq!(*original.unwrap(), 7);
    assert!(matches!(joiner, Err(QueueError::TypeMismatch(_))));

    queue.shutdown(Duration::from_secs(2)).await;
}
