//! Scheduler queueing, deduplication and shutdown
//!
//! Tenet: one key, one generation call; every waiter is released exactly once.

mod common;

use common::{harness, wait_until};
use loom_core::{Job, LoomError, Priority};
use loom_decode::{GenerationError, GenerationRequest, ModelError};
use loom_test_utils::CountingBackend;
use pretty_assertions::assert_eq;
use std::time::Duration;

fn job(key: &str) -> Job {
    Job::new(GenerationRequest::new(key, "A room."), "")
}

#[tokio::test]
async fn concurrent_requests_share_one_generation() {
    let h = harness(CountingBackend::new().gated());
    h.demo().await;

    let first = tokio::spawn({
        let loom = h.loom.clone();
        async move { loom.handle(&serde_json::json!({"key": "demo-a"})).await }
    });
    let second = tokio::spawn({
        let loom = h.loom.clone();
        async move { loom.handle(&serde_json::json!({"key": "demo-a"})).await }
    });

    wait_until(|| h.backend.calls() == 1 && h.loom.stats().deduplicated == 1).await;
    h.backend.release(1);

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first["lines"], second["lines"]);
    assert_eq!(first["lines"][0], "line for demo-a");
    assert_eq!(h.backend.calls(), 1);
}

#[tokio::test]
async fn foreground_is_fifo_and_background_is_lifo() {
    let h = harness(CountingBackend::new().gated());
    let scheduler = h.loom.scheduler().clone();

    let blocker = tokio::spawn({
        let s = scheduler.clone();
        async move { s.request_generation(job("s-x"), Priority::Foreground).await }
    });
    wait_until(|| h.backend.calls() == 1).await;

    let mut waiters = Vec::new();
    for (key, priority) in [
        ("s-b1", Priority::Background),
        ("s-f1", Priority::Foreground),
        ("s-b2", Priority::Background),
        ("s-f2", Priority::Foreground),
    ] {
        let s = scheduler.clone();
        waiters.push(tokio::spawn(async move { s.request_generation(job(key), priority).await }));
    }
    wait_until(|| {
        let stats = scheduler.stats();
        stats.foreground_len == 2 && stats.background_len == 2
    })
    .await;

    h.backend.release(5);
    blocker.await.unwrap().unwrap();
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }

    assert_eq!(h.backend.keys(), vec!["s-x", "s-f1", "s-f2", "s-b2", "s-b1"]);
}

#[tokio::test]
async fn foreground_request_promotes_background_job() {
    let h = harness(CountingBackend::new().gated());
    let scheduler = h.loom.scheduler().clone();

    let blocker = tokio::spawn({
        let s = scheduler.clone();
        async move { s.request_generation(job("s-x"), Priority::Foreground).await }
    });
    wait_until(|| h.backend.calls() == 1).await;

    let mut waiters = Vec::new();
    for key in ["s-b1", "s-b2"] {
        let s = scheduler.clone();
        waiters.push(tokio::spawn(async move { s.request_generation(job(key), Priority::Background).await }));
    }
    wait_until(|| scheduler.stats().background_len == 2).await;

    let s = scheduler.clone();
    waiters.push(tokio::spawn(async move { s.request_generation(job("s-b1"), Priority::Foreground).await }));
    wait_until(|| scheduler.stats().foreground_len == 1).await;

    h.backend.release(3);
    blocker.await.unwrap().unwrap();
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }

    assert_eq!(h.backend.keys(), vec!["s-x", "s-b1", "s-b2"]);
}

#[tokio::test]
async fn stored_key_is_not_generated_again() {
    let h = harness(CountingBackend::new());
    let scheduler = h.loom.scheduler().clone();

    let first = scheduler.request_generation(job("s-a"), Priority::Foreground).await.unwrap();
    let second = scheduler.request_generation(job("s-a"), Priority::Foreground).await.unwrap();

    assert_eq!(first.text, second.text);
    assert_eq!(h.backend.calls(), 1);
}

#[tokio::test]
async fn failure_releases_waiters_and_leaves_key_unresolved() {
    let backend = CountingBackend::new()
        .replying(|_| Err(GenerationError::Model(ModelError::Inference("boom".to_string()))));
    let h = harness(backend);
    h.demo().await;

    let err = h.loom.handle(&serde_json::json!({"key": "demo-a"})).await.unwrap_err();

    assert!(matches!(&err, LoomError::GenerationFailed(msg) if msg.contains("boom")), "{err}");
    assert_eq!(h.stored("demo-a"), None);
    assert_eq!(h.loom.stats().failed, 1);
    // model errors get one more attempt
    assert_eq!(h.backend.calls(), 2);

    // the next request tries again
    let _ = h.loom.handle(&serde_json::json!({"key": "demo-a"})).await;
    assert_eq!(h.backend.calls(), 4);
}

#[tokio::test]
async fn transient_failure_is_retried_once() {
    let attempts = std::sync::atomic::AtomicUsize::new(0);
    let backend = CountingBackend::new().replying(move |request| {
        if attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
            Err(GenerationError::Panicked("first try".to_string()))
        } else {
            Ok(vec![format!("line for {}", request.key)])
        }
    });
    let h = harness(backend);
    h.demo().await;

    let reply = h.loom.handle(&serde_json::json!({"key": "demo-a"})).await.unwrap();

    assert_eq!(reply["lines"][0], "line for demo-a");
    assert_eq!(h.backend.calls(), 2);
    assert_eq!(h.loom.stats().failed, 0);
}

#[tokio::test]
async fn unavailable_worker_is_not_retried() {
    let h = harness(CountingBackend::new().replying(|_| Err(GenerationError::WorkerUnavailable)));
    h.demo().await;

    let err = h.loom.handle(&serde_json::json!({"key": "demo-a"})).await.unwrap_err();

    assert!(matches!(&err, LoomError::GenerationFailed(_)), "{err}");
    assert_eq!(h.backend.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn requests_racing_shutdown_are_all_released() {
    let h = harness(CountingBackend::new().gated());
    let scheduler = h.loom.scheduler().clone();

    let mut waiters = Vec::new();
    for i in 0..64 {
        let s = scheduler.clone();
        let priority = if i % 2 == 0 { Priority::Foreground } else { Priority::Background };
        waiters.push(tokio::spawn(async move {
            s.request_generation(job(&format!("s-{i}")), priority).await
        }));
    }
    scheduler.shutdown();

    for waiter in waiters {
        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter was left hanging")
            .unwrap();
        assert!(matches!(result, Err(LoomError::ShuttingDown)), "{result:?}");
    }
    let stats = scheduler.stats();
    assert_eq!((stats.foreground_len, stats.background_len), (0, 0));
}

#[tokio::test]
async fn shutdown_releases_blocked_callers() {
    let h = harness(CountingBackend::new().gated());
    h.demo().await;

    let waiting = tokio::spawn({
        let loom = h.loom.clone();
        async move { loom.handle(&serde_json::json!({"key": "demo-a"})).await }
    });
    wait_until(|| h.backend.calls() == 1).await;

    let bye = h.loom.handle(&serde_json::json!({"killme": "now"})).await.unwrap();
    assert_eq!(bye, "bye");
    assert!(*h.loom.stop_signal().borrow());

    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(err, LoomError::ShuttingDown), "{err}");

    let err = h.loom.handle(&serde_json::json!({"key": "demo-b"})).await.unwrap_err();
    assert!(matches!(err, LoomError::ShuttingDown), "{err}");
}

#[tokio::test]
async fn store_calls_leave_the_runtime_thread() {
    let h = harness(CountingBackend::new());
    let runtime_thread = std::thread::current().id();

    let store_thread = h
        .loom
        .scheduler()
        .with_store(|_| Ok(std::thread::current().id()))
        .await
        .unwrap();

    assert_ne!(store_thread, runtime_thread);
}
