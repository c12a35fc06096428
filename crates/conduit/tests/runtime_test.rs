//! End-to-end behavior of the runtime components working together

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conduit::prelude::*;
use conduit::worker::WorkerPoolStatus;
use futures::StreamExt;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};

#[test_log::test(tokio::test)]
async fn test_every_submitted_task_completes() {
    let pool = WorkerPool::new(WorkerPoolConfig::new(4).with_queue_capacity(8));
    pool.start().unwrap();

    let mut handles = Vec::new();
    for n in 0..100u64 {
        let handle = pool
            .submit(Task::new(n, |n: u64, _ctx| async move {
                tokio::task::yield_now().await;
                Ok::<_, TaskError>(n + 1)
            }))
            .await
            .unwrap();
        handles.push(handle);
    }

    let mut total = 0;
    for handle in handles {
        total += handle.wait().await.unwrap();
    }
    assert_eq!(total, (1..=100).sum::<u64>());

    let stats = pool.stats();
    assert_eq!(stats.submitted, 100);
    assert_eq!(stats.processed, 100);
    assert_eq!(stats.failed, 0);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrency_never_exceeds_worker_count() {
    let pool = WorkerPool::new(WorkerPoolConfig::new(3));
    pool.start().unwrap();

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for n in 0..30u32 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let task = Task::new(n, move |n: u32, _ctx| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, TaskError>(n)
            }
        });
        handles.push(pool.submit(task).await.unwrap());
    }

    for handle in handles {
        handle.wait().await.unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 1);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_pipeline_preserves_order_with_single_workers() {
    let mut pipeline = Pipeline::new("ordered", PipelineConfig::default());
    pipeline
        .add_sync_stage("double", 1, 4, |n: i64| Ok(n * 2))
        .unwrap();
    pipeline
        .add_sync_stage("increment", 1, 4, |n: i64| Ok(n + 1))
        .unwrap();
    pipeline.start().unwrap();

    let output = pipeline.output().unwrap();
    for n in 1..=3 {
        pipeline.input(n).await.unwrap();
    }
    pipeline.close_input();

    let results: Vec<i64> = output.collect().await;
    assert_eq!(results, vec![3, 5, 7]);

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_fan_out_fan_in_preserves_item_count() {
    let signal = CancelSignal::never();
    let branches = fan_out(
        futures::stream::iter(0..47u32),
        FanOutConfig::new(3),
        &signal,
        |n| async move { n },
    )
    .unwrap();

    let batches: Vec<Vec<u32>> = fan_in(branches, FanInConfig::new(5), &signal, |batch| batch)
        .unwrap()
        .collect()
        .await;

    assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= 5));
    let mut items: Vec<u32> = batches.into_iter().flatten().collect();
    items.sort_unstable();
    assert_eq!(items, (0..47).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_stop_is_idempotent_and_rejects_later_work() {
    let pool = WorkerPool::new(WorkerPoolConfig::new(2));
    pool.start().unwrap();

    assert_ok!(pool.stop().await);
    assert_ok!(pool.stop().await);
    assert_eq!(pool.status(), WorkerPoolStatus::Stopped);

    let result = pool
        .submit(Task::new((), |_: (), _ctx| async { Ok::<_, TaskError>(()) }))
        .await;
    assert!(matches!(result, Err(RuntimeError::Cancelled)));
}

#[tokio::test]
async fn test_root_cancel_reaches_every_component() {
    let root = LifecycleController::named("root");

    let pool = WorkerPool::with_parent(WorkerPoolConfig::new(1), &root.signal());
    pool.start().unwrap();

    let mut pipeline = Pipeline::with_parent("child", PipelineConfig::default(), &root.signal());
    pipeline
        .add_sync_stage("identity", 1, 1, |n: u32| Ok(n))
        .unwrap();
    pipeline.start().unwrap();

    let started = Arc::new(Notify::new());
    let notify = Arc::clone(&started);
    let blocked = pool
        .submit(Task::new((), move |_: (), ctx: TaskContext| {
            let notify = Arc::clone(&notify);
            async move {
                notify.notify_one();
                ctx.cancelled().await;
                Err::<(), _>(TaskError::cancelled())
            }
        }))
        .await
        .unwrap();

    started.notified().await;
    root.cancel();

    let err = assert_err!(blocked.wait().await);
    assert!(matches!(err, RuntimeError::TaskFailed { .. } | RuntimeError::Cancelled));

    let result = pool
        .submit(Task::new((), |_: (), _ctx| async { Ok::<_, TaskError>(()) }))
        .await;
    assert!(matches!(result, Err(RuntimeError::Cancelled)));
    assert!(pipeline.signal().is_cancelled());

    pool.stop().await.unwrap();
    pipeline.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_guarded_pool_limits_and_breaks() {
    let pool = Arc::new(WorkerPool::new(
        WorkerPoolConfig::new(2)
            .with_max_retries(0)
            .with_retry_policy(RetryPolicy::immediate()),
    ));
    pool.start().unwrap();

    let breaker = Arc::new(CircuitBreaker::new(
        "downstream",
        CircuitBreakerConfig::new().with_failure_threshold(1),
    ));
    let admission: Arc<dyn Admission> = Arc::new(TokenBucket::new(
        TokenBucketConfig::per_second(1, 1).with_refill(1, Duration::from_secs(3600)),
    ));
    let guarded = GuardedPool::new(Arc::clone(&pool))
        .with_admission(admission)
        .with_circuit_breaker(Arc::clone(&breaker));

    let failing = guarded
        .submit(Task::new((), |_: (), _ctx| async {
            Err::<(), _>(TaskError::retryable("downstream unavailable"))
        }))
        .await
        .unwrap();
    assert_err!(failing.wait().await);
    assert_eq!(breaker.state(), CircuitState::Open);

    let limited = guarded
        .submit(Task::new((), |_: (), _ctx| async { Ok::<_, TaskError>(()) }))
        .await;
    assert!(matches!(limited, Err(RuntimeError::RateLimited)));

    pool.stop().await.unwrap();
}
