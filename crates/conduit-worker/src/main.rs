use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use conduit::reliability::CircuitBreaker;
use conduit::worker::{GuardedPool, LoadMonitor, LoadMonitorConfig, ResizablePool, WorkerPool};
use conduit::{LifecycleController, RuntimeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod workload;

/// Tasks submitted when `CONDUIT_DEMO_TASKS` is unset
const DEFAULT_DEMO_TASKS: u64 = 200;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit_worker=debug,conduit=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("conduit-worker starting...");

    let config = RuntimeConfig::from_env();
    config
        .validate()
        .context("invalid CONDUIT_* configuration")?;
    let tasks = std::env::var("CONDUIT_DEMO_TASKS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_DEMO_TASKS);
    tracing::info!(
        workers = config.pool.workers,
        queue_capacity = config.pool.queue_capacity,
        admission = config.admission.strategy(),
        tasks,
        "Runtime configured"
    );

    let root = LifecycleController::named("conduit-worker");
    let pool = Arc::new(WorkerPool::with_parent(
        config.pool.clone().with_name("demo-pool"),
        &root.signal(),
    ));
    pool.start().context("failed to start worker pool")?;

    let resizable = Arc::new(
        ResizablePool::new(
            Arc::clone(&pool),
            config.pool.workers,
            config.pool.workers * 2,
        )
        .context("invalid pool bounds")?,
    );
    LoadMonitor::new(resizable, LoadMonitorConfig::default()).spawn(pool.signal());

    let guarded = GuardedPool::new(Arc::clone(&pool))
        .with_admission(config.admission.build())
        .with_admission_timeout(Duration::from_secs(1))
        .with_circuit_breaker(Arc::new(CircuitBreaker::new(
            "demo-downstream",
            config.circuit_breaker.clone(),
        )));

    let root_signal = root.signal();
    tokio::select! {
        summary = workload::run(&config, &guarded, &root_signal, tasks) => {
            let summary = summary.context("workload failed")?;
            tracing::info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                rate_limited = summary.rate_limited,
                pipeline_items = summary.pipeline_items,
                pipeline_errors = summary.pipeline_errors,
                fan_in_total = summary.fan_in_total,
                "Workload complete"
            );
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            tracing::info!("Shutdown signal received");
        }
    }

    if let Err(e) = pool.stop().await {
        tracing::warn!(error = %e, "Worker pool did not drain cleanly");
    }

    let stats = pool.stats();
    tracing::info!(
        submitted = stats.submitted,
        processed = stats.processed,
        failed = stats.failed,
        retried = stats.retried,
        cancelled = stats.cancelled,
        timed_out_attempts = stats.timed_out_attempts,
        p50_ms = stats.latency.p50.as_millis() as u64,
        p99_ms = stats.latency.p99.as_millis() as u64,
        "Final pool stats"
    );

    if !root.shutdown(config.pool.shutdown_timeout).await {
        tracing::warn!("Abandoned in-flight work at shutdown");
    }
    tracing::info!("Worker shutdown complete");
    Ok(())
}
