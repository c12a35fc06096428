//! Synthetic workload exercising every runtime component

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use conduit::fanout::{fan_in, fan_out};
use conduit::pipeline::Pipeline;
use conduit::worker::{GuardedPool, Task, TaskContext};
use conduit::{CancelSignal, RuntimeConfig, RuntimeError, TaskError};
use futures::{stream, StreamExt};
use rand::Rng;

/// Outcome counters of one workload run
#[derive(Debug, Default)]
pub struct Summary {
    pub succeeded: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub pipeline_items: usize,
    pub pipeline_errors: usize,
    pub fan_in_total: u64,
}

pub async fn run(
    config: &RuntimeConfig,
    pool: &GuardedPool,
    signal: &CancelSignal,
    tasks: u64,
) -> Result<Summary> {
    let mut summary = Summary::default();

    submit_tasks(pool, tasks, &mut summary).await?;
    run_pipeline(config, signal, tasks, &mut summary).await?;
    summary.fan_in_total = aggregate(config, signal, tasks).await?;

    Ok(summary)
}

/// Simulated downstream call: variable latency, occasional transient failure
async fn simulated_call(n: u64, ctx: TaskContext) -> Result<u64, TaskError> {
    let (latency, fails) = {
        let mut rng = rand::thread_rng();
        (rng.gen_range(1..20), rng.gen_bool(0.1))
    };

    tokio::select! {
        _ = ctx.cancelled() => return Err(TaskError::cancelled()),
        _ = tokio::time::sleep(Duration::from_millis(latency)) => {}
    }

    if fails {
        tracing::debug!(task_id = %ctx.task_id(), attempt = ctx.attempt(), "Simulated failure");
        return Err(TaskError::retryable(format!("transient failure on item {n}")));
    }
    Ok(n * 2)
}

async fn submit_tasks(pool: &GuardedPool, tasks: u64, summary: &mut Summary) -> Result<()> {
    let mut handles = Vec::with_capacity(tasks as usize);
    for n in 0..tasks {
        match pool.submit(Task::new(n, simulated_call)).await {
            Ok(handle) => handles.push(handle),
            Err(RuntimeError::RateLimited) => summary.rate_limited += 1,
            Err(RuntimeError::Cancelled) => break,
            Err(e) => return Err(e).context("task submission failed"),
        }
    }
    tracing::info!(
        submitted = handles.len(),
        rate_limited = summary.rate_limited,
        "Tasks submitted"
    );

    for handle in handles {
        match handle.wait().await {
            Ok(_) => summary.succeeded += 1,
            Err(e) => {
                tracing::debug!(error = %e, "Task did not succeed");
                summary.failed += 1;
            }
        }
    }
    Ok(())
}

/// Two stages: reject multiples of seven, then square
async fn run_pipeline(
    config: &RuntimeConfig,
    signal: &CancelSignal,
    items: u64,
    summary: &mut Summary,
) -> Result<()> {
    let mut pipeline = Pipeline::with_parent("demo-pipeline", config.pipeline.clone(), signal);
    pipeline.add_sync_stage("validate", 2, config.stage_buffer, |n: u64| {
        if n % 7 == 0 {
            Err(TaskError::non_retryable(format!("{n} is a multiple of seven")))
        } else {
            Ok(n)
        }
    })?;
    pipeline.add_stage("square", 2, config.stage_buffer, |n: u64| async move {
        tokio::task::yield_now().await;
        Ok::<_, TaskError>(n * n)
    })?;

    let pipeline = Arc::new(pipeline);
    pipeline.start()?;
    let output = pipeline.output().context("pipeline output already taken")?;
    let errors = pipeline.errors().context("pipeline errors already taken")?;

    let producer = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            for n in 1..=items {
                pipeline.input(n).await?;
            }
            pipeline.close_input();
            Ok::<_, RuntimeError>(())
        })
    };

    summary.pipeline_items = output.count().await;
    summary.pipeline_errors = errors.count().await;
    producer
        .await
        .context("pipeline producer panicked")?
        .context("pipeline input failed")?;
    pipeline.stop().await?;

    tracing::info!(
        items = summary.pipeline_items,
        errors = summary.pipeline_errors,
        dropped = pipeline.errors_dropped(),
        "Pipeline finished"
    );
    Ok(())
}

/// Square every item across branches, then sum in batches
async fn aggregate(config: &RuntimeConfig, signal: &CancelSignal, items: u64) -> Result<u64> {
    let branches = fan_out(
        stream::iter(1..=items),
        config.fan_out.clone(),
        signal,
        |n| async move { n * n },
    )?;
    let sums = fan_in(branches, config.fan_in.clone(), signal, |batch: Vec<u64>| {
        batch.into_iter().sum::<u64>()
    })?;

    let total = sums.fold(0u64, |acc, s| async move { acc + s }).await;
    tracing::info!(total, "Fan-in aggregation finished");
    Ok(total)
}
