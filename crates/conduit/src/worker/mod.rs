//! Worker pool for task execution
//!
//! This module provides:
//! - [`WorkerPool`] - fixed set of workers draining a bounded queue
//! - [`Task`] / [`TaskHandle`] - a unit of work and the submitter's view of it
//! - [`BackpressureConfig`] - busy-worker watermarks with hysteresis
//! - [`ResizablePool`] / [`LoadMonitor`] - optional dynamic sizing
//! - [`GuardedPool`] - admission control and circuit breaking in front of a pool
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                            │
//! │                                                             │
//! │  submit ──▶ ┌──────────────────────────┐                    │
//! │             │  bounded queue (mpsc)    │  full ⇒ block,     │
//! │             └────────────┬─────────────┘  QueueFull or      │
//! │                          │                QueueTimeout      │
//! │                          ▼                                  │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │  worker loops (one child signal each)               │    │
//! │  │  [W0] [W1] [W2] ... [Wn]                            │    │
//! │  │   attempt ─ timeout ─ retry policy ─ attempt ...    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │                          │                                  │
//! │                          ▼                                  │
//! │        PoolStats  +  BackpressureState (load ratio)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stopping the pool cancels its signal: idle workers exit, running handlers
//! observe the signal through [`TaskContext`], queued tasks resolve as
//! [`RuntimeError::Cancelled`](crate::RuntimeError::Cancelled).

mod backpressure;
mod guarded;
mod pool;
mod resize;
mod stats;
mod task;

pub use backpressure::{BackpressureConfig, BackpressureState};
pub use guarded::GuardedPool;
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolStatus};
pub use resize::{LoadMonitor, LoadMonitorConfig, ResizablePool, ScaleDecision};
pub use stats::PoolStats;
pub use task::{Task, TaskContext, TaskHandle, TaskId};
