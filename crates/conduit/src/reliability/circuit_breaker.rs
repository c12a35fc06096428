//! In-process circuit breaker

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::duration_millis;
use crate::error::{Result, RuntimeError};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold reached - all calls rejected
    Open,

    /// Reset timeout elapsed - a single trial call is in progress
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  reset timeout  ┌──────────┐
/// │ Closed  │ ──────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘ ◄────────────── └──────────┘
///      ▲                                         trial failed       │
///      │                 trial succeeded                            │
///      └────────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use conduit::reliability::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_reset_timeout(Duration::from_secs(30));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Time to wait before letting a trial call through
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the reset timeout (time before trying again after opening)
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(RuntimeError::InvalidConfig(
                "circuit failure_threshold must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Error returned by [`CircuitBreaker::call`]
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E = std::convert::Infallible> {
    /// Circuit is open, the call was not made
    #[error("circuit breaker is open")]
    Open,

    /// The wrapped call failed
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the call was rejected without being made
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// The wrapped error, if the call was made
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Open => None,
            Self::Inner(e) => Some(e),
        }
    }
}

impl<E> From<CircuitBreakerError<E>> for RuntimeError
where
    E: Into<RuntimeError>,
{
    fn from(err: CircuitBreakerError<E>) -> Self {
        match err {
            CircuitBreakerError::Open => RuntimeError::CircuitOpen,
            CircuitBreakerError::Inner(e) => e.into(),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Normal,
    Trial,
}

/// Permit for one guarded call
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). A permit dropped without a verdict counts as
/// a failure, so an abandoned or timed-out call still weighs against the
/// circuit. [`release`](Self::release) gives the permit back without one.
#[must_use = "report the call outcome through the permit"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    kind: PermitKind,
    settled: bool,
}

impl CircuitPermit<'_> {
    /// Whether this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.kind == PermitKind::Trial
    }

    /// Report the call succeeded
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.kind);
    }

    /// Report the call failed
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.kind);
    }

    /// Give the permit back without judging the downstream
    ///
    /// A released trial returns the circuit to open without refreshing the
    /// failure time, so the next call becomes the trial.
    pub fn release(mut self) {
        self.settled = true;
        self.breaker.record_release(self.kind);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_failure(self.kind);
        }
    }
}

/// Circuit breaker guarding a possibly failing downstream operation
///
/// All transitions happen under one lock, so when several callers race at
/// the reset boundary exactly one of them becomes the trial call.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Breaker name used in log output
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the circuit breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state
    ///
    /// An open circuit whose reset timeout has elapsed still reports
    /// [`CircuitState::Open`] until the next call turns it half-open.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failures recorded while closed
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Check if a call should be allowed
    ///
    /// Returns a permit that must be used to report success/failure.
    pub fn allow(&self) -> std::result::Result<CircuitPermit<'_>, CircuitBreakerError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(self.permit(PermitKind::Normal)),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| Instant::now().saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    info!(breaker = %self.name, "Circuit half-open, admitting trial call");
                    Ok(self.permit(PermitKind::Trial))
                } else {
                    Err(CircuitBreakerError::Open)
                }
            }
            // The trial is already in flight
            CircuitState::HalfOpen => Err(CircuitBreakerError::Open),
        }
    }

    /// Run `f` through the breaker
    ///
    /// When the circuit is open `f` is not invoked.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let permit = self.allow().map_err(|_| CircuitBreakerError::Open)?;
        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    /// Force the breaker back to closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        debug!(breaker = %self.name, "Circuit reset");
    }

    fn permit(&self, kind: PermitKind) -> CircuitPermit<'_> {
        CircuitPermit {
            breaker: self,
            kind,
            settled: false,
        }
    }

    fn record_success(&self, kind: PermitKind) {
        let mut inner = self.inner.lock();
        match (inner.state, kind) {
            (CircuitState::HalfOpen, PermitKind::Trial) => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                info!(breaker = %self.name, "Trial call succeeded, circuit closed");
            }
            (CircuitState::Closed, PermitKind::Normal) => {
                inner.failure_count = 0;
            }
            // Late verdicts from calls admitted before the circuit opened
            _ => {}
        }
    }

    fn record_release(&self, kind: PermitKind) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && kind == PermitKind::Trial {
            inner.state = CircuitState::Open;
            debug!(breaker = %self.name, "Trial released without a verdict");
        }
    }

    fn record_failure(&self, kind: PermitKind) {
        let mut inner = self.inner.lock();
        match (inner.state, kind) {
            (CircuitState::HalfOpen, PermitKind::Trial) => {
                inner.state = CircuitState::Open;
                inner.last_failure = Some(Instant::now());
                warn!(breaker = %self.name, "Trial call failed, circuit re-opened");
            }
            (CircuitState::Closed, PermitKind::Normal) => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.last_failure = Some(Instant::now());
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                        "Failure threshold reached, circuit opened"
                    );
                }
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::new()
                .with_failure_threshold(threshold)
                .with_reset_timeout(Duration::from_millis(reset_ms)),
        )
    }

    async fn fail(
        breaker: &CircuitBreaker,
    ) -> std::result::Result<(), CircuitBreakerError<&'static str>> {
        breaker.call(|| async { Err::<(), _>("boom") }).await
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
        assert!(CircuitBreakerConfig::new()
            .with_failure_threshold(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = breaker(3, 1000);

        for expected in 1..=2 {
            assert!(matches!(fail(&breaker).await, Err(CircuitBreakerError::Inner("boom"))));
            assert_eq!(breaker.failure_count(), expected);
            assert_eq!(breaker.state(), CircuitState::Closed);
        }

        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_invoking() {
        let breaker = breaker(3, 1000);
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        let invoked = AtomicUsize::new(0);
        tokio::time::advance(Duration::from_millis(999)).await;
        let result = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_reset_timeout() {
        let breaker = breaker(3, 1000);
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_millis(1000)).await;

        let trial = breaker.allow().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(matches!(breaker.allow(), Err(CircuitBreakerError::Open)));

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = breaker(1, 500);
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(500)).await;

        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        // lastFailureTime was refreshed
        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(breaker.allow().is_err());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(breaker.allow().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_counts_as_failure() {
        let breaker = breaker(1, 100);
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(100)).await;

        drop(breaker.allow().unwrap());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_dropped_permit_counts_as_failure() {
        let breaker = breaker(2, 1000);
        drop(breaker.allow().unwrap());
        assert_eq!(breaker.failure_count(), 1);
        drop(breaker.allow().unwrap());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_call_counts_as_failure() {
        let breaker = breaker(1, 1000);
        let hung = breaker.call(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, &str>(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), hung)
            .await
            .is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_records_nothing() {
        let breaker = breaker(1, 100);
        breaker.allow().unwrap().release();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.allow().unwrap().failure();
        tokio::time::advance(Duration::from_millis(100)).await;
        breaker.allow().unwrap().release();
        assert_eq!(breaker.state(), CircuitState::Open);

        // The next caller becomes the trial right away
        assert!(breaker.allow().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let breaker = breaker(3, 1000);
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert!(breaker.call(|| async { Ok::<_, &str>(1) }).await.is_ok());
        assert_eq!(breaker.failure_count(), 0);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let breaker = breaker(1, 60_000);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow().is_ok());
    }

    #[test]
    fn test_racing_callers_get_one_trial() {
        let breaker = Arc::new(breaker(1, 0));
        breaker.allow().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let admitted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    if let Ok(permit) = breaker.allow() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                        // Keep the trial open until every thread has tried
                        std::mem::forget(permit);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_error_conversion() {
        let err: RuntimeError = CircuitBreakerError::<RuntimeError>::Open.into();
        assert!(matches!(err, RuntimeError::CircuitOpen));
        assert!(CircuitBreakerError::<()>::Open.is_open());
        assert_eq!(CircuitBreakerError::Inner(5).into_inner(), Some(5));
    }

    #[test]
    fn test_serialization() {
        let config = CircuitBreakerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CircuitBreakerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
