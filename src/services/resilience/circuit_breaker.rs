use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by the metrics gauge (0=closed, 1=half-open, 2=open)
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to trip the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing
    pub open_duration: Duration,
    /// Concurrent probe budget while half-open
    pub half_open_probe_limit: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
            half_open_probe_limit: 3,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

/// Fail-fast state machine shared by pipeline stages, cache fills and peers.
///
/// Independent of retry policy: callers compose the two as needed.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("Circuit open")]
    CircuitOpen,
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::CircuitOpen)
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, transitioning open -> half-open if the window elapsed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Reserve a slot for one call. `Err(CircuitOpen)` means the wrapped
    /// function must not be invoked. Every `Ok` MUST be paired with exactly
    /// one `record_success`/`record_failure`.
    pub fn try_acquire(&self) -> Result<(), BreakerError<()>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.maybe_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(BreakerError::CircuitOpen),
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_probe_limit {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(BreakerError::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures = 0;
        match inner.state {
            CircuitState::HalfOpen => {
                // First success while probing closes the circuit
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                inner.half_open_in_flight = 0;
                tracing::info!(breaker = %self.name, "Circuit breaker closed: dependency recovered");
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                self.trip(&mut inner);
            }
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` under the breaker. Returns `CircuitOpen` without invoking `f`
    /// when the circuit is open or the half-open probe budget is spent.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.try_acquire().is_err() {
            return Err(BreakerError::CircuitOpen);
        }
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_in_flight = 0;
        tracing::warn!(
            breaker = %self.name,
            consecutive_failures = inner.consecutive_failures,
            "Circuit breaker opened"
        );
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.open_duration {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_in_flight = 0;
                    tracing::info!(breaker = %self.name, "Circuit breaker half-open: probing");
                }
            }
        }
    }
}
