//! Process-wide circuit breaker around provider fetch units.
//!
//! ```text
//! closed --(consecutive failures >= threshold)--> open
//! open --(cooldown elapsed)--> half-open
//! half-open --(consecutive successes >= max trials)--> closed
//! half-open --(any failure)--> open
//! ```
//!
//! Every transition starts a new generation. Outcomes from units admitted
//! under an older generation are discarded. The closed-state counts interval
//! only clears the windowed totals: it neither starts a generation nor breaks
//! a failure streak, so units longer than the interval still count.

use crate::error::IngestError;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub name: String,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub half_open_max_trials: u32,
    /// Closed-state totals are cleared this often. Consecutive streaks survive
    /// the reset. `None` keeps the totals until a transition.
    pub counts_interval: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    requests: u32,
    total_successes: u32,
    total_failures: u32,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    fn clear_window(&mut self) {
        self.requests = 0;
        self.total_successes = 0;
        self.total_failures = 0;
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        let settings = BreakerSettings {
            failure_threshold: settings.failure_threshold.max(1),
            half_open_max_trials: settings.half_open_max_trials.max(1),
            counts_interval: settings.counts_interval.filter(|d| !d.is_zero()),
            ..settings
        };
        let expiry = settings
            .counts_interval
            .map(|interval| Instant::now() + interval);
        Self {
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Runs `unit` if the breaker admits it and records its outcome.
    ///
    /// Rejected units are never started: `CircuitOpen` while open,
    /// `TooManyTrials` once the half-open trial budget is in use.
    pub async fn execute<T, F, Fut>(&self, unit: F) -> Result<T, IngestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, IngestError>>,
    {
        let generation = self.before_request()?;
        let mut outcome = OutcomeGuard {
            breaker: self,
            generation,
            settled: false,
        };
        let result = unit().await;
        outcome.settle(result.is_ok());
        result
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn before_request(&self) -> Result<u64, IngestError> {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        match inner.state {
            CircuitState::Open => Err(IngestError::CircuitOpen),
            CircuitState::HalfOpen
                if inner.counts.requests >= self.settings.half_open_max_trials =>
            {
                Err(IngestError::TooManyTrials)
            }
            _ => {
                inner.counts.on_request();
                Ok(inner.generation)
            }
        }
    }

    fn after_request(&self, generation: u64, success: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        if inner.generation != generation {
            return;
        }
        if success {
            inner.counts.on_success();
            if inner.state == CircuitState::HalfOpen
                && inner.counts.consecutive_successes >= self.settings.half_open_max_trials
            {
                self.transition(&mut inner, CircuitState::Closed, now);
            }
        } else {
            match inner.state {
                CircuitState::Closed => {
                    inner.counts.on_failure();
                    if inner.counts.consecutive_failures >= self.settings.failure_threshold {
                        self.transition(&mut inner, CircuitState::Open, now);
                    }
                }
                CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open, now),
                CircuitState::Open => {}
            }
        }
    }

    /// Applies time-driven changes: closed-state window reset and open cooldown expiry.
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        let Some(expiry) = inner.expiry else {
            return;
        };
        if now < expiry {
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.counts.clear_window();
                inner.expiry = self.settings.counts_interval.map(|interval| now + interval);
            }
            CircuitState::Open => self.transition(inner, CircuitState::HalfOpen, now),
            CircuitState::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut Inner, next: CircuitState, now: Instant) {
        if inner.state == next {
            return;
        }
        let previous = inner.state;
        let counts = inner.counts;
        inner.state = next;
        self.new_generation(inner, now);
        if next == CircuitState::Open {
            tracing::warn!(
                breaker = %self.settings.name,
                from = %previous,
                to = %next,
                cooldown_secs = self.settings.cooldown.as_secs_f64(),
                requests = counts.requests,
                successes = counts.total_successes,
                failures = counts.total_failures,
                "circuit breaker opened"
            );
        } else {
            tracing::info!(
                breaker = %self.settings.name,
                from = %previous,
                to = %next,
                requests = counts.requests,
                successes = counts.total_successes,
                "circuit breaker state changed"
            );
        }
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation = inner.generation.wrapping_add(1);
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            CircuitState::Closed => self.settings.counts_interval.map(|interval| now + interval),
            CircuitState::Open => Some(now + self.settings.cooldown),
            CircuitState::HalfOpen => None,
        };
    }
}

/// Reports a failure if the unit's future is dropped before it finishes.
struct OutcomeGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl OutcomeGuard<'_> {
    fn settle(&mut self, success: bool) {
        self.settled = true;
        self.breaker.after_request(self.generation, success);
    }
}

impl Drop for OutcomeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.after_request(self.generation, false);
        }
    }
}
