use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use common::{Clock, SystemClock};
use serde::Serialize;
use tracing::{info, warn};

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Trailing window for the error-rate trip condition.
    pub error_window: Duration,
    /// Opens when the errors inside `error_window` exceed this count.
    pub max_errors_in_window: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Successful probes needed in HalfOpen before closing.
    pub half_open_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            error_window: Duration::from_secs(3600),
            max_errors_in_window: 10,
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(3600),
            half_open_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn label(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Observability snapshot returned by `get_stats()`.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub failure_count: u32,
    pub total_errors_in_window: usize,
    pub half_open_successes: u32,
    pub current_backoff_secs: u64,
    pub wait_secs: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    /// Failure timestamps (unix ms), oldest first
    errors: VecDeque<u64>,
    half_open_successes: u32,
    current_backoff: Duration,
    opened_at: Option<u64>,
}

/// Circuit breaker guarding one downstream dependency.
///
/// All state sits behind one std `Mutex`; no method awaits, so the lock is
/// never held across I/O.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let backoff_base = config.backoff_base;
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                errors: VecDeque::new(),
                half_open_successes: 0,
                current_backoff: backoff_base,
                opened_at: None,
            }),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether work may be attempted now.
    ///
    /// An Open breaker whose backoff has elapsed moves to HalfOpen here and
    /// admits the probe.
    pub fn can_execute(&self) -> bool {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if remaining_millis(&inner, now) > 0 {
                    return false;
                }
                inner.state = BreakerState::HalfOpen;
                inner.half_open_successes = 0;
                info!(breaker = %self.name, "backoff elapsed, breaker half-open (probing)");
                metrics::gauge!("breaker_open", "breaker" => self.name.clone()).set(0.0);
                true
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => inner.failure_count = 0,
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.errors.clear();
                    inner.half_open_successes = 0;
                    inner.current_backoff = self.config.backoff_base;
                    inner.opened_at = None;
                    info!(breaker = %self.name, "breaker closed after successful probes");
                }
            }
            // A straggling success cannot shorten an open backoff
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.errors.push_back(now);
        prune_window(&mut inner, now, self.config.error_window);

        match inner.state {
            BreakerState::Closed => {
                let errors_in_window = inner.errors.len();
                if inner.failure_count >= self.config.failure_threshold
                    || errors_in_window > self.config.max_errors_in_window as usize
                {
                    inner.current_backoff = self.config.backoff_base.min(self.config.backoff_max);
                    self.open(&mut inner, now);
                    warn!(
                        breaker = %self.name,
                        failure_count = inner.failure_count,
                        errors_in_window,
                        backoff_secs = inner.current_backoff.as_secs(),
                        "breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.current_backoff = (inner.current_backoff * 2).min(self.config.backoff_max);
                inner.half_open_successes = 0;
                self.open(&mut inner, now);
                warn!(
                    breaker = %self.name,
                    backoff_secs = inner.current_backoff.as_secs(),
                    "probe failed, breaker reopened with escalated backoff"
                );
            }
            BreakerState::Open => {}
        }
    }

    fn open(&self, inner: &mut Inner, now: u64) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        metrics::gauge!("breaker_open", "breaker" => self.name.clone()).set(1.0);
    }

    /// Time left before an Open breaker will admit a probe; zero otherwise.
    pub fn get_wait_time(&self) -> Duration {
        let now = self.clock.now_millis();
        let inner = self.lock();
        match inner.state {
            BreakerState::Open => Duration::from_millis(remaining_millis(&inner, now)),
            _ => Duration::ZERO,
        }
    }

    /// Current state without triggering the Open -> HalfOpen transition.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn get_stats(&self) -> BreakerStats {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        prune_window(&mut inner, now, self.config.error_window);
        let wait = match inner.state {
            BreakerState::Open => remaining_millis(&inner, now),
            _ => 0,
        };
        BreakerStats {
            state: inner.state,
            failure_count: inner.failure_count,
            total_errors_in_window: inner.errors.len(),
            half_open_successes: inner.half_open_successes,
            current_backoff_secs: inner.current_backoff.as_secs(),
            wait_secs: wait.div_ceil(1000),
        }
    }
}

fn remaining_millis(inner: &Inner, now: u64) -> u64 {
    let opened_at = inner.opened_at.unwrap_or(now);
    let reopen_at = opened_at.saturating_add(inner.current_backoff.as_millis() as u64);
    reopen_at.saturating_sub(now)
}

fn prune_window(inner: &mut Inner, now: u64, window: Duration) {
    let cutoff = now.saturating_sub(window.as_millis() as u64);
    while inner.errors.front().is_some_and(|&t| t <= cutoff) {
        inner.errors.pop_front();
    }
}
