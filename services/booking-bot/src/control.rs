//! Unattended control loop
//!
//! Each iteration:
//! 1. Breaker open: alert, wait out the backoff, start over. The breaker is
//!    never force-closed here; only a real attempt's success closes it.
//! 2. Health checks on shared dependencies; on failure wait the health
//!    recovery interval and start over.
//! 3. No usable account: wait (bounded) for one; still none means the normal
//!    adaptive wait. A trigger during that wait re-checks capacity at once and,
//!    if there is still none, ends the iteration.
//! 4. Run one session. Success feeds the breaker; a failure is recorded,
//!    alerted and followed by either the breaker backoff (if it just opened)
//!    or the recovery interval plus random jitter. A failed half-open attempt
//!    escalates the backoff and alerts as critical.
//! 5. Adaptive wait from the scheduling policy.
//!
//! Every wait races its timer against shutdown and "trigger now"; shutdown
//! wins ties and ends the loop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use account_pool::AccountPool;
use circuit_breaker::{BreakerState, CircuitBreaker};
use futures_util::FutureExt;
use rand::RngExt;
use session::SessionOrchestrator;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{Alerter, Severity};
use crate::health::HealthCheck;
use crate::metrics;
use crate::schedule::SchedulingPolicy;

/// How a cancellable wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Triggered,
    Shutdown,
}

impl WaitOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            WaitOutcome::Elapsed => "elapsed",
            WaitOutcome::Triggered => "triggered",
            WaitOutcome::Shutdown => "shutdown",
        }
    }
}

/// Shutdown and "trigger now" signals shared by the loop, the admin API and
/// the signal handler.
///
/// A trigger fired while no wait is in progress is kept and ends the next wait.
#[derive(Clone, Default)]
pub struct LoopSignals {
    shutdown: CancellationToken,
    trigger: Arc<Notify>,
}

impl LoopSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn trigger_now(&self) {
        self.trigger.notify_one();
    }

    /// Resolves on the next trigger, consuming it.
    pub async fn triggered(&self) {
        self.trigger.notified().await;
    }

    /// Sleep for `duration` unless shutdown or a trigger arrives first.
    pub async fn wait(&self, duration: Duration) -> WaitOutcome {
        if self.shutdown.is_cancelled() {
            return WaitOutcome::Shutdown;
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => WaitOutcome::Shutdown,
            _ = self.trigger.notified() => WaitOutcome::Triggered,
            _ = tokio::time::sleep(duration) => WaitOutcome::Elapsed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub recovery_interval: Duration,
    /// Upper bound of the uniform jitter added to `recovery_interval`
    pub recovery_jitter: Duration,
    pub health_recovery_interval: Duration,
    pub account_wait_timeout: Duration,
    pub alert_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            recovery_interval: Duration::from_secs(300),
            recovery_jitter: Duration::from_secs(60),
            health_recovery_interval: Duration::from_secs(120),
            account_wait_timeout: Duration::from_secs(1800),
            alert_timeout: Duration::from_secs(10),
        }
    }
}

/// Which step ended an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    BreakerOpen,
    Unhealthy,
    NoCapacity,
    Completed,
    Failed,
}

/// Result of looking for a usable account before a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capacity {
    Ready,
    Exhausted,
    Triggered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationReport {
    pub step: Step,
    pub wait: WaitOutcome,
}

pub struct BotLoopManager {
    breaker: Arc<CircuitBreaker>,
    pool: Arc<AccountPool>,
    orchestrator: Arc<SessionOrchestrator>,
    scheduler: Arc<dyn SchedulingPolicy>,
    alerter: Arc<dyn Alerter>,
    health_checks: Vec<Arc<dyn HealthCheck>>,
    signals: LoopSignals,
    config: LoopConfig,
}

impl BotLoopManager {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        orchestrator: Arc<SessionOrchestrator>,
        scheduler: Arc<dyn SchedulingPolicy>,
        alerter: Arc<dyn Alerter>,
        signals: LoopSignals,
        config: LoopConfig,
    ) -> Self {
        Self {
            breaker,
            pool: Arc::clone(orchestrator.pool()),
            orchestrator,
            scheduler,
            alerter,
            health_checks: Vec::new(),
            signals,
            config,
        }
    }

    pub fn with_health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health_checks.push(check);
        self
    }

    /// Run iterations until shutdown is requested.
    pub async fn run(&self) {
        info!(health_checks = self.health_checks.len(), "Control loop started");
        let mut iterations: u64 = 0;
        while !self.signals.is_shutdown() {
            iterations += 1;
            let report = self.run_iteration().await;
            debug!(
                iteration = iterations,
                step = ?report.step,
                wait = report.wait.label(),
                "Iteration finished"
            );
            if report.wait == WaitOutcome::Shutdown {
                break;
            }
        }
        info!(iterations, "Control loop stopped");
    }

    /// One pass through the loop steps, including the wait that ends it.
    pub async fn run_iteration(&self) -> IterationReport {
        if !self.breaker.can_execute() {
            let wait = self.breaker.get_wait_time();
            let stats = self.breaker.get_stats();
            warn!(
                breaker = self.breaker.name(),
                wait_secs = wait.as_secs(),
                errors_in_window = stats.total_errors_in_window,
                "Circuit breaker open, skipping session"
            );
            self.alert(
                "Circuit breaker open; sessions paused",
                Severity::Warning,
                serde_json::json!({
                    "breaker": self.breaker.name(),
                    "wait_secs": wait.as_secs(),
                    "errors_in_window": stats.total_errors_in_window,
                }),
            )
            .await;
            return self.wait(Step::BreakerOpen, wait, "breaker_open").await;
        }

        for check in &self.health_checks {
            if let Err(e) = check.check().await {
                error!(check = check.name(), error = %e, "Health check failed");
                self.alert(
                    "Dependency health check failed",
                    Severity::Error,
                    serde_json::json!({ "check": check.name(), "error": e.to_string() }),
                )
                .await;
                return self
                    .wait(
                        Step::Unhealthy,
                        self.config.health_recovery_interval,
                        "unhealthy",
                    )
                    .await;
            }
        }

        match self.ensure_capacity().await {
            Ok(Capacity::Ready) => {}
            Ok(Capacity::Triggered) => {
                metrics::record_wait("no_capacity", WaitOutcome::Triggered.label());
                info!("Trigger received with no usable account, starting over");
                return IterationReport {
                    step: Step::NoCapacity,
                    wait: WaitOutcome::Triggered,
                };
            }
            Ok(Capacity::Exhausted) => {
                if self.signals.is_shutdown() {
                    return IterationReport {
                        step: Step::NoCapacity,
                        wait: WaitOutcome::Shutdown,
                    };
                }
                let interval = self.scheduler.get_optimal_interval();
                info!(
                    interval_secs = interval.as_secs(),
                    "Still no usable account, retrying after interval"
                );
                return self.wait(Step::NoCapacity, interval, "no_capacity").await;
            }
            Err(e) => return self.step_failed("account pool", e.to_string()).await,
        }

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.orchestrator.run_session())
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(summary)) => {
                self.breaker.record_success();
                metrics::record_session(&summary);
            }
            Ok(Err(e)) => {
                metrics::record_session_failure(started.elapsed().as_secs_f64());
                return self.step_failed("session", e.to_string()).await;
            }
            Err(panic) => {
                metrics::record_session_failure(started.elapsed().as_secs_f64());
                let message = panic_message(panic.as_ref());
                return self
                    .step_failed("session", format!("panicked: {message}"))
                    .await;
            }
        }

        let interval = self.scheduler.get_optimal_interval();
        self.wait(Step::Completed, interval, "interval").await
    }

    /// Wait up to the configured timeout for a usable account.
    ///
    /// Shutdown ends the wait through the pool; a trigger ends it here.
    async fn ensure_capacity(&self) -> account_pool::Result<Capacity> {
        if self.pool.usable_count().await? > 0 {
            return Ok(Capacity::Ready);
        }
        let wait = self.pool.get_wait_time().await?;
        info!(
            next_free_secs = wait.map(|w| w.as_secs()),
            timeout_secs = self.config.account_wait_timeout.as_secs(),
            "No usable accounts, waiting for one to free up"
        );
        let available = self.pool.wait_for_available_account(
            Some(self.config.account_wait_timeout),
            self.signals.shutdown_token(),
        );
        tokio::select! {
            biased;
            available = available => Ok(if available? {
                Capacity::Ready
            } else {
                Capacity::Exhausted
            }),
            _ = self.signals.triggered() => {
                if self.pool.usable_count().await? > 0 {
                    Ok(Capacity::Ready)
                } else {
                    Ok(Capacity::Triggered)
                }
            }
        }
    }

    async fn step_failed(&self, step: &'static str, reason: String) -> IterationReport {
        let was_half_open = self.breaker.state() == BreakerState::HalfOpen;
        self.breaker.record_failure();
        let state = self.breaker.state();
        let severity = if was_half_open && state == BreakerState::Open {
            Severity::Critical
        } else {
            Severity::Error
        };
        error!(
            step,
            error = %reason,
            breaker_state = state.label(),
            "Loop step failed"
        );
        self.alert(
            &format!("{step} failed: {reason}"),
            severity,
            serde_json::json!({
                "step": step,
                "breaker_state": state.label(),
                "failure_count": self.breaker.get_stats().failure_count,
            }),
        )
        .await;

        if state == BreakerState::Open {
            let backoff = self.breaker.get_wait_time();
            self.wait(Step::Failed, backoff, "breaker_backoff").await
        } else {
            self.wait(Step::Failed, self.recovery_wait(), "recovery").await
        }
    }

    fn recovery_wait(&self) -> Duration {
        let max_jitter = self.config.recovery_jitter.as_millis() as u64;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::rng().random_range(0..=max_jitter)
        };
        self.config.recovery_interval + Duration::from_millis(jitter)
    }

    async fn wait(&self, step: Step, duration: Duration, reason: &'static str) -> IterationReport {
        debug!(reason, wait_secs = duration.as_secs(), "Waiting");
        let outcome = self.signals.wait(duration).await;
        metrics::record_wait(reason, outcome.label());
        match outcome {
            WaitOutcome::Shutdown => info!(reason, "Wait interrupted by shutdown"),
            WaitOutcome::Triggered => info!(reason, "Wait cut short by trigger"),
            WaitOutcome::Elapsed => {}
        }
        IterationReport {
            step,
            wait: outcome,
        }
    }

    /// Deliver an alert without letting its failure or slowness affect the loop.
    async fn alert(&self, message: &str, severity: Severity, metadata: serde_json::Value) {
        metrics::record_alert(severity.label());
        match tokio::time::timeout(
            self.config.alert_timeout,
            self.alerter.send_alert(message, severity, &metadata),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Alert delivery failed"),
            Err(_) => warn!(
                timeout_secs = self.config.alert_timeout.as_secs(),
                "Alert delivery timed out"
            ),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
