//! Prometheus metrics exposition
//!
//! - `bot_sessions_total` (counter): label `result` (completed, failed)
//! - `bot_session_duration_seconds` (histogram)
//! - `bot_missions_total` (counter): label `status`
//! - `bot_alerts_total` (counter): label `severity`
//! - `bot_loop_waits_total` (counter): labels `reason`, `outcome`
//!
//! Library crates record `breaker_open`, `pool_account_releases_total` and
//! `rate_limit_backend_failover_total` into the same recorder.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use session::SessionSummary;

/// Session durations run from seconds (nothing to do) to tens of minutes.
const SESSION_BUCKETS: &[f64] = &[
    0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("bot_session_duration_seconds".to_string()),
            SESSION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a session that returned a summary.
pub fn record_session(summary: &SessionSummary) {
    metrics::counter!("bot_sessions_total", "result" => "completed").increment(1);
    metrics::histogram!("bot_session_duration_seconds").record(summary.duration_seconds);
    for mission in &summary.missions {
        metrics::counter!("bot_missions_total", "status" => mission.status.label()).increment(1);
    }
}

/// Record a session that failed before producing a summary.
pub fn record_session_failure(duration_secs: f64) {
    metrics::counter!("bot_sessions_total", "result" => "failed").increment(1);
    metrics::histogram!("bot_session_duration_seconds").record(duration_secs);
}

pub fn record_alert(severity: &'static str) {
    metrics::counter!("bot_alerts_total", "severity" => severity).increment(1);
}

pub fn record_wait(reason: &'static str, outcome: &'static str) {
    metrics::counter!("bot_loop_waits_total", "reason" => reason, "outcome" => outcome)
        .increment(1);
}
