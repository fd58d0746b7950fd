//! Failure-aware circuit breaker for unreliable remote work
//!
//! States: `Closed -> Open -> HalfOpen -> {Closed | Open}`.
//!
//! - Closed trips on `failure_threshold` consecutive failures, or when more than
//!   `max_errors_in_window` failures fall inside the trailing `error_window`.
//! - Open refuses work until `opened_at + current_backoff` has passed; the next
//!   `can_execute()` after that moves to HalfOpen.
//! - HalfOpen closes after `half_open_threshold` successes; any failure reopens
//!   with the backoff doubled (capped at `backoff_max`).

mod breaker;

pub use breaker::{BreakerConfig, BreakerState, BreakerStats, CircuitBreaker};
