//! Adaptive wait between sessions

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{Clock, SystemClock};

/// Supplies the wait before the next session on a normal iteration.
pub trait SchedulingPolicy: Send + Sync {
    fn get_optimal_interval(&self) -> Duration;
}

/// Shorter interval during configured UTC hours, when new slots tend to be released.
pub struct PeakHoursPolicy {
    base: Duration,
    peak: Duration,
    peak_hours: BTreeSet<u8>,
    clock: Arc<dyn Clock>,
}

impl PeakHoursPolicy {
    pub fn new(base: Duration, peak: Duration, peak_hours: impl IntoIterator<Item = u8>) -> Self {
        Self::with_clock(base, peak, peak_hours, Arc::new(SystemClock))
    }

    pub fn with_clock(
        base: Duration,
        peak: Duration,
        peak_hours: impl IntoIterator<Item = u8>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            base,
            peak,
            peak_hours: peak_hours.into_iter().collect(),
            clock,
        }
    }

    fn current_hour(&self) -> u8 {
        ((self.clock.now_millis() / 3_600_000) % 24) as u8
    }
}

impl SchedulingPolicy for PeakHoursPolicy {
    fn get_optimal_interval(&self) -> Duration {
        if self.peak_hours.contains(&self.current_hour()) {
            self.peak
        } else {
            self.base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ManualClock;

    const HOUR_MS: u64 = 3_600_000;
    /// 2026-01-01T00:00:00Z
    const MIDNIGHT: u64 = 1_767_225_600_000;

    fn policy(clock: Arc<ManualClock>) -> PeakHoursPolicy {
        PeakHoursPolicy::with_clock(
            Duration::from_secs(900),
            Duration::from_secs(120),
            [7, 8],
            clock,
        )
    }

    #[test]
    fn base_interval_outside_peak() {
        let clock = Arc::new(ManualClock::new(MIDNIGHT + 3 * HOUR_MS));
        assert_eq!(policy(clock).get_optimal_interval(), Duration::from_secs(900));
    }

    #[test]
    fn peak_interval_inside_peak() {
        let clock = Arc::new(ManualClock::new(MIDNIGHT + 7 * HOUR_MS + 59 * 60_000));
        assert_eq!(policy(clock).get_optimal_interval(), Duration::from_secs(120));
    }

    #[test]
    fn peak_ends_on_the_hour() {
        let clock = Arc::new(ManualClock::new(MIDNIGHT + 8 * HOUR_MS));
        let p = policy(clock.clone());
        assert_eq!(p.get_optimal_interval(), Duration::from_secs(120));
        clock.advance(Duration::from_secs(3600));
        assert_eq!(p.get_optimal_interval(), Duration::from_secs(900));
    }

    #[test]
    fn no_peak_hours_always_base() {
        let p = PeakHoursPolicy::with_clock(
            Duration::from_secs(900),
            Duration::from_secs(120),
            Vec::new(),
            Arc::new(ManualClock::new(MIDNIGHT)),
        );
        assert_eq!(p.get_optimal_interval(), Duration::from_secs(900));
    }
}
