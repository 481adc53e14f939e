//! Bus silence tracking.

use std::time::{Duration, Instant};

use crate::config::INACTIVITY_THRESHOLD;

/// A source of monotonic time.
pub trait Clock {
    fn now(&self) -> Instant;
}

impl<C> Clock for &C
where
    C: Clock + ?Sized,
{
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// [Clock] backed by [Instant::now].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StdClock;

impl Clock for StdClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Logs prolonged bus silence. Silence is never an error, the host may
/// simply be polling other machines or be switched off.
#[derive(Debug, Clone)]
pub struct ActivityMonitor<C = StdClock> {
    clock: C,
    threshold: Duration,
    last_activity: Instant,
    session_start: Instant,
    warnings: u32,
}

impl ActivityMonitor<StdClock> {
    pub fn new() -> Self {
        Self::with_clock(StdClock)
    }
}

impl Default for ActivityMonitor<StdClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ActivityMonitor<C>
where
    C: Clock,
{
    /// Create a monitor using the standard [INACTIVITY_THRESHOLD].
    pub fn with_clock(clock: C) -> Self {
        Self::with_threshold(clock, INACTIVITY_THRESHOLD)
    }

    pub fn with_threshold(clock: C, threshold: Duration) -> Self {
        let now = clock.now();
        Self {
            clock,
            threshold,
            last_activity: now,
            session_start: now,
            warnings: 0,
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Start timing a new session.
    pub fn restart(&mut self) {
        let now = self.clock.now();
        self.last_activity = now;
        self.session_start = now;
        self.warnings = 0;
    }

    /// The link just produced a byte.
    pub fn record_activity(&mut self) {
        self.last_activity = self.clock.now();
    }

    /// Time since the link last produced a byte, or since the last
    /// warning, whichever is later.
    pub fn silence(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.last_activity)
    }

    /// Warnings logged this session.
    pub fn warnings(&self) -> u32 {
        self.warnings
    }

    /// Called after a failed read. Logs a warning and restarts the
    /// silence timer if the threshold has been exceeded. Returns whether
    /// a warning was logged.
    pub fn check_silence(&mut self) -> bool {
        let now = self.clock.now();
        let silence = now.saturating_duration_since(self.last_activity);
        if silence <= self.threshold {
            return false;
        }

        log::warn!(
            "no bus activity for {} ms (session open {} s)",
            silence.as_millis(),
            now.saturating_duration_since(self.session_start).as_secs()
        );
        self.last_activity = now;
        self.warnings = self.warnings.saturating_add(1);
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::mock::ManualClock;

    #[test]
    fn quiet_below_threshold() {
        let clock = ManualClock::new();
        let mut monitor = ActivityMonitor::with_clock(clock.clone());

        clock.advance_ms(30_000);
        assert!(!monitor.check_silence());
        assert_eq!(monitor.warnings(), 0);
    }

    #[test]
    fn warns_once_per_interval() {
        let clock = ManualClock::new();
        let mut monitor = ActivityMonitor::with_clock(clock.clone());

        clock.advance_ms(30_001);
        assert!(monitor.check_silence());

        clock.advance_ms(100);
        assert!(!monitor.check_silence());

        clock.advance_ms(30_000);
        assert!(monitor.check_silence());
        assert_eq!(monitor.warnings(), 2);
    }

    #[test]
    fn activity_resets_timer() {
        let clock = ManualClock::new();
        let mut monitor = ActivityMonitor::with_clock(clock.clone());

        clock.advance_ms(20_000);
        monitor.record_activity();
        clock.advance_ms(20_000);
        assert!(!monitor.check_silence());
        assert_eq!(monitor.silence(), Duration::from_millis(20_000));
    }

    #[test]
    fn restart_clears_warnings() {
        let clock = ManualClock::new();
        let mut monitor = ActivityMonitor::with_threshold(clock.clone(), Duration::from_millis(10));

        clock.advance_ms(11);
        assert!(monitor.check_silence());
        monitor.restart();
        assert_eq!(monitor.warnings(), 0);
        assert_eq!(monitor.silence(), Duration::ZERO);
    }
}
