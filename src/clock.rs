//! Discrete logical clock shared by every pipeline stage.
//!
//! Time only moves in whole periods. A stage never reads wall-clock time; it either waits for a
//! [`Countdown`] to expire or for data to show up on one of its pipes.

/// Simulated time, in clock-period units scaled by [`Clock::period`].
pub type Cycle = u64;

/// Nanoseconds represented by one clock period (200 MHz fabric clock).
pub const NS_PER_CYCLE: f64 = 5.0;

/// Logical clock advanced by the [`crate::sim::Simulator`] once per settled period.
#[derive(Debug, Clone)]
pub struct Clock {
    now: Cycle,
    period: Cycle,
}

impl Clock {
    /// Create a clock starting at time zero that advances `period` units per tick.
    ///
    /// A zero period would freeze time, so it is clamped to one.
    pub fn new(period: Cycle) -> Self {
        Self {
            now: 0,
            period: period.max(1),
        }
    }

    /// Current simulated time.
    pub fn now(&self) -> Cycle {
        self.now
    }

    pub fn period(&self) -> Cycle {
        self.period
    }

    /// Number of whole periods elapsed since time zero.
    pub fn periods_elapsed(&self) -> u64 {
        self.now / self.period
    }

    /// Time at which a wait of `periods` clock periods started now expires.
    pub fn after(&self, periods: u64) -> Cycle {
        self.now + periods * self.period
    }

    /// Advance by exactly one period.
    pub(crate) fn tick(&mut self) {
        self.now += self.period;
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Count-down timer used to model fixed latencies (write/read latency, rank computation,
/// serialization delay).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    until: Cycle,
}

impl Countdown {
    /// Arm a timer that expires `periods` clock periods from now.
    pub fn start(clock: &Clock, periods: u64) -> Self {
        Self {
            until: clock.after(periods),
        }
    }

    /// True once the clock has reached the expiry time.
    pub fn expired(&self, clock: &Clock) -> bool {
        clock.now() >= self.until
    }

    pub fn deadline(&self) -> Cycle {
        self.until
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances_by_period() {
        let mut clock = Clock::new(3);
        assert_eq!(clock.now(), 0);
        clock.tick();
        clock.tick();
        assert_eq!(clock.now(), 6);
        assert_eq!(clock.periods_elapsed(), 2);
        assert_eq!(clock.after(2), 12);
    }

    #[test]
    fn zero_period_is_clamped() {
        let clock = Clock::new(0);
        assert_eq!(clock.period(), 1);
    }

    #[test]
    fn countdown_expires_after_requested_periods() {
        let mut clock = Clock::new(1);
        let timer = Countdown::start(&clock, 2);
        assert!(!timer.expired(&clock));
        clock.tick();
        assert!(!timer.expired(&clock));
        clock.tick();
        assert!(timer.expired(&clock));
    }

    #[test]
    fn zero_length_countdown_is_already_expired() {
        let clock = Clock::new(1);
        assert!(Countdown::start(&clock, 0).expired(&clock));
    }
}
