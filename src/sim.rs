//! Cooperative single-threaded simulation driver.
//!
//! Stages are explicit state machines implementing [`Process`]. Each simulated period is settled
//! by stepping the top-level process repeatedly until nothing makes progress (delta steps), which
//! lets zero-latency hand-offs ripple through a chain of stages inside one period. Composite
//! processes step their children in a fixed documented order, so runs are fully deterministic.
//! Only then does the clock advance.

use crate::clock::{Clock, Cycle};
use crate::error::SimError;
use std::ops::BitOrAssign;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Default hard bound on simulated time.
pub const DEFAULT_CYCLE_LIMIT: Cycle = 10_000_000;

/// Maximum delta steps per period before the period is declared livelocked.
pub const DEFAULT_SETTLE_LIMIT: usize = 10_000;

/// Whether a step changed any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Progressed,
    Blocked,
}

impl Activity {
    pub fn progressed(self) -> bool {
        self == Activity::Progressed
    }

    pub fn from_bool(progressed: bool) -> Self {
        if progressed {
            Activity::Progressed
        } else {
            Activity::Blocked
        }
    }
}

impl BitOrAssign for Activity {
    fn bitor_assign(&mut self, rhs: Self) {
        if rhs.progressed() {
            *self = Activity::Progressed;
        }
    }
}

/// A logical task multiplexed onto the simulation clock.
pub trait Process {
    /// Short label used in diagnostics.
    fn name(&self) -> &'static str;

    /// Advance as far as possible at the current time without waiting.
    ///
    /// Suspension points are expressed by returning: a process waiting on a timer, an empty pipe
    /// or a missing ready token simply reports [`Activity::Blocked`] and is stepped again later.
    fn step(&mut self, clock: &Clock) -> Result<Activity, SimError>;

    /// True while the process holds in-flight work it must still hand off.
    fn busy(&self) -> bool {
        false
    }
}

/// Process-wide "simulation done" flag.
///
/// Raised once by the orchestrator; every stage polls it at the head of its main loop and stops
/// accepting new work once it is set, finishing whatever is already in flight.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    done: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.done.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        self.done.load(Ordering::Relaxed)
    }
}

/// Clock-driven event loop.
pub struct Simulator {
    clock: Clock,
    shutdown: Shutdown,
    cycle_limit: Cycle,
    settle_limit: usize,
}

impl Simulator {
    pub fn new(period: Cycle, shutdown: Shutdown) -> Self {
        Self {
            clock: Clock::new(period),
            shutdown,
            cycle_limit: DEFAULT_CYCLE_LIMIT,
            settle_limit: DEFAULT_SETTLE_LIMIT,
        }
    }

    /// Abort with [`SimError::CycleLimit`] once simulated time reaches `limit`.
    pub fn with_cycle_limit(mut self, limit: Cycle) -> Self {
        self.cycle_limit = limit;
        self
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Step `top` until it stops making progress at the current time.
    ///
    /// Returns the number of delta steps that made progress.
    pub fn settle(&mut self, top: &mut dyn Process) -> Result<usize, SimError> {
        let mut steps = 0;
        while top.step(&self.clock)?.progressed() {
            steps += 1;
            if steps >= self.settle_limit {
                return Err(SimError::Livelock(self.clock.now(), steps));
            }
        }
        if steps > 0 {
            trace!(cycle = self.clock.now(), steps, process = top.name(), "settled");
        }
        Ok(steps)
    }

    /// Settle the current period, then advance the clock by one period.
    pub fn step_cycle(&mut self, top: &mut dyn Process) -> Result<(), SimError> {
        self.settle(top)?;
        if self.clock.now() >= self.cycle_limit {
            return Err(SimError::CycleLimit(self.cycle_limit));
        }
        self.clock.tick();
        Ok(())
    }

    /// Run exactly `periods` periods.
    pub fn run_for(&mut self, top: &mut dyn Process, periods: u64) -> Result<(), SimError> {
        for _ in 0..periods {
            self.step_cycle(top)?;
        }
        Ok(())
    }

    /// Run until the shutdown flag is raised and `top` has drained its in-flight work.
    ///
    /// Returns the simulated time at which the run ended.
    pub fn run(&mut self, top: &mut dyn Process) -> Result<Cycle, SimError> {
        loop {
            self.settle(top)?;
            if self.shutdown.is_requested() && !top.busy() {
                debug!(cycle = self.clock.now(), process = top.name(), "simulation done");
                return Ok(self.clock.now());
            }
            if self.clock.now() >= self.cycle_limit {
                return Err(SimError::CycleLimit(self.cycle_limit));
            }
            self.clock.tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Countdown;

    /// Toggles a flag every `every` periods and asks for shutdown after `stop_after` toggles.
    struct Blinker {
        timer: Option<Countdown>,
        every: u64,
        toggles: u32,
        stop_after: u32,
        shutdown: Shutdown,
        log: Vec<Cycle>,
    }

    impl Process for Blinker {
        fn name(&self) -> &'static str {
            "blinker"
        }

        fn step(&mut self, clock: &Clock) -> Result<Activity, SimError> {
            match self.timer {
                None => {
                    self.timer = Some(Countdown::start(clock, self.every));
                    Ok(Activity::Progressed)
                }
                Some(timer) if timer.expired(clock) => {
                    self.toggles += 1;
                    self.log.push(clock.now());
                    if self.toggles == self.stop_after {
                        self.shutdown.request();
                    }
                    self.timer = if self.toggles < self.stop_after {
                        Some(Countdown::start(clock, self.every))
                    } else {
                        Some(Countdown::start(clock, u64::MAX / 4))
                    };
                    Ok(Activity::Progressed)
                }
                Some(_) => Ok(Activity::Blocked),
            }
        }
    }

    #[test]
    fn run_stops_when_shutdown_is_requested() {
        let shutdown = Shutdown::new();
        let mut sim = Simulator::new(1, shutdown.clone());
        let mut blinker = Blinker {
            timer: None,
            every: 3,
            toggles: 0,
            stop_after: 3,
            shutdown,
            log: Vec::new(),
        };
        let end = sim.run(&mut blinker).unwrap();
        assert_eq!(blinker.log, vec![3, 6, 9]);
        assert_eq!(end, 9);
    }

    #[test]
    fn run_reports_cycle_limit() {
        let shutdown = Shutdown::new();
        let mut sim = Simulator::new(1, shutdown.clone()).with_cycle_limit(5);
        let mut blinker = Blinker {
            timer: None,
            every: 100,
            toggles: 0,
            stop_after: 1,
            shutdown,
            log: Vec::new(),
        };
        assert!(matches!(sim.run(&mut blinker), Err(SimError::CycleLimit(5))));
    }

    struct Spinner;

    impl Process for Spinner {
        fn name(&self) -> &'static str {
            "spinner"
        }

        fn step(&mut self, _clock: &Clock) -> Result<Activity, SimError> {
            Ok(Activity::Progressed)
        }
    }

    #[test]
    fn settle_detects_livelock() {
        let mut sim = Simulator::new(1, Shutdown::new());
        assert!(matches!(
            sim.settle(&mut Spinner),
            Err(SimError::Livelock(0, _))
        ));
    }

    #[test]
    fn activity_merges_progress() {
        let mut activity = Activity::Blocked;
        activity |= Activity::Blocked;
        assert!(!activity.progressed());
        activity |= Activity::Progressed;
        assert!(activity.progressed());
    }
}
