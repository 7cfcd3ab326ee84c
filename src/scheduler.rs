//! Cooperative main-loop scheduling.
//!
//! No preemption, no priorities: every subsystem declares an interval,
//! remembers its last tick, and is asked once per loop pass whether it is
//! due. Subsystem ticks must be bounded: no blocking I/O, no unbounded
//! loops. The only preemptive context in the system is the strobe
//! interrupt.

use crate::time::Millis;

/// Default tick intervals, in milliseconds.
pub mod intervals {
    /// Port service: flow control + framing.
    pub const PORT_MS: u32 = 1;
    /// Storage housekeeping.
    pub const FILESYSTEM_MS: u32 = 10;
    /// Display refresh.
    pub const DISPLAY_MS: u32 = 100;
    /// Clock display update.
    pub const TIME_MS: u32 = 1000;
    /// System monitor sweep.
    pub const MONITOR_MS: u32 = 5000;
    /// Heartbeat LED.
    pub const HEARTBEAT_MS: u32 = 500;
    /// Serial command shell poll.
    pub const SHELL_MS: u32 = 50;
}

/// Interval tracker: `ready` answers "due yet?" and stamps the tick.
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    interval_ms: u32,
    last: Millis,
}

impl Cadence {
    pub const fn new(interval_ms: u32) -> Self {
        Self {
            interval_ms,
            last: Millis::ZERO,
        }
    }

    /// True once per elapsed interval; marks the tick when it fires.
    pub fn ready(&mut self, now: Millis) -> bool {
        if now.since(self.last) >= self.interval_ms {
            self.last = now;
            true
        } else {
            false
        }
    }

    pub const fn interval_ms(&self) -> u32 {
        self.interval_ms
    }
}

/// A subsystem the scheduler can tick.
pub trait Service {
    fn tick(&mut self, now: Millis);
}

/// Fixed-size table of services with their cadences, walked once per loop
/// iteration.
pub struct Scheduler<'a, const N: usize> {
    slots: [(Cadence, &'a mut dyn Service); N],
}

impl<'a, const N: usize> Scheduler<'a, N> {
    pub fn new(slots: [(Cadence, &'a mut dyn Service); N]) -> Self {
        Self { slots }
    }

    /// One loop pass: tick every service that is due.
    pub fn poll(&mut self, now: Millis) {
        for (cadence, service) in self.slots.iter_mut() {
            if cadence.ready(now) {
                service.tick(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        ticks: u32,
        last: Millis,
    }

    impl Service for Counter {
        fn tick(&mut self, now: Millis) {
            self.ticks += 1;
            self.last = now;
        }
    }

    #[test]
    fn cadence_fires_once_per_interval() {
        let mut c = Cadence::new(10);
        assert!(!c.ready(Millis(0)));
        assert!(!c.ready(Millis(9)));
        assert!(c.ready(Millis(10)));
        assert!(!c.ready(Millis(15)));
        assert!(c.ready(Millis(21)));
    }

    #[test]
    fn cadence_survives_counter_rollover() {
        let mut c = Cadence::new(10);
        assert!(c.ready(Millis(u32::MAX - 4)));
        assert!(!c.ready(Millis(u32::MAX)));
        // 11 ms after the last fire, across the wrap.
        assert!(c.ready(Millis(6)));
    }

    #[test]
    fn scheduler_ticks_services_at_their_own_rates() {
        let mut fast = Counter {
            ticks: 0,
            last: Millis::ZERO,
        };
        let mut slow = Counter {
            ticks: 0,
            last: Millis::ZERO,
        };
        {
            let mut sched = Scheduler::new([
                (Cadence::new(1), &mut fast as &mut dyn Service),
                (Cadence::new(10), &mut slow as &mut dyn Service),
            ]);

            for t in 0..=100u32 {
                sched.poll(Millis(t));
            }
        }
        assert_eq!(fast.ticks, 100);
        assert_eq!(slow.ticks, 10);
        assert_eq!(slow.last, Millis(100));
    }
}
