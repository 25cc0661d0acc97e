//! Tick counting.
//!
//! The platform timer driver interrupts `TIMER_FREQ` times a second and
//! calls [`crate::sched::on_tick`]; the scheduler advances this counter at
//! the top of every tick and uses it to pace the once-a-second and
//! every-four-ticks recomputations of the feedback-queue policy.

use portable_atomic::{AtomicI64, Ordering};

/// Timer interrupts per second.
pub const TIMER_FREQ: i64 = 100;

/// Monotonic count of timer ticks since boot.
pub struct TickCounter {
    ticks: AtomicI64,
}

impl TickCounter {
    pub const fn new() -> TickCounter {
        TickCounter {
            ticks: AtomicI64::new(0),
        }
    }

    /// Advance by one tick; called once per timer interrupt.
    pub fn increment(&self) -> i64 {
        self.ticks.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn get(&self) -> i64 {
        self.ticks.load(Ordering::Acquire)
    }
}

impl Default for TickCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) static TICKS: TickCounter = TickCounter::new();

/// Ticks since boot.
pub fn ticks() -> i64 {
    TICKS.get()
}

/// Seconds elapsed for a given tick count, rounded down.
pub fn ticks_to_secs(t: i64) -> i64 {
    t / TIMER_FREQ
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    TICKS.ticks.store(0, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_counts() {
        let c = TickCounter::new();
        assert_eq!(c.get(), 0);
        assert_eq!(c.increment(), 1);
        assert_eq!(c.increment(), 2);
        assert_eq!(c.get(), 2);
    }

    #[test]
    fn tick_second_conversion() {
        assert_eq!(ticks_to_secs(0), 0);
        assert_eq!(ticks_to_secs(TIMER_FREQ - 1), 0);
        assert_eq!(ticks_to_secs(TIMER_FREQ), 1);
        assert_eq!(ticks_to_secs(5 * TIMER_FREQ + 3), 5);
    }
}
