//! Absolute-deadline pacing for the cyclic loop.

use std::time::{Duration, Instant};

/// Sleeps until deadlines spaced a fixed period apart on the monotonic
/// clock. Deadlines advance by whole periods from the start instant, so a
/// late cycle eats into the next sleep instead of shifting every
/// subsequent deadline: missed cycles do not accumulate drift.
pub struct CycleTimer {
    next: Instant,
    period: Duration,
}

impl CycleTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            next: Instant::now() + period,
            period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Block until the next deadline, then arm the one after it. Returns
    /// how late the wakeup was relative to the deadline (zero when the
    /// sleep completed on time).
    pub fn wait(&mut self) -> Duration {
        let now = Instant::now();
        let lag = if now < self.next {
            std::thread::sleep(self.next - now);
            Duration::ZERO
        } else {
            now - self.next
        };
        self.next += self.period;
        lag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines_advance_by_whole_periods() {
        let period = Duration::from_millis(2);
        let mut timer = CycleTimer::new(period);
        let start = Instant::now();

        for _ in 0..25 {
            timer.wait();
        }

        // 25 deadlines at 2 ms: at least 50 ms minus the construction
        // overhead must have elapsed, and a busy host can only make it
        // later, never earlier.
        assert!(start.elapsed() >= Duration::from_millis(48));
    }

    #[test]
    #[ignore = "timing-sensitive; run on a quiescent host"]
    fn jitter_stays_small_over_ten_thousand_cycles() {
        let period = Duration::from_millis(2);
        let start = Instant::now();
        let mut timer = CycleTimer::new(period);

        let mut worst = Duration::ZERO;
        for _ in 0..10_000 {
            worst = worst.max(timer.wait());
        }

        assert!(
            worst <= Duration::from_micros(200),
            "worst cycle lag {worst:?}"
        );

        // Absolute deadlines: total elapsed tracks the schedule, it does
        // not accumulate per-cycle sleep overshoot.
        let expected = period * 10_000;
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed <= expected + Duration::from_millis(5),
            "schedule drifted: {elapsed:?} vs {expected:?}"
        );
    }

    #[test]
    fn late_cycles_do_not_shift_the_schedule() {
        let period = Duration::from_millis(2);
        let mut timer = CycleTimer::new(period);

        // Miss several deadlines outright.
        std::thread::sleep(Duration::from_millis(9));
        let lag = timer.wait();
        assert!(lag >= Duration::from_millis(6));

        // The schedule catches up without sleeping a full period per
        // missed deadline: the next few waits return immediately.
        let start = Instant::now();
        timer.wait();
        timer.wait();
        timer.wait();
        assert!(start.elapsed() < Duration::from_millis(4));
    }
}
