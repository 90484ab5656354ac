//! Randomised exponential backoff for announcements and browse queries.

use std::time::{Duration, Instant};

use rand::Rng;

/// Each interval is the previous one times a random factor in [2, 3),
/// clamped to `[min, max]`. The first firing is immediate.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    interval: Duration,
    next: Instant,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, now: Instant) -> Self {
        Self {
            min,
            max,
            interval: Duration::ZERO,
            next: now,
            attempt: 0,
        }
    }

    /// Start over: fire at `now`, then climb from `min` again.
    pub fn reset(&mut self, now: Instant) {
        self.interval = Duration::ZERO;
        self.next = now;
        self.attempt = 0;
    }

    /// True if the backoff fired. Schedules the next firing when it does.
    pub fn poll(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }
        let factor = rand::thread_rng().gen_range(2.0..3.0);
        self.interval = self.interval.mul_f64(factor).clamp(self.min, self.max);
        self.next = now + self.interval;
        self.attempt += 1;
        true
    }

    pub fn next(&self) -> Instant {
        self.next
    }

    /// How many times the backoff has fired since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(2);
    const MAX: Duration = Duration::from_secs(3600);

    #[test]
    fn fires_immediately_then_waits_min() {
        let t0 = Instant::now();
        let mut b = Backoff::new(MIN, MAX, t0);
        assert!(b.poll(t0));
        assert_eq!(b.attempt(), 1);
        assert_eq!(b.next(), t0 + MIN);
        assert!(!b.poll(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn grows_between_two_and_three_times() {
        let t0 = Instant::now();
        let mut b = Backoff::new(MIN, MAX, t0);
        let mut now = t0;
        let mut last = Duration::ZERO;
        for _ in 0..6 {
            assert!(b.poll(now));
            let interval = b.next() - now;
            if last >= MIN {
                assert!(interval >= last * 2 && interval <= last * 3, "{interval:?} after {last:?}");
            }
            last = interval;
            now = b.next();
        }
    }

    #[test]
    fn clamps_at_max() {
        let t0 = Instant::now();
        let mut b = Backoff::new(MIN, MAX, t0);
        let mut now = t0;
        for _ in 0..30 {
            b.poll(now);
            now = b.next();
        }
        b.poll(now);
        assert_eq!(b.next() - now, MAX);
    }

    #[test]
    fn reset_starts_over() {
        let t0 = Instant::now();
        let mut b = Backoff::new(MIN, MAX, t0);
        let mut now = t0;
        for _ in 0..5 {
            b.poll(now);
            now = b.next();
        }
        b.reset(now);
        assert!(b.poll(now));
        assert_eq!(b.attempt(), 1);
        assert_eq!(b.next(), now + MIN);
    }
}
