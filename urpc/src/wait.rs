//! Bounded busy-waiting.
//!
//! The counterpart may be spinning on another core with no way to wake us,
//! so waits never sleep or yield. They spin with a short exponential
//! backoff until a deadline passes.

use std::time::{Duration, Instant};

const MAX_SPIN_SHIFT: u32 = 6;

/// Spin-only exponential backoff.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spins for `2^step` iterations, doubling up to 64.
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..1u32 << self.step.min(MAX_SPIN_SHIFT) {
            std::hint::spin_loop();
        }
        if self.step < MAX_SPIN_SHIFT {
            self.step += 1;
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
    }
}

/// A point in time after which a wait gives up.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// Deadline `timeout` from now. Saturates instead of overflowing.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
        }
    }

    pub fn expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Polls `f` until it yields a value or `timeout` elapses.
///
/// `f` is always called at least once, so a zero timeout is a single try.
pub fn spin_until<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Deadline::after(timeout);
    let mut backoff = Backoff::new();
    loop {
        if let Some(v) = f() {
            return Some(v);
        }
        if deadline.expired() {
            return None;
        }
        backoff.spin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_tries_once() {
        let mut calls = 0;
        let r: Option<()> = spin_until(Duration::ZERO, || {
            calls += 1;
            None
        });
        assert!(r.is_none());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_returns_first_value() {
        let mut n = 0;
        let r = spin_until(Duration::from_secs(1), || {
            n += 1;
            (n == 3).then_some(n)
        });
        assert_eq!(r, Some(3));
    }

    #[test]
    fn test_times_out() {
        let start = Instant::now();
        let r: Option<()> = spin_until(Duration::from_millis(20), || None);
        assert!(r.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
