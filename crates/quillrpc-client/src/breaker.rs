//! Per-provider circuit breaking.
//!
//! A breaker observes call outcomes. Once `threshold` failures accumulate
//! inside the rolling window the breaker opens and refuses requests for
//! one window, then lets a single trial call through: success closes the
//! circuit, failure re-opens it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

pub trait CircuitBreaker: Send + Sync {
    /// Whether the next request may go out. May transition Open → HalfOpen
    /// when the window has elapsed.
    fn allow_request(&self) -> bool;
    fn success(&self);
    fn fail(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

pub struct WindowBreaker {
    threshold: u64,
    window: Duration,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u64,
    window_start: Instant,
    opened_at: Instant,
}

impl WindowBreaker {
    pub fn new(threshold: u64, window: Duration) -> Self {
        let now = Instant::now();
        WindowBreaker {
            threshold,
            window,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                window_start: now,
                opened_at: now,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }
}

impl CircuitBreaker for WindowBreaker {
    fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                // Roll the failure window.
                if inner.window_start.elapsed() >= self.window {
                    inner.failures = 0;
                    inner.window_start = Instant::now();
                }
                true
            }
            BreakerState::Open => {
                if inner.opened_at.elapsed() >= self.window {
                    inner.state = BreakerState::HalfOpen;
                    info!("circuit breaker half-open, allowing trial call");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => true,
        }
    }

    fn success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.failures = 0;
            }
            BreakerState::HalfOpen | BreakerState::Open => {
                inner.state = BreakerState::Closed;
                inner.failures = 0;
                inner.window_start = Instant::now();
                info!("circuit breaker closed");
            }
        }
    }

    fn fail(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                if inner.window_start.elapsed() >= self.window {
                    inner.failures = 0;
                    inner.window_start = Instant::now();
                }
                inner.failures += 1;
                if inner.failures >= self.threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Instant::now();
                    warn!(failures = inner.failures, "circuit breaker opened");
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Instant::now();
                warn!("circuit breaker re-opened after failed trial");
            }
            BreakerState::Open => {
                inner.opened_at = Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> WindowBreaker {
        WindowBreaker::new(3, Duration::from_millis(50))
    }

    #[test]
    fn test_starts_closed_and_allows() {
        let b = breaker();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow_request());
    }

    #[test]
    fn test_opens_at_threshold() {
        let b = breaker();
        b.fail();
        b.fail();
        assert_eq!(b.state(), BreakerState::Closed);
        b.fail();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow_request());
    }

    #[test]
    fn test_mixed_outcomes_below_threshold_stay_closed() {
        let b = breaker();
        b.fail();
        b.fail();
        b.success();
        b.fail();
        b.fail();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow_request());
    }

    #[test]
    fn test_trial_after_window_then_close_on_success() {
        let b = breaker();
        for _ in 0..3 {
            b.fail();
        }
        assert!(!b.allow_request());

        std::thread::sleep(Duration::from_millis(60));
        assert!(b.allow_request());
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow_request());
    }

    #[test]
    fn test_failed_trial_reopens() {
        let b = breaker();
        for _ in 0..3 {
            b.fail();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(b.allow_request());
        b.fail();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow_request());
    }

    #[test]
    fn test_failures_outside_window_do_not_accumulate() {
        let b = breaker();
        b.fail();
        b.fail();
        std::thread::sleep(Duration::from_millis(60));
        // The window rolled: these two failures start a fresh count.
        b.fail();
        b.fail();
        assert_eq!(b.state(), BreakerState::Closed);
    }
}
