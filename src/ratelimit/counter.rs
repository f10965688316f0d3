//! Fixed-window rate limit counter.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

use super::backend::RateLimiter;

struct WindowState {
    /// Requests recorded in the current window
    count: u64,
    /// When the current window started
    window_start: Instant,
}

/// A rate limiter that admits `limit` requests per fixed window.
///
/// The count resets when a window boundary passes. Probing never rolls the
/// window; only recording does.
pub struct FixedWindowLimiter {
    state: Mutex<WindowState>,
    limit: u64,
    window: Duration,
}

impl FixedWindowLimiter {
    /// Create a new fixed-window limiter.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            state: Mutex::new(WindowState {
                count: 0,
                window_start: Instant::now(),
            }),
            limit,
            window,
        }
    }

    /// Requests counted in the live window.
    pub fn current_count(&self) -> u64 {
        let state = self.state.lock();
        self.effective_count(&state)
    }

    /// Get the remaining quota.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current_count())
    }

    fn effective_count(&self, state: &WindowState) -> u64 {
        if state.window_start.elapsed() >= self.window {
            0
        } else {
            state.count
        }
    }

    fn roll_window(&self, state: &mut WindowState) {
        if state.window_start.elapsed() >= self.window {
            trace!(previous = state.count, "Fixed window rolled over");
            state.count = 0;
            state.window_start = Instant::now();
        }
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn is_allowed(&self) -> bool {
        let state = self.state.lock();
        self.effective_count(&state) < self.limit
    }

    fn record_request(&self) {
        let mut state = self.state.lock();
        self.roll_window(&mut state);
        state.count += 1;
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.roll_window(&mut state);
        if state.count < self.limit {
            state.count += 1;
            true
        } else {
            false
        }
    }

    fn retry_after(&self) -> Duration {
        let state = self.state.lock();
        if self.effective_count(&state) < self.limit {
            return Duration::ZERO;
        }
        self.window.saturating_sub(state.window_start.elapsed())
    }
}
