//! Sliding-window rate limiter.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::backend::RateLimiter;

/// Timestamps reserved up front; larger allowances grow on demand.
const PREALLOCATED_SLOTS: usize = 1024;

/// Admits at most `max_requests` within any trailing `window`.
///
/// Keeps one timestamp per admitted request. Expired timestamps are only
/// dropped by mutating calls; read-only checks filter them out instead.
pub struct SlidingWindowLimiter {
    timestamps: Mutex<VecDeque<Instant>>,
    max_requests: usize,
    window: Duration,
}

impl SlidingWindowLimiter {
    /// Create a new sliding-window limiter.
    pub fn new(max_requests: u64, window: Duration) -> Self {
        let max_requests = usize::try_from(max_requests).unwrap_or(usize::MAX);
        Self {
            timestamps: Mutex::new(VecDeque::with_capacity(max_requests.min(PREALLOCATED_SLOTS))),
            max_requests,
            window,
        }
    }

    /// Requests admitted within the trailing window.
    pub fn active_requests(&self) -> usize {
        let timestamps = self.timestamps.lock();
        self.live_count(&timestamps, Instant::now())
    }

    fn live_count(&self, timestamps: &VecDeque<Instant>, now: Instant) -> usize {
        timestamps
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }

    fn evict_expired(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = timestamps.front() {
            if now.duration_since(*oldest) < self.window {
                break;
            }
            timestamps.pop_front();
        }
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn is_allowed(&self) -> bool {
        let timestamps = self.timestamps.lock();
        self.live_count(&timestamps, Instant::now()) < self.max_requests
    }

    fn record_request(&self) {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        self.evict_expired(&mut timestamps, now);
        timestamps.push_back(now);
    }

    fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        self.evict_expired(&mut timestamps, now);
        if timestamps.len() < self.max_requests {
            timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    fn retry_after(&self) -> Duration {
        let now = Instant::now();
        let timestamps = self.timestamps.lock();
        let live: Vec<&Instant> = timestamps
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .collect();
        if live.len() < self.max_requests {
            return Duration::ZERO;
        }

        // Capacity frees once enough of the oldest live entries age out.
        let freeing = live.len() - self.max_requests;
        match live.get(freeing) {
            Some(oldest) => (**oldest + self.window).saturating_duration_since(now),
            None => self.window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_huge_allowance_does_not_preallocate() {
        let limiter = SlidingWindowLimiter::new(u64::MAX, Duration::from_secs(10));
        assert!(limiter.try_acquire());
        assert_eq!(limiter.active_requests(), 1);
        assert!(limiter.timestamps.lock().capacity() < 1 << 20);
    }

    #[test]
    fn test_admits_up_to_limit() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(10));

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.active_requests(), 2);
    }

    #[test]
    fn test_is_allowed_is_side_effect_free() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(10));

        for _ in 0..5 {
            assert!(limiter.is_allowed());
        }
        assert_eq!(limiter.active_requests(), 0);
    }

    #[test]
    fn test_retry_after_tracks_oldest_request() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(10));

        assert_eq!(limiter.retry_after(), Duration::ZERO);
        limiter.record_request();

        let retry_after = limiter.retry_after();
        assert!(retry_after > Duration::from_secs(9));
        assert!(retry_after <= Duration::from_secs(10));
    }

    #[test]
    fn test_record_request_can_overshoot() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(10));

        limiter.record_request();
        limiter.record_request();
        assert_eq!(limiter.active_requests(), 2);
        assert!(!limiter.is_allowed());
    }

    #[test]
    fn test_window_slides() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_millis(30));

        assert!(limiter.try_acquire());
        assert!(!limiter.is_allowed());

        std::thread::sleep(Duration::from_millis(40));

        assert!(limiter.is_allowed());
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_concurrent_acquire_respects_limit() {
        use std::sync::Arc;

        let limiter = Arc::new(SlidingWindowLimiter::new(5, Duration::from_secs(10)));
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.try_acquire())
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 5);
    }
}
