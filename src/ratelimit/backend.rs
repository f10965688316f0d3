//! Rate limiter trait for abstracting the counting algorithm.

use std::time::Duration;

/// Admission gate answering "may a new unit of work start right now".
///
/// Implementations must be safe to share across tasks; every mutating call is
/// atomic with respect to every other. None of these methods fail.
pub trait RateLimiter: Send + Sync {
    /// Check without consuming capacity.
    fn is_allowed(&self) -> bool;

    /// Count one admitted unit of work.
    fn record_request(&self);

    /// Check and record in one step. Returns `false` without recording when
    /// the window is exhausted.
    fn try_acquire(&self) -> bool;

    /// Advisory wait before capacity frees up; zero while allowed.
    fn retry_after(&self) -> Duration;
}
