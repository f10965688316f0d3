//! Admission rate limiting.

mod backend;
mod counter;
mod limiter;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use backend::RateLimiter;
pub use counter::FixedWindowLimiter;
pub use limiter::SlidingWindowLimiter;

use crate::config::RateLimitSettings;

/// Counting algorithm used by the admission gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitAlgorithm {
    Fixed,
    #[default]
    Sliding,
}

/// Build the configured limiter.
pub fn build_limiter(settings: &RateLimitSettings) -> Arc<dyn RateLimiter> {
    match settings.algorithm {
        RateLimitAlgorithm::Fixed => {
            Arc::new(FixedWindowLimiter::new(settings.max_requests, settings.window()))
        }
        RateLimitAlgorithm::Sliding => {
            Arc::new(SlidingWindowLimiter::new(settings.max_requests, settings.window()))
        }
    }
}
