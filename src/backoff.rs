//! Per-caller adaptive Retry-After.
//!
//! Each caller that keeps getting deferred sees its hint grow exponentially,
//! scaled up further when many distinct callers are active, with jitter so
//! that deferred callers do not return in lockstep.

use dashmap::DashMap;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::BackoffSettings;
use crate::queue::retry_after_secs;

/// Largest exponent applied to the base delay.
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Window over which callers count as active for the load signal.
const LOAD_WINDOW: Duration = Duration::from_secs(60);

const JITTER_MIN: f64 = 0.8;
const JITTER_MAX: f64 = 1.2;

#[derive(Debug, Clone, Copy)]
struct ClientRetryState {
    retry_count: u32,
    last_request_at: Instant,
}

pub struct AdaptiveDelayHandler {
    clients: DashMap<String, ClientRetryState>,
    base_delay: Duration,
    max_delay: Duration,
    max_requests_per_minute: u32,
    inactivity_window: Duration,
}

impl AdaptiveDelayHandler {
    pub fn new(settings: &BackoffSettings) -> Self {
        Self {
            clients: DashMap::new(),
            base_delay: Duration::from_secs(settings.base_retry_after_secs),
            max_delay: Duration::from_secs(settings.max_retry_after_secs),
            max_requests_per_minute: settings.max_requests_per_minute,
            inactivity_window: Duration::from_secs(settings.inactivity_window_secs),
        }
    }

    /// Next Retry-After for `client_id`, in whole seconds.
    ///
    /// Every call counts as one more deferral for the caller.
    pub fn calculate_retry_after(&self, client_id: &str, system_load: f64) -> u64 {
        retry_after_secs(self.calculate_delay(client_id, system_load)).min(self.max_retry_after_secs())
    }

    /// Same as [`calculate_retry_after`](Self::calculate_retry_after) with
    /// sub-second precision.
    pub fn calculate_delay(&self, client_id: &str, system_load: f64) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        let now = Instant::now();

        let mut entry = self
            .clients
            .entry(client_id.to_string())
            .or_insert(ClientRetryState {
                retry_count: 0,
                last_request_at: now,
            });
        let retry_count = entry.retry_count;
        entry.retry_count = retry_count.saturating_add(1);
        entry.last_request_at = now;
        drop(entry);

        let delay = self.delay_for(retry_count, system_load, jitter);
        debug!(
            client_id,
            retry_count,
            system_load,
            delay_ms = delay.as_millis() as u64,
            "Computed adaptive delay"
        );
        delay
    }

    /// `base × 2^min(n, 6) × (1 + load) × jitter`, capped at the maximum.
    fn delay_for(&self, retry_count: u32, system_load: f64, jitter: f64) -> Duration {
        let exponential =
            self.base_delay.as_secs_f64() * 2f64.powi(retry_count.min(MAX_BACKOFF_EXPONENT) as i32);
        let load_multiplier = 1.0 + system_load.clamp(0.0, 1.0);
        let secs = (exponential * load_multiplier * jitter).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Forget a caller's deferral history after it is admitted.
    pub fn reset_client_retry_count(&self, client_id: &str) {
        if let Some(mut entry) = self.clients.get_mut(client_id) {
            entry.retry_count = 0;
            entry.last_request_at = Instant::now();
        }
    }

    pub fn retry_count(&self, client_id: &str) -> u32 {
        self.clients.get(client_id).map_or(0, |entry| entry.retry_count)
    }

    /// Callers active in the last minute relative to the configured ceiling,
    /// in `[0, 1]`.
    pub fn current_system_load(&self) -> f64 {
        if self.max_requests_per_minute == 0 {
            return 1.0;
        }
        let now = Instant::now();
        let active = self
            .clients
            .iter()
            .filter(|entry| now.duration_since(entry.last_request_at) <= LOAD_WINDOW)
            .count();
        (active as f64 / f64::from(self.max_requests_per_minute)).clamp(0.0, 1.0)
    }

    /// Purge callers idle longer than the inactivity window.
    pub fn cleanup_old_entries(&self) -> usize {
        let now = Instant::now();
        let before = self.clients.len();
        self.clients
            .retain(|_, state| now.duration_since(state.last_request_at) <= self.inactivity_window);
        let removed = before.saturating_sub(self.clients.len());
        if removed > 0 {
            info!(removed, "Purged idle caller retry state");
        }
        removed
    }

    /// Ceiling on any Retry-After handed to a caller, in whole seconds.
    pub fn max_retry_after_secs(&self) -> u64 {
        self.max_delay.as_secs()
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }
}
