//! Admission decisions and the request lifecycle around the queue.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::AdaptiveDelayHandler;
use crate::config::GatehouseConfig;
use crate::error::QueueError;
use crate::queue::{
    build_queue, retry_after_secs, CleanupLog, CleanupReason, CleanupRecord, CleanupSummary,
    CommandRequest, CommandResponse, Outcome, QueueHandler, QueueStatus, QueueStatusSnapshot,
    QueueStrategy, QueuedContext, RequestId,
};
use crate::ratelimit::{build_limiter, RateLimiter};

/// Reason reported to every deferred or rejected caller.
pub const REJECTION_REASON: &str = "Rate Limit Exceeded or Queue Full.";

/// Retry guidance for a caller that was not admitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deferral {
    pub retry_after_seconds: u64,
    pub queue_length: usize,
    pub max_capacity: usize,
    pub reason: &'static str,
}

/// Result of [`CommandQueueProvider::admit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Run the command now; its rate-limit slot is already taken.
    Admitted,
    /// Deferred into the queue.
    Queued {
        request_id: RequestId,
        position: usize,
        deferral: Deferral,
    },
    /// Neither admitted nor queued.
    Rejected(Deferral),
}

/// Result of trying to take ownership of a queued item.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The caller now drives the item; it is `Processing`.
    Claimed(Arc<QueuedContext>),
    /// Still waiting for its turn.
    Pending { position: usize },
    /// Another driver already owns it.
    InProgress(QueueStatus),
    /// Expired before it could be claimed and has been reclaimed.
    Expired,
    NotFound,
}

/// Result of waiting on an item's completion signal.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Completed(CommandResponse),
    /// Promoted and waiting for its caller to drive it.
    Ready,
    /// Timed out or the waiter gave up; the item is untouched.
    Pending(QueueStatus),
    NotFound,
}

/// Result of one promoter step.
#[derive(Debug, Clone)]
pub enum Promotion {
    Promoted(Arc<QueuedContext>),
    /// Nothing eligible is queued.
    Idle,
    /// Items are waiting but the rate limit is exhausted.
    Throttled(Duration),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub strategy: QueueStrategy,
    pub queue_length: usize,
    pub max_capacity: usize,
    pub can_accept_request: bool,
    pub retry_after_seconds: u64,
    pub tracked_clients: usize,
    pub total_cleaned: u64,
    pub timestamp: DateTime<Utc>,
}

/// Front door of the service: admits, defers or rejects requests and manages
/// the lifecycle of the ones it defers.
pub struct CommandQueueProvider {
    queue: Arc<dyn QueueHandler>,
    limiter: Arc<dyn RateLimiter>,
    backoff: AdaptiveDelayHandler,
    cleanup_log: Arc<CleanupLog>,
    enqueue_timeout: Duration,
}

impl CommandQueueProvider {
    pub fn new(
        queue: Arc<dyn QueueHandler>,
        limiter: Arc<dyn RateLimiter>,
        backoff: AdaptiveDelayHandler,
        cleanup_log: Arc<CleanupLog>,
        enqueue_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            limiter,
            backoff,
            cleanup_log,
            enqueue_timeout,
        }
    }

    pub fn from_config(config: &GatehouseConfig) -> Self {
        let cleanup_log = Arc::new(CleanupLog::new(config.queue.cleanup_history_limit));
        Self::new(
            build_queue(&config.queue, cleanup_log.clone()),
            build_limiter(&config.rate_limit),
            AdaptiveDelayHandler::new(&config.backoff),
            cleanup_log,
            config.queue.enqueue_timeout(),
        )
    }

    /// Decide what happens to a new request from `client_id`.
    ///
    /// Requests are admitted only when the queue has room and the rate limit
    /// grants a slot. Otherwise they are queued, waiting at most the
    /// configured enqueue timeout for a slot, or rejected.
    pub async fn admit(
        &self,
        data: Value,
        priority: i32,
        client_id: &str,
    ) -> Result<Admission, QueueError> {
        if !self.queue.is_queue_full() && self.limiter.try_acquire() {
            self.backoff.reset_client_retry_count(client_id);
            debug!(client_id, "Request admitted directly");
            return Ok(Admission::Admitted);
        }

        let request = CommandRequest::new(data).with_priority(priority);
        let enqueued = tokio::time::timeout(self.enqueue_timeout, self.queue.enqueue(request)).await;
        let deferral = self.deferral(client_id);

        match enqueued {
            Ok(Ok(request_id)) => {
                let position = self
                    .queue
                    .get_queue_status(&request_id)
                    .map_or(0, |status| status.position);
                info!(
                    request_id = %request_id,
                    client_id,
                    position,
                    retry_after = deferral.retry_after_seconds,
                    "Request queued"
                );
                Ok(Admission::Queued {
                    request_id,
                    position,
                    deferral,
                })
            }
            Ok(Err(QueueError::QueueFull { .. })) | Ok(Err(QueueError::Closed)) | Err(_) => {
                warn!(
                    client_id,
                    queue_length = deferral.queue_length,
                    "Request rejected"
                );
                Ok(Admission::Rejected(deferral))
            }
            Ok(Err(err)) => Err(err),
        }
    }

    fn deferral(&self, client_id: &str) -> Deferral {
        Deferral {
            retry_after_seconds: self.retry_hint(client_id),
            queue_length: self.queue.queue_length(),
            max_capacity: self.queue.max_capacity(),
            reason: REJECTION_REASON,
        }
    }

    /// Retry-After for a deferred caller: the later of when the rate limit
    /// frees up and the caller's adaptive backoff, capped at the configured
    /// maximum.
    pub fn retry_hint(&self, client_id: &str) -> u64 {
        let load = self.backoff.current_system_load();
        let adaptive = self.backoff.calculate_delay(client_id, load);
        self.capped_hint(self.limiter.retry_after().max(adaptive))
    }

    fn capped_hint(&self, delay: Duration) -> u64 {
        retry_after_secs(delay).min(self.backoff.max_retry_after_secs())
    }

    /// Enqueue without an admission check.
    pub async fn enqueue_command(
        &self,
        data: Value,
        priority: i32,
        cancel: &CancellationToken,
    ) -> Result<RequestId, QueueError> {
        let request = CommandRequest::new(data).with_priority(priority);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            result = self.queue.enqueue(request) => result,
        }
    }

    pub fn is_queue_full(&self) -> bool {
        self.queue.is_queue_full()
    }

    pub fn queue_length(&self) -> usize {
        self.queue.queue_length()
    }

    pub fn max_capacity(&self) -> usize {
        self.queue.max_capacity()
    }

    pub fn strategy(&self) -> QueueStrategy {
        self.queue.strategy()
    }

    /// Wait up to `timeout` for the item to become `Ready` or reach a
    /// terminal state. Returns at once if it already has.
    ///
    /// Giving up, by timeout or through `cancel`, never changes the item.
    pub async fn wait_for_response(
        &self,
        id: &RequestId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        let Some(item) = self.queue.get(id) else {
            return WaitOutcome::NotFound;
        };
        let mut updates = item.subscribe();

        let finished = async {
            updates
                .wait_for(|state| {
                    state.status == QueueStatus::Ready || state.status.is_terminal()
                })
                .await
                .map(|state| state.clone())
        };

        tokio::select! {
            _ = cancel.cancelled() => WaitOutcome::Pending(item.status()),
            waited = tokio::time::timeout(timeout, finished) => match waited {
                Ok(Ok(state)) if state.status == QueueStatus::Ready => WaitOutcome::Ready,
                Ok(Ok(state)) => CommandResponse::from_state(&state)
                    .map_or(WaitOutcome::Pending(state.status), WaitOutcome::Completed),
                Ok(Err(_)) | Err(_) => WaitOutcome::Pending(item.status()),
            },
        }
    }

    /// Every tracked item, oldest first.
    pub fn get_all_queued_commands(&self) -> Vec<Arc<QueuedContext>> {
        self.queue.snapshot()
    }

    pub fn get_queue_status(&self, id: &RequestId) -> Option<QueueStatusSnapshot> {
        self.queue.get_queue_status(id)
    }

    /// Take ownership of a `Ready` item so the caller can execute it.
    pub fn execute_ready_request(&self, id: &RequestId) -> ClaimOutcome {
        let Some(item) = self.queue.get(id) else {
            return ClaimOutcome::NotFound;
        };

        if item.should_expire(Utc::now()) || item.status() == QueueStatus::Expired {
            return self.reclaim_expired(&item);
        }

        match item.status() {
            QueueStatus::Queued => ClaimOutcome::Pending {
                position: self
                    .queue
                    .get_queue_status(id)
                    .map_or(0, |status| status.position),
            },
            QueueStatus::Ready => match self.queue.arena().transition_from(
                &item,
                QueueStatus::Ready,
                QueueStatus::Processing,
                Outcome::None,
            ) {
                Ok(_) => {
                    info!(request_id = %id, "Request claimed for execution");
                    ClaimOutcome::Claimed(item)
                }
                Err(QueueError::InvalidTransition {
                    from: QueueStatus::Expired,
                    ..
                }) => self.reclaim_expired(&item),
                Err(_) => ClaimOutcome::InProgress(item.status()),
            },
            status => ClaimOutcome::InProgress(status),
        }
    }

    fn reclaim_expired(&self, item: &QueuedContext) -> ClaimOutcome {
        match self.queue.arena().expire(item) {
            Ok(_) => {
                self.queue.retire(&item.id(), CleanupReason::Expired);
                ClaimOutcome::Expired
            }
            Err(_) => ClaimOutcome::InProgress(item.status()),
        }
    }

    /// Settle a driven item and drop it from the queue.
    ///
    /// Returns the status the item ended in. Completing an item twice, or one
    /// that already expired, leaves the first outcome in place.
    pub fn finish_and_remove(&self, item: &QueuedContext, response: CommandResponse) -> QueueStatus {
        if item.should_expire(Utc::now()) {
            self.reclaim_expired(item);
            return item.status();
        }

        let (to, outcome) = if response.success {
            (
                QueueStatus::Finished,
                Outcome::Result(response.data.unwrap_or(Value::Null)),
            )
        } else {
            (QueueStatus::Failed, Outcome::Error(response.message))
        };

        match self.queue.arena().transition(item, to, outcome) {
            Ok(transition) if transition.changed() => {
                self.queue.remove(&item.id());
                info!(request_id = %item.id(), status = %to, "Request finished");
            }
            Ok(_) => {
                debug!(request_id = %item.id(), "Request already finished");
            }
            Err(QueueError::InvalidTransition {
                from: QueueStatus::Expired,
                ..
            }) => {
                self.queue.retire(&item.id(), CleanupReason::Expired);
            }
            Err(err) => {
                debug!(request_id = %item.id(), error = %err, "Ignoring late completion");
            }
        }
        item.status()
    }

    /// Move the next queued item to `Ready` if the rate limit allows it.
    ///
    /// Must only be called from a single promoter task.
    pub fn promote_next(&self) -> Promotion {
        if self.queue.queue_length() == 0 {
            return Promotion::Idle;
        }
        if !self.limiter.is_allowed() {
            return Promotion::Throttled(self.limiter.retry_after());
        }
        match self.queue.dequeue() {
            Some(item) => {
                self.limiter.record_request();
                info!(request_id = %item.id(), "Request ready for execution");
                Promotion::Promoted(item)
            }
            None => Promotion::Idle,
        }
    }

    /// Withdraw an item that is still waiting in the queue.
    pub fn cancel_request(&self, id: &RequestId) -> Result<CleanupRecord, QueueError> {
        let item = self.queue.get(id).ok_or(QueueError::NotFound(*id))?;
        self.queue.arena().transition_from(
            &item,
            QueueStatus::Queued,
            QueueStatus::Failed,
            Outcome::Error("Request cancelled".to_string()),
        )?;
        self.queue
            .retire(id, CleanupReason::Cancelled)
            .ok_or(QueueError::NotFound(*id))
    }

    /// Reclaim expired items; returns how many were removed.
    pub fn cleanup_expired_requests(&self) -> usize {
        self.queue.cleanup_expired_items().len()
    }

    /// Forget backoff state for callers that went quiet.
    pub fn cleanup_idle_clients(&self) -> usize {
        self.backoff.cleanup_old_entries()
    }

    pub fn get_cleanup_summary(&self) -> CleanupSummary {
        self.cleanup_log.summary()
    }

    pub fn health(&self) -> HealthSnapshot {
        let can_accept_request = self.limiter.is_allowed();
        let retry_after_seconds = if can_accept_request {
            0
        } else {
            self.capped_hint(self.limiter.retry_after())
        };
        HealthSnapshot {
            status: "Healthy",
            strategy: self.queue.strategy(),
            queue_length: self.queue.queue_length(),
            max_capacity: self.queue.max_capacity(),
            can_accept_request,
            retry_after_seconds,
            tracked_clients: self.backoff.tracked_clients(),
            total_cleaned: self.cleanup_log.total(),
            timestamp: Utc::now(),
        }
    }

    /// Stop accepting new work; waiting producers fail with `Closed`.
    pub fn close(&self) {
        self.queue.close();
    }
}
