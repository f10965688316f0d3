//! Bounded holding area for deferred requests.
//!
//! Two strategies share one storage layer ([`QueueArena`]) and differ only in
//! ordering and in what happens when the queue is full:
//!
//! - [`FifoQueueHandler`]: arrival order, producers wait for a free slot.
//! - [`PriorityQueueHandler`]: highest priority first, producers are rejected.

mod arena;
mod cleanup;
mod fifo;
mod item;
mod priority;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub use arena::QueueArena;
pub use cleanup::{CleanupLog, CleanupReason, CleanupRecord, CleanupSummary};
pub use fifo::FifoQueueHandler;
pub use item::{
    CommandRequest, CommandResponse, ItemState, Outcome, QueueStatus, QueuedContext, RequestId,
    Transition,
};
pub use priority::PriorityQueueHandler;

use crate::config::QueueSettings;
use crate::error::QueueError;

/// Ordering strategy, chosen once at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum QueueStrategy {
    #[default]
    Fifo,
    Priority,
}

/// Read-only view of one item's progress.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusSnapshot {
    pub request_id: RequestId,
    pub status: QueueStatus,
    /// 1-based place among queued items; 0 once the item has left the queue
    pub position: usize,
    pub estimated_wait_seconds: u64,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Queue operations shared by every strategy.
///
/// Implementors provide ordering (`enqueue`, `dequeue`, `queued_in_order`);
/// everything else is answered by the shared [`QueueArena`].
#[async_trait]
pub trait QueueHandler: Send + Sync {
    fn strategy(&self) -> QueueStrategy;

    fn arena(&self) -> &QueueArena;

    /// Add a request. Whether a full queue waits or fails depends on the
    /// strategy.
    async fn enqueue(&self, request: CommandRequest) -> Result<RequestId, QueueError>;

    /// Hand the next eligible item to a driver, marking it `Ready`.
    /// Never blocks and never returns an expired item.
    fn dequeue(&self) -> Option<Arc<QueuedContext>>;

    /// `Queued` items in the order they will be served.
    fn queued_in_order(&self) -> Vec<Arc<QueuedContext>> {
        let mut items = self.arena().queued_items();
        items.sort_by_key(|item| item.sequence());
        items
    }

    /// Scale applied to the estimated wait of an item with `priority`.
    fn wait_multiplier(&self, _priority: i32) -> f64 {
        1.0
    }

    /// Drop ordering entries for items that are no longer queued.
    fn prune(&self) {}

    fn get_queue_status(&self, id: &RequestId) -> Option<QueueStatusSnapshot> {
        let item = self.arena().get(id)?;
        let state = item.state();

        let position = if state.status == QueueStatus::Queued {
            self.queued_in_order()
                .iter()
                .position(|queued| queued.id() == *id)
                .map_or(0, |index| index + 1)
        } else {
            0
        };
        let estimated_wait = self.arena().service_time().as_secs_f64()
            * position as f64
            * self.wait_multiplier(item.priority());

        Some(QueueStatusSnapshot {
            request_id: item.id(),
            status: state.status,
            position,
            estimated_wait_seconds: estimated_wait.max(0.0) as u64,
            priority: item.priority(),
            queued_at: item.queued_at(),
            expires_at: item.expires_at(),
            processed_at: state.processed_at,
            result: state.result,
            error_message: state.error_message,
        })
    }

    fn update_status(
        &self,
        id: &RequestId,
        status: QueueStatus,
        outcome: Outcome,
    ) -> Result<Transition, QueueError> {
        self.arena().transition_by_id(id, status, outcome)
    }

    /// Items currently occupying a slot.
    fn queue_length(&self) -> usize {
        self.arena().queued_len()
    }

    fn is_queue_full(&self) -> bool {
        self.queue_length() >= self.max_capacity()
    }

    fn max_capacity(&self) -> usize {
        self.arena().capacity()
    }

    /// Expire and reclaim stale items, returning one record per removal.
    fn cleanup_expired_items(&self) -> Vec<CleanupRecord> {
        let records = self.arena().sweep_expired(Utc::now());
        if !records.is_empty() {
            self.prune();
        }
        records
    }

    fn get(&self, id: &RequestId) -> Option<Arc<QueuedContext>> {
        self.arena().get(id)
    }

    /// All tracked items in arrival order.
    fn snapshot(&self) -> Vec<Arc<QueuedContext>> {
        self.arena().snapshot()
    }

    fn remove(&self, id: &RequestId) -> Option<Arc<QueuedContext>> {
        self.arena().remove(id)
    }

    fn retire(&self, id: &RequestId, reason: CleanupReason) -> Option<CleanupRecord> {
        let record = self.arena().retire(id, reason);
        if record.is_some() {
            self.prune();
        }
        record
    }

    fn close(&self) {
        self.arena().close();
    }
}

/// Build the configured queue strategy.
pub fn build_queue(settings: &QueueSettings, cleanup_log: Arc<CleanupLog>) -> Arc<dyn QueueHandler> {
    let arena = QueueArena::new(
        settings.max_capacity,
        settings.item_timeout(),
        settings.service_time_per_item(),
        cleanup_log,
    );
    match settings.strategy {
        QueueStrategy::Fifo => Arc::new(FifoQueueHandler::new(arena)),
        QueueStrategy::Priority => Arc::new(PriorityQueueHandler::new(arena)),
    }
}

/// Whole seconds for a Retry-After hint, rounded up and never zero.
pub fn retry_after_secs(delay: Duration) -> u64 {
    let secs = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(strategy: QueueStrategy) -> QueueSettings {
        QueueSettings {
            strategy,
            max_capacity: 3,
            ..QueueSettings::default()
        }
    }

    #[tokio::test]
    async fn test_build_queue_selects_strategy() {
        let log = Arc::new(CleanupLog::new(10));
        let fifo = build_queue(&settings(QueueStrategy::Fifo), log.clone());
        let priority = build_queue(&settings(QueueStrategy::Priority), log);

        assert_eq!(fifo.strategy(), QueueStrategy::Fifo);
        assert_eq!(priority.strategy(), QueueStrategy::Priority);
        assert_eq!(fifo.max_capacity(), 3);
    }

    #[tokio::test]
    async fn test_update_status_is_monotonic() {
        let queue = build_queue(&settings(QueueStrategy::Fifo), Arc::new(CleanupLog::new(10)));
        let id = queue.enqueue(CommandRequest::new(json!("x"))).await.unwrap();

        queue.update_status(&id, QueueStatus::Ready, Outcome::None).unwrap();
        let err = queue
            .update_status(&id, QueueStatus::Queued, Outcome::None)
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        assert_eq!(queue.get_queue_status(&id).unwrap().status, QueueStatus::Ready);

        let missing = RequestId::new();
        assert_eq!(
            queue.update_status(&missing, QueueStatus::Ready, Outcome::None),
            Err(QueueError::NotFound(missing))
        );
    }

    #[tokio::test]
    async fn test_unknown_id_has_no_status() {
        let queue = build_queue(&settings(QueueStrategy::Priority), Arc::new(CleanupLog::new(10)));
        assert!(queue.get_queue_status(&RequestId::new()).is_none());
    }

    #[test]
    fn test_retry_after_secs_rounds_up() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1500)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(7)), 7);
    }

    #[test]
    fn test_strategy_parses_lowercase() {
        let strategy: QueueStrategy = serde_yaml::from_str("priority").unwrap();
        assert_eq!(strategy, QueueStrategy::Priority);
    }
}
