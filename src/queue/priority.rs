//! Priority queue that rejects when full.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::arena::QueueArena;
use super::item::{CommandRequest, Outcome, QueueStatus, QueuedContext, RequestId};
use super::{QueueHandler, QueueStrategy};
use crate::error::QueueError;

/// Heap entry: higher priority first, then earlier arrival.
struct HeapEntry {
    priority: i32,
    sequence: u64,
    item: Arc<QueuedContext>,
}

impl HeapEntry {
    fn new(item: Arc<QueuedContext>) -> Self {
        Self {
            priority: item.priority(),
            sequence: item.sequence(),
            item,
        }
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Priority queue handler.
///
/// Enqueue never waits: a full queue is reported as [`QueueError::QueueFull`].
pub struct PriorityQueueHandler {
    arena: QueueArena,
    heap: Mutex<BinaryHeap<HeapEntry>>,
}

impl PriorityQueueHandler {
    pub fn new(arena: QueueArena) -> Self {
        Self {
            arena,
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    fn push(&self, request: CommandRequest) -> Result<Arc<QueuedContext>, QueueError> {
        let mut heap = self.heap.lock();
        let permit = self.arena.try_acquire_slot()?;
        let item = self.arena.admit(request, permit);
        heap.push(HeapEntry::new(item.clone()));
        Ok(item)
    }
}

/// Higher priorities shorten the estimate, down to a tenth.
pub(crate) fn priority_wait_multiplier(priority: i32) -> f64 {
    (1.0 - f64::from(priority) * 0.1).max(0.1)
}

#[async_trait]
impl QueueHandler for PriorityQueueHandler {
    fn strategy(&self) -> QueueStrategy {
        QueueStrategy::Priority
    }

    fn arena(&self) -> &QueueArena {
        &self.arena
    }

    async fn enqueue(&self, request: CommandRequest) -> Result<RequestId, QueueError> {
        let priority = request.priority;
        let item = self.push(request)?;
        info!(
            request_id = %item.id(),
            priority,
            queue_length = self.arena.queued_len(),
            "Item enqueued"
        );
        Ok(item.id())
    }

    fn dequeue(&self) -> Option<Arc<QueuedContext>> {
        let mut heap = self.heap.lock();
        let now = Utc::now();

        while let Some(HeapEntry { item, .. }) = heap.pop() {
            if item.status() != QueueStatus::Queued {
                trace!(request_id = %item.id(), status = %item.status(), "Skipping settled item");
                continue;
            }
            if item.is_expired_at(now) {
                if self.arena.expire(&item).is_ok() {
                    debug!(request_id = %item.id(), "Discarded expired item at dequeue");
                }
                continue;
            }
            match self.arena.transition(&item, QueueStatus::Ready, Outcome::None) {
                Ok(_) => return Some(item),
                Err(err) => {
                    debug!(request_id = %item.id(), error = %err, "Item settled during dequeue");
                }
            }
        }
        None
    }

    fn queued_in_order(&self) -> Vec<Arc<QueuedContext>> {
        let mut items = self.arena.queued_items();
        items.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.sequence().cmp(&b.sequence()))
        });
        items
    }

    fn wait_multiplier(&self, priority: i32) -> f64 {
        priority_wait_multiplier(priority)
    }

    fn prune(&self) {
        let mut heap = self.heap.lock();
        let before = heap.len();
        heap.retain(|entry| entry.item.status() == QueueStatus::Queued);
        let dropped = before - heap.len();
        if dropped > 0 {
            debug!(dropped, "Pruned settled heap entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::CleanupLog;
    use serde_json::json;
    use std::time::Duration;

    fn handler(capacity: usize, timeout: Duration) -> PriorityQueueHandler {
        PriorityQueueHandler::new(QueueArena::new(
            capacity,
            timeout,
            Duration::from_secs(1),
            Arc::new(CleanupLog::new(10)),
        ))
    }

    #[tokio::test]
    async fn test_higher_priority_first_with_arrival_tie_break() {
        let queue = handler(10, Duration::from_secs(60));
        let low = queue
            .enqueue(CommandRequest::new(json!("low")).with_priority(1))
            .await
            .unwrap();
        let high_a = queue
            .enqueue(CommandRequest::new(json!("high-a")).with_priority(5))
            .await
            .unwrap();
        let high_b = queue
            .enqueue(CommandRequest::new(json!("high-b")).with_priority(5))
            .await
            .unwrap();
        let mid = queue
            .enqueue(CommandRequest::new(json!("mid")).with_priority(3))
            .await
            .unwrap();

        let order: Vec<_> = std::iter::from_fn(|| queue.dequeue()).map(|i| i.id()).collect();
        assert_eq!(order, vec![high_a, high_b, mid, low]);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let queue = handler(2, Duration::from_secs(60));
        queue.enqueue(CommandRequest::new(json!(1))).await.unwrap();
        queue.enqueue(CommandRequest::new(json!(2))).await.unwrap();

        let err = queue.enqueue(CommandRequest::new(json!(3))).await.unwrap_err();
        assert_eq!(err, QueueError::QueueFull { capacity: 2 });
        assert_eq!(queue.queue_length(), 2);
        assert_eq!(queue.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_capacity_never_exceeded_under_contention() {
        let queue = Arc::new(handler(5, Duration::from_secs(60)));
        let attempts = (0..40).map(|i| {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(CommandRequest::new(json!(i)).with_priority(i % 4))
                    .await
            })
        });

        let results = futures::future::join_all(attempts).await;
        let admitted = results.into_iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
        assert_eq!(admitted, 5);
        assert_eq!(queue.queue_length(), 5);
    }

    #[tokio::test]
    async fn test_estimated_wait_scales_with_priority() {
        let queue = handler(10, Duration::from_secs(60));
        queue
            .enqueue(CommandRequest::new(json!("a")).with_priority(5))
            .await
            .unwrap();
        let second = queue
            .enqueue(CommandRequest::new(json!("b")).with_priority(5))
            .await
            .unwrap();
        let status = queue.get_queue_status(&second).unwrap();
        assert_eq!(status.position, 2);
        assert_eq!(status.estimated_wait_seconds, 1);

        assert_eq!(priority_wait_multiplier(0), 1.0);
        assert_eq!(priority_wait_multiplier(20), 0.1);
        assert!(priority_wait_multiplier(-5) > 1.0);
    }

    #[tokio::test]
    async fn test_prune_drops_swept_entries() {
        let queue = handler(4, Duration::from_millis(20));
        queue.enqueue(CommandRequest::new(json!("old"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(queue.cleanup_expired_items().len(), 1);
        assert!(queue.heap.lock().is_empty());
    }
}
