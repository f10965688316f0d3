//! Id-indexed store shared by both queue strategies.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit, TryAcquireError};
use tracing::{debug, info, warn};

use super::cleanup::{CleanupLog, CleanupReason, CleanupRecord};
use super::item::{CommandRequest, Outcome, QueueStatus, QueuedContext, RequestId, Transition};
use crate::error::QueueError;

/// Single owner of every tracked item.
///
/// Capacity is a semaphore with one permit per queue slot. A permit is held
/// for exactly as long as its item is `Queued`; every status change goes
/// through [`QueueArena::transition`] so the permit is handed back on the
/// move out of `Queued`.
pub struct QueueArena {
    items: DashMap<RequestId, Arc<QueuedContext>>,
    slots: Semaphore,
    queued: AtomicUsize,
    sequence: AtomicU64,
    capacity: usize,
    item_timeout: chrono::Duration,
    service_time: Duration,
    cleanup_log: Arc<CleanupLog>,
}

impl QueueArena {
    pub fn new(
        capacity: usize,
        item_timeout: Duration,
        service_time: Duration,
        cleanup_log: Arc<CleanupLog>,
    ) -> Self {
        let item_timeout =
            chrono::Duration::from_std(item_timeout).unwrap_or(chrono::Duration::MAX);
        Self {
            items: DashMap::new(),
            slots: Semaphore::new(capacity),
            queued: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
            capacity,
            item_timeout,
            service_time,
            cleanup_log,
        }
    }

    /// Wait until a slot frees up. Dropping the future gives up the wait
    /// without side effects.
    pub async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>, QueueError> {
        self.slots.acquire().await.map_err(|_| QueueError::Closed)
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire_slot(&self) -> Result<SemaphorePermit<'_>, QueueError> {
        self.slots.try_acquire().map_err(|e| match e {
            TryAcquireError::NoPermits => QueueError::QueueFull {
                capacity: self.capacity,
            },
            TryAcquireError::Closed => QueueError::Closed,
        })
    }

    /// Create and index an item that occupies `permit`'s slot.
    pub fn admit(&self, request: CommandRequest, permit: SemaphorePermit<'_>) -> Arc<QueuedContext> {
        let queued_at = Utc::now();
        // Saturate so an oversized timeout means "never expires".
        let expires_at = queued_at
            .checked_add_signed(self.item_timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let item = Arc::new(QueuedContext::new(request, sequence, queued_at, expires_at));

        // The slot now belongs to the item and is returned by `transition`.
        permit.forget();
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.items.insert(item.id(), item.clone());
        item
    }

    /// Apply a status change, releasing the slot when the item leaves `Queued`.
    pub fn transition(
        &self,
        item: &QueuedContext,
        to: QueueStatus,
        outcome: Outcome,
    ) -> Result<Transition, QueueError> {
        let transition = item.transition(to, outcome)?;
        Ok(self.settle(item, transition))
    }

    /// Apply a status change only if the item is still in `expected`.
    pub fn transition_from(
        &self,
        item: &QueuedContext,
        expected: QueueStatus,
        to: QueueStatus,
        outcome: Outcome,
    ) -> Result<Transition, QueueError> {
        let transition = item.transition_from(expected, to, outcome)?;
        Ok(self.settle(item, transition))
    }

    fn settle(&self, item: &QueuedContext, transition: Transition) -> Transition {
        if transition.left_queued() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.slots.add_permits(1);
        }
        if transition.changed() {
            debug!(
                request_id = %item.id(),
                from = %transition.from,
                to = %transition.to,
                "Item status updated"
            );
        }
        transition
    }

    pub fn transition_by_id(
        &self,
        id: &RequestId,
        to: QueueStatus,
        outcome: Outcome,
    ) -> Result<Transition, QueueError> {
        let item = self.get(id).ok_or(QueueError::NotFound(*id))?;
        self.transition(&item, to, outcome)
    }

    /// Mark an item `Expired`. Already-expired items are left as they are.
    pub fn expire(&self, item: &QueuedContext) -> Result<Transition, QueueError> {
        self.transition(item, QueueStatus::Expired, Outcome::Error("Request expired".to_string()))
    }

    pub fn get(&self, id: &RequestId) -> Option<Arc<QueuedContext>> {
        self.items.get(id).map(|entry| entry.value().clone())
    }

    /// Drop an item from the index without recording it.
    pub fn remove(&self, id: &RequestId) -> Option<Arc<QueuedContext>> {
        self.items.remove(id).map(|(_, item)| item)
    }

    /// Remove an item and record why. Only the caller that actually removes
    /// the item writes a record.
    pub fn retire(&self, id: &RequestId, reason: CleanupReason) -> Option<CleanupRecord> {
        let item = self.remove(id)?;
        let record = CleanupRecord::new(&item, reason, Utc::now());
        info!(
            request_id = %id,
            reason = %reason,
            life_span_ms = record.life_span_ms,
            "Item removed from queue"
        );
        self.cleanup_log.push(record.clone());
        Some(record)
    }

    /// Expire and remove every `Queued`/`Ready` item past its deadline, plus
    /// items already marked `Expired` by a dequeue.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<CleanupRecord> {
        let candidates: Vec<Arc<QueuedContext>> = self
            .items
            .iter()
            .filter(|entry| {
                let item = entry.value();
                item.status() == QueueStatus::Expired || item.should_expire(now)
            })
            .map(|entry| entry.value().clone())
            .collect();

        let mut records = Vec::with_capacity(candidates.len());
        for item in candidates {
            if let Err(err) = self.expire(&item) {
                // Claimed by a driver between the scan and now.
                debug!(request_id = %item.id(), error = %err, "Skipping expiry");
                continue;
            }
            if let Some(record) = self.retire(&item.id(), CleanupReason::Expired) {
                records.push(record);
            }
        }

        if !records.is_empty() {
            warn!(count = records.len(), "Expired items reclaimed");
        }
        records
    }

    /// Every tracked item in arrival order.
    pub fn snapshot(&self) -> Vec<Arc<QueuedContext>> {
        let mut items: Vec<_> = self.items.iter().map(|entry| entry.value().clone()).collect();
        items.sort_by_key(|item| item.sequence());
        items
    }

    /// Items currently holding a slot, unordered.
    pub fn queued_items(&self) -> Vec<Arc<QueuedContext>> {
        self.items
            .iter()
            .filter(|entry| entry.value().status() == QueueStatus::Queued)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn service_time(&self) -> Duration {
        self.service_time
    }

    /// Fail pending and future slot waits.
    pub fn close(&self) {
        self.slots.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arena(capacity: usize, timeout: Duration) -> QueueArena {
        QueueArena::new(
            capacity,
            timeout,
            Duration::from_secs(1),
            Arc::new(CleanupLog::new(10)),
        )
    }

    #[tokio::test]
    async fn test_slot_returned_when_leaving_queued() {
        let arena = arena(1, Duration::from_secs(60));
        let permit = arena.try_acquire_slot().unwrap();
        let item = arena.admit(CommandRequest::new(json!("a")), permit);

        assert_eq!(arena.queued_len(), 1);
        assert!(matches!(
            arena.try_acquire_slot(),
            Err(QueueError::QueueFull { capacity: 1 })
        ));

        arena.transition(&item, QueueStatus::Ready, Outcome::None).unwrap();
        assert_eq!(arena.queued_len(), 0);
        assert!(arena.try_acquire_slot().is_ok());
    }

    #[tokio::test]
    async fn test_repeated_status_write_releases_once() {
        let arena = arena(2, Duration::from_secs(60));
        let permit = arena.try_acquire_slot().unwrap();
        let item = arena.admit(CommandRequest::new(json!("a")), permit);

        arena.transition(&item, QueueStatus::Ready, Outcome::None).unwrap();
        arena.transition(&item, QueueStatus::Ready, Outcome::None).unwrap();
        arena.transition(&item, QueueStatus::Processing, Outcome::None).unwrap();

        assert_eq!(arena.queued_len(), 0);
        let first = arena.try_acquire_slot().unwrap();
        let second = arena.try_acquire_slot().unwrap();
        assert!(arena.try_acquire_slot().is_err());
        drop((first, second));
    }

    #[tokio::test]
    async fn test_sweep_records_each_item_once() {
        let arena = arena(4, Duration::from_millis(10));
        let permit = arena.try_acquire_slot().unwrap();
        let item = arena.admit(CommandRequest::new(json!("old")), permit);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let records = arena.sweep_expired(Utc::now());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].request_id, item.id());
        assert_eq!(records[0].reason, CleanupReason::Expired);
        assert_eq!(item.status(), QueueStatus::Expired);
        assert!(arena.get(&item.id()).is_none());
        assert_eq!(arena.queued_len(), 0);

        assert!(arena.sweep_expired(Utc::now()).is_empty());
        assert!(arena.retire(&item.id(), CleanupReason::Expired).is_none());
    }

    #[tokio::test]
    async fn test_sweep_spares_claimed_items() {
        let arena = arena(4, Duration::from_millis(10));
        let permit = arena.try_acquire_slot().unwrap();
        let item = arena.admit(CommandRequest::new(json!("busy")), permit);
        arena.transition(&item, QueueStatus::Ready, Outcome::None).unwrap();
        arena.transition(&item, QueueStatus::Processing, Outcome::None).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(arena.sweep_expired(Utc::now()).is_empty());
        assert_eq!(item.status(), QueueStatus::Processing);
        assert!(arena.get(&item.id()).is_some());
    }

    #[tokio::test]
    async fn test_oversized_timeout_never_expires() {
        let arena = arena(1, Duration::from_secs(u64::MAX));
        let permit = arena.try_acquire_slot().unwrap();
        let item = arena.admit(CommandRequest::new(json!("forever")), permit);

        assert_eq!(item.expires_at(), DateTime::<Utc>::MAX_UTC);
        assert!(!item.should_expire(Utc::now()));
        assert!(arena.sweep_expired(Utc::now()).is_empty());
    }

    #[tokio::test]
    async fn test_closed_arena_rejects_slots() {
        let arena = arena(1, Duration::from_secs(60));
        arena.close();
        assert!(matches!(arena.try_acquire_slot(), Err(QueueError::Closed)));
        assert!(matches!(arena.acquire_slot().await, Err(QueueError::Closed)));
    }
}
