//! First-in first-out queue with wait-based backpressure.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::arena::QueueArena;
use super::item::{CommandRequest, Outcome, QueueStatus, QueuedContext, RequestId};
use super::{QueueHandler, QueueStrategy};
use crate::error::QueueError;

/// FIFO queue handler.
///
/// Producers wait for a free slot instead of failing. The channel carries
/// weak handles in arrival order so entries reclaimed by the sweeper are
/// freed even before the consumer reaches them. Pruning compacts the channel
/// so it never holds more than the live queued items.
pub struct FifoQueueHandler {
    arena: QueueArena,
    sender: mpsc::UnboundedSender<Weak<QueuedContext>>,
    receiver: Mutex<mpsc::UnboundedReceiver<Weak<QueuedContext>>>,
    /// Producers share it; compaction takes it exclusively so the re-sent
    /// handles keep arrival order.
    compaction: RwLock<()>,
}

impl FifoQueueHandler {
    pub fn new(arena: QueueArena) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            arena,
            sender,
            receiver: Mutex::new(receiver),
            compaction: RwLock::new(()),
        }
    }

    /// Handles currently in the order channel, live or not.
    pub fn pending_handles(&self) -> usize {
        self.receiver.lock().len()
    }
}

#[async_trait]
impl QueueHandler for FifoQueueHandler {
    fn strategy(&self) -> QueueStrategy {
        QueueStrategy::Fifo
    }

    fn arena(&self) -> &QueueArena {
        &self.arena
    }

    async fn enqueue(&self, request: CommandRequest) -> Result<RequestId, QueueError> {
        let permit = self.arena.acquire_slot().await?;
        let _producer = self.compaction.read();
        let item = self.arena.admit(request, permit);
        let id = item.id();

        if self.sender.send(Arc::downgrade(&item)).is_err() {
            // Receiver lives as long as the handler; treat as shut down.
            let _ = self.arena.transition(&item, QueueStatus::Failed, Outcome::None);
            self.arena.remove(&id);
            return Err(QueueError::Closed);
        }

        info!(
            request_id = %id,
            queue_length = self.arena.queued_len(),
            "Item enqueued"
        );
        Ok(id)
    }

    fn dequeue(&self) -> Option<Arc<QueuedContext>> {
        let mut receiver = self.receiver.lock();
        let now = Utc::now();

        while let Ok(handle) = receiver.try_recv() {
            let Some(item) = handle.upgrade() else {
                continue;
            };
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

    fn prune(&self) {
        let _exclusive = self.compaction.write();
        let mut receiver = self.receiver.lock();

        let mut live = Vec::with_capacity(receiver.len());
        let mut dropped = 0usize;
        while let Ok(handle) = receiver.try_recv() {
            match handle.upgrade() {
                Some(item) if item.status() == QueueStatus::Queued => live.push(handle),
                _ => dropped += 1,
            }
        }
        for handle in live {
            // Cannot fail while `self` holds the receiver.
            let _ = self.sender.send(handle);
        }
        if dropped > 0 {
            debug!(dropped, "Compacted FIFO order channel");
        }
    }
}
