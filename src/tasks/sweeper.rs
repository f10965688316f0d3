//! Periodic reclamation of expired items and idle caller state.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::provider::CommandQueueProvider;

/// Spawn the periodic reclamation of expired items and idle caller state.
pub fn spawn_sweeper(
    provider: Arc<CommandQueueProvider>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_sweeper_loop(provider, period, cancel).await;
    })
}

async fn run_sweeper_loop(
    provider: Arc<CommandQueueProvider>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_secs = period.as_secs(), "Sweeper started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Sweeper shutting down");
                break;
            }
            _ = ticker.tick() => {
                let expired = provider.cleanup_expired_requests();
                let idle = provider.cleanup_idle_clients();
                debug!(expired, idle, "Sweep complete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatehouseConfig;
    use crate::provider::Admission;
    use crate::queue::CleanupReason;
    use serde_json::json;

    #[tokio::test]
    async fn test_sweeper_reclaims_expired_items() {
        let mut config = GatehouseConfig::default();
        config.rate_limit.max_requests = 0;
        config.queue.item_timeout_secs = 0;
        let provider = Arc::new(CommandQueueProvider::from_config(&config));

        let id = match provider.admit(json!("stale"), 0, "c").await.unwrap() {
            Admission::Queued { request_id, .. } => request_id,
            other => panic!("expected queued, got {other:?}"),
        };

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(provider.clone(), Duration::from_millis(20), cancel.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let summary = provider.get_cleanup_summary();
        assert_eq!(summary.total_cleaned, 1);
        assert_eq!(summary.recent_records[0].request_id, id);
        assert_eq!(summary.recent_records[0].reason, CleanupReason::Expired);
        assert!(provider.get_queue_status(&id).is_none());

        cancel.cancel();
        handle.await.unwrap();
    }
}
