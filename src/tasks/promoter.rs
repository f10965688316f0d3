//! Background promotion of queued requests as the rate limit frees up.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::provider::{CommandQueueProvider, Promotion};

/// Extra sleep after a rate-limit hint so the window has actually moved.
const PROMOTION_MARGIN: Duration = Duration::from_millis(100);

/// Spawn the task that marks queued items `Ready` as rate-limit capacity
/// frees up. It is the only caller of [`CommandQueueProvider::promote_next`].
pub fn spawn_promoter(
    provider: Arc<CommandQueueProvider>,
    idle_delay: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_promoter_loop(provider, idle_delay, cancel).await;
    })
}

async fn run_promoter_loop(
    provider: Arc<CommandQueueProvider>,
    idle_delay: Duration,
    cancel: CancellationToken,
) {
    info!(idle_delay_ms = idle_delay.as_millis() as u64, "Promoter started");

    loop {
        let pause = match provider.promote_next() {
            Promotion::Promoted(item) => {
                debug!(request_id = %item.id(), "Promoted");
                continue;
            }
            Promotion::Idle => idle_delay,
            Promotion::Throttled(retry_after) => {
                debug!(retry_after_ms = retry_after.as_millis() as u64, "Promotion throttled");
                retry_after + PROMOTION_MARGIN
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Promoter shutting down");
                break;
            }
            _ = tokio::time::sleep(pause) => {}
        }
    }
}
