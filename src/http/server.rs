//! HTTP server wrapper.

use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::{router, AppState};
use crate::error::{GatehouseError, Result};

/// HTTP server for the command API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    state: AppState,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            GatehouseError::Io(e)
        })?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Starting HTTP server");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                GatehouseError::Io(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatehouseConfig;
    use crate::executor::SimulatedExecutor;
    use crate::provider::CommandQueueProvider;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_server_stops_on_signal() {
        let config = GatehouseConfig::default();
        let state = AppState::new(
            Arc::new(CommandQueueProvider::from_config(&config)),
            Arc::new(SimulatedExecutor::new(&config.executor)),
        );
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, state);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            server.serve_with_shutdown(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }
}
