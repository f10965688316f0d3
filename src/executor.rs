//! The protected downstream operation.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::config::ExecutorSettings;

/// How a request reached the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionMode {
    /// Admitted on arrival
    Direct,
    /// Driven to completion after waiting in the queue
    Queued,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Direct => f.write_str("Direct"),
            ExecutionMode::Queued => f.write_str("Queued"),
        }
    }
}

/// Business operation guarded by admission control.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, data: &Value, mode: ExecutionMode) -> anyhow::Result<Value>;
}

/// Stand-in operation that sleeps and echoes its input.
pub struct SimulatedExecutor {
    processing_delay: Duration,
}

impl SimulatedExecutor {
    pub fn new(settings: &ExecutorSettings) -> Self {
        Self {
            processing_delay: Duration::from_millis(settings.processing_delay_ms),
        }
    }
}

#[async_trait]
impl CommandExecutor for SimulatedExecutor {
    async fn execute(&self, data: &Value, mode: ExecutionMode) -> anyhow::Result<Value> {
        tokio::time::sleep(self.processing_delay).await;

        let text = match data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        debug!(mode = %mode, "Simulated command executed");
        Ok(json!({
            "originalData": data,
            "processedData": format!("Processed: {text}"),
            "processingType": mode,
        }))
    }
}
