//! Error types for the Gatehouse service.

use thiserror::Error;

use crate::queue::{QueueStatus, RequestId};

/// Main error type for Gatehouse operations.
#[derive(Error, Debug)]
pub enum GatehouseError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Queue and admission errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for GatehouseError {
    fn from(err: config::ConfigError) -> Self {
        GatehouseError::Config(err.to_string())
    }
}

/// Outcomes of queue and admission operations.
///
/// `QueueFull` and `NotFound` are expected conditions and are returned as
/// values; only `Internal` represents a fault. Rate limiting is not an error:
/// it surfaces as a deferral on the admission result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("request {0} not found")]
    NotFound(RequestId),

    #[error("request {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: RequestId,
        from: QueueStatus,
        to: QueueStatus,
    },

    #[error("queue is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Whether this is a normal load-shedding outcome rather than a failure.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            QueueError::QueueFull { .. } | QueueError::NotFound(_)
        )
    }
}

/// Result type alias for Gatehouse operations.
pub type Result<T> = std::result::Result<T, GatehouseError>;
