//! Queued work items and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::QueueError;

/// Identifier assigned to a unit of work when it is enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a queued item.
///
/// ```text
/// Queued -> Ready -> Processing -> Finished | Failed
/// Queued | Ready -> Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueStatus {
    Queued,
    Ready,
    Processing,
    Finished,
    Failed,
    Expired,
}

impl QueueStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Finished | QueueStatus::Failed | QueueStatus::Expired)
    }

    /// Position along the main chain; terminal outcomes share the last rank.
    fn rank(self) -> u8 {
        match self {
            QueueStatus::Queued => 0,
            QueueStatus::Ready => 1,
            QueueStatus::Processing => 2,
            QueueStatus::Finished | QueueStatus::Failed | QueueStatus::Expired => 3,
        }
    }

    /// Whether `self -> next` is a legal forward move.
    pub fn can_transition_to(self, next: QueueStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            QueueStatus::Expired => matches!(self, QueueStatus::Queued | QueueStatus::Ready),
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueStatus::Queued => "Queued",
            QueueStatus::Ready => "Ready",
            QueueStatus::Processing => "Processing",
            QueueStatus::Finished => "Finished",
            QueueStatus::Failed => "Failed",
            QueueStatus::Expired => "Expired",
        };
        f.write_str(name)
    }
}

/// Payload written alongside a status change.
#[derive(Debug, Clone, Default)]
pub enum Outcome {
    #[default]
    None,
    Result(Value),
    Error(String),
}

/// A unit of work as submitted, before the queue assigns identity and expiry.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub data: Value,
    pub priority: i32,
}

impl CommandRequest {
    pub fn new(data: Value) -> Self {
        Self { data, priority: 0 }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Mutable part of an item, published through the item's watch channel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemState {
    pub status: QueueStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
}

impl ItemState {
    fn queued() -> Self {
        Self {
            status: QueueStatus::Queued,
            processed_at: None,
            result: None,
            error_message: None,
        }
    }
}

/// A status change that was applied (or was already in effect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: QueueStatus,
    pub to: QueueStatus,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    /// The item stopped occupying a capacity slot.
    pub fn left_queued(&self) -> bool {
        self.from == QueueStatus::Queued && self.to != QueueStatus::Queued
    }
}

/// Terminal response handed to waiters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandResponse {
    pub fn success(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    /// Rebuild the response from a terminal item state.
    pub fn from_state(state: &ItemState) -> Option<Self> {
        match state.status {
            QueueStatus::Finished => Some(Self {
                success: true,
                message: "Request processed successfully".to_string(),
                data: state.result.clone(),
            }),
            QueueStatus::Failed => Some(Self::failure(
                state
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Request failed".to_string()),
            )),
            QueueStatus::Expired => Some(Self::failure("Request expired")),
            _ => None,
        }
    }
}

/// One deferred unit of work.
///
/// Identity, payload and timestamps are fixed at enqueue time. Status and
/// outcome live in a watch channel: the item is the single writer and any
/// number of waiters may subscribe.
#[derive(Debug)]
pub struct QueuedContext {
    id: RequestId,
    request_data: Value,
    priority: i32,
    sequence: u64,
    queued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    state: watch::Sender<ItemState>,
}

impl QueuedContext {
    pub(crate) fn new(
        request: CommandRequest,
        sequence: u64,
        queued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let (state, _) = watch::channel(ItemState::queued());
        Self {
            id: RequestId::new(),
            request_data: request.data,
            priority: request.priority,
            sequence,
            queued_at,
            expires_at,
            state,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn request_data(&self) -> &Value {
        &self.request_data
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Arrival order within the owning queue.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn queued_at(&self) -> DateTime<Utc> {
        self.queued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn status(&self) -> QueueStatus {
        self.state.borrow().status
    }

    /// Copy of the current mutable state.
    pub fn state(&self) -> ItemState {
        self.state.borrow().clone()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Queued or Ready past `expires_at`; claimed items are not preempted.
    pub fn should_expire(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status(), QueueStatus::Queued | QueueStatus::Ready) && self.is_expired_at(now)
    }

    /// Receiver observing every subsequent status change.
    pub fn subscribe(&self) -> watch::Receiver<ItemState> {
        self.state.subscribe()
    }

    /// Apply a status change atomically.
    ///
    /// Writing the current status again is a no-op. Backward moves and moves
    /// out of a terminal state are rejected without touching the item.
    pub(crate) fn transition(&self, to: QueueStatus, outcome: Outcome) -> Result<Transition, QueueError> {
        self.apply(None, to, outcome)
    }

    /// Like [`transition`](Self::transition), but only from `expected`.
    pub(crate) fn transition_from(
        &self,
        expected: QueueStatus,
        to: QueueStatus,
        outcome: Outcome,
    ) -> Result<Transition, QueueError> {
        self.apply(Some(expected), to, outcome)
    }

    fn apply(
        &self,
        expected: Option<QueueStatus>,
        to: QueueStatus,
        outcome: Outcome,
    ) -> Result<Transition, QueueError> {
        let id = self.id;
        let mut verdict = Ok(Transition { from: to, to });
        self.state.send_if_modified(|state| {
            let from = state.status;
            if expected.is_some_and(|expected| expected != from) {
                verdict = Err(QueueError::InvalidTransition { id, from, to });
                return false;
            }
            if from == to {
                verdict = Ok(Transition { from, to });
                return false;
            }
            if !from.can_transition_to(to) {
                verdict = Err(QueueError::InvalidTransition { id, from, to });
                return false;
            }

            state.status = to;
            if to == QueueStatus::Processing && state.processed_at.is_none() {
                state.processed_at = Some(Utc::now());
            }
            match outcome {
                Outcome::None => {}
                Outcome::Result(value) => state.result = Some(value),
                Outcome::Error(message) => state.error_message = Some(message),
            }
            verdict = Ok(Transition { from, to });
            true
        });
        verdict
    }
}
