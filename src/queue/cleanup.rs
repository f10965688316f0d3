//! Bounded history of reclaimed queue entries.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::item::{QueuedContext, RequestId};

/// Why an item was removed before it could complete normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupReason {
    Expired,
    Cancelled,
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupReason::Expired => f.write_str("Expired"),
            CleanupReason::Cancelled => f.write_str("Cancelled"),
        }
    }
}

/// Immutable log entry written when an item is reclaimed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRecord {
    pub request_id: RequestId,
    pub request_data: Value,
    pub queued_at: DateTime<Utc>,
    pub cleaned_at: DateTime<Utc>,
    /// Milliseconds between enqueue and reclamation
    pub life_span_ms: i64,
    pub reason: CleanupReason,
}

impl CleanupRecord {
    pub fn new(item: &QueuedContext, reason: CleanupReason, cleaned_at: DateTime<Utc>) -> Self {
        Self {
            request_id: item.id(),
            request_data: item.request_data().clone(),
            queued_at: item.queued_at(),
            cleaned_at,
            life_span_ms: (cleaned_at - item.queued_at()).num_milliseconds(),
            reason,
        }
    }
}

/// Point-in-time view of the cleanup history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSummary {
    pub total_cleaned: u64,
    pub recent_records: Vec<CleanupRecord>,
    pub last_cleanup_at: Option<DateTime<Utc>>,
    pub retention_limit: usize,
}

struct History {
    records: VecDeque<CleanupRecord>,
    last_cleanup_at: Option<DateTime<Utc>>,
}

/// Most-recent-N cleanup records plus lifetime counters.
pub struct CleanupLog {
    history: Mutex<History>,
    total: AtomicU64,
    retention: usize,
}

impl CleanupLog {
    pub fn new(retention: usize) -> Self {
        Self {
            history: Mutex::new(History {
                records: VecDeque::with_capacity(retention.min(1024)),
                last_cleanup_at: None,
            }),
            total: AtomicU64::new(0),
            retention,
        }
    }

    /// Append a record, evicting the oldest once the bound is reached.
    pub fn push(&self, record: CleanupRecord) {
        let mut history = self.history.lock();
        history.last_cleanup_at = Some(record.cleaned_at);
        if self.retention > 0 {
            while history.records.len() >= self.retention {
                history.records.pop_front();
            }
            history.records.push_back(record);
        }
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> CleanupSummary {
        let history = self.history.lock();
        CleanupSummary {
            total_cleaned: self.total(),
            recent_records: history.records.iter().rev().cloned().collect(),
            last_cleanup_at: history.last_cleanup_at,
            retention_limit: self.retention,
        }
    }
}
