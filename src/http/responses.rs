//! Response bodies and error mapping for the HTTP API.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::QueueError;
use crate::provider::{Deferral, REJECTION_REASON};
use crate::queue::{QueueStatus, QueuedContext, RequestId};

pub const QUEUE_POSITION_HEADER: HeaderName = HeaderName::from_static("x-queue-position");
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<QueueStatus>,
}

impl MessageBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            request_id: None,
            status: None,
        }
    }

    pub fn for_request(message: impl Into<String>, id: RequestId, status: Option<QueueStatus>) -> Self {
        Self {
            message: message.into(),
            request_id: Some(id),
            status,
        }
    }
}

/// 429 body for a caller that has to come back later.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredBody {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub retry_after_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    pub queue_length: usize,
    pub max_capacity: usize,
    pub reason: &'static str,
}

/// Build a 429 carrying `Retry-After` and, when queued, the request id and
/// queue position headers.
pub fn deferred(
    message: &str,
    request_id: Option<RequestId>,
    position: Option<usize>,
    deferral: &Deferral,
) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(deferral.retry_after_seconds));
    if let Some(position) = position {
        headers.insert(QUEUE_POSITION_HEADER, HeaderValue::from(position));
    }
    if let Some(id) = request_id {
        if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
    }

    let body = DeferredBody {
        message: message.to_string(),
        request_id,
        retry_after_seconds: deferral.retry_after_seconds,
        queue_position: position,
        queue_length: deferral.queue_length,
        max_capacity: deferral.max_capacity,
        reason: deferral.reason,
    };
    (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response()
}

/// One entry of the queue listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSummary {
    pub id: RequestId,
    pub request_data: Value,
    pub status: QueueStatus,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub waiting_time_ms: i64,
}

impl CommandSummary {
    pub fn new(item: &QueuedContext, now: DateTime<Utc>) -> Self {
        Self {
            id: item.id(),
            request_data: item.request_data().clone(),
            status: item.status(),
            priority: item.priority(),
            queued_at: item.queued_at(),
            expires_at: item.expires_at(),
            waiting_time_ms: (now - item.queued_at()).num_milliseconds(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandList {
    pub total_command_count: usize,
    pub commands: Vec<CommandSummary>,
    pub timestamp: DateTime<Utc>,
}

/// Queue errors rendered as HTTP responses.
#[derive(Debug)]
pub struct ApiError(pub QueueError);

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError(err)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let (status, retry_after) = match &err {
            QueueError::QueueFull { .. } => (StatusCode::TOO_MANY_REQUESTS, Some(1)),
            QueueError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            QueueError::InvalidTransition { .. } => (StatusCode::CONFLICT, None),
            QueueError::Closed => (StatusCode::SERVICE_UNAVAILABLE, None),
            QueueError::Cancelled | QueueError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "Request failed");
            "Internal server error".to_string()
        } else {
            if err.is_expected() {
                debug!(error = %err, status = %status, "Request not served");
            } else {
                warn!(error = %err, status = %status, "Request refused");
            }
            err.to_string()
        };
        let body = ErrorBody {
            message,
            reason: retry_after.map(|_| REJECTION_REASON),
            retry_after_seconds: retry_after,
        };

        let mut headers = HeaderMap::new();
        if let Some(secs) = retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        (status, headers, Json(body)).into_response()
    }
}
