//! Request handlers for the command API.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use super::responses::{deferred, ApiError, CommandList, CommandSummary, MessageBody};
use super::AppState;
use crate::executor::ExecutionMode;
use crate::provider::{Admission, ClaimOutcome, Deferral, WaitOutcome, REJECTION_REASON};
use crate::queue::{CommandResponse, QueueStatus, RequestId};

/// Header identifying the caller for adaptive backoff.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

const ANONYMOUS_CLIENT: &str = "anonymous";

/// Default and ceiling for the long-poll on `/result`.
const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_RESULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
pub struct CreateCommandRequest {
    pub data: String,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Deserialize)]
pub struct ResultQuery {
    pub timeout_ms: Option<u64>,
}

fn client_id(headers: &HeaderMap) -> String {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(ANONYMOUS_CLIENT)
        .to_string()
}

fn not_found(id: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(MessageBody::new(format!("Request {id} not found")))).into_response()
}

async fn run(state: &AppState, data: &Value, mode: ExecutionMode) -> CommandResponse {
    match state.executor.execute(data, mode).await {
        Ok(output) => {
            let message = match mode {
                ExecutionMode::Direct => "Request processed successfully (direct)",
                ExecutionMode::Queued => "Request processed successfully",
            };
            CommandResponse::success(message, output)
        }
        Err(err) => {
            error!(error = %err, mode = %mode, "Command execution failed");
            CommandResponse::failure(err.to_string())
        }
    }
}

/// `POST /api/commands`
#[instrument(skip_all)]
pub async fn create_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateCommandRequest>,
) -> Result<Response, ApiError> {
    let client = client_id(&headers);
    let data = Value::String(request.data);

    match state.provider.admit(data.clone(), request.priority, &client).await? {
        Admission::Admitted => {
            let response = run(&state, &data, ExecutionMode::Direct).await;
            info!(client_id = %client, success = response.success, "Request processed directly");
            Ok(Json(response).into_response())
        }
        Admission::Queued {
            request_id,
            position,
            deferral,
        } => Ok(deferred(
            "Too many requests. Please retry after the specified time.",
            Some(request_id),
            Some(position),
            &deferral,
        )),
        Admission::Rejected(deferral) => Ok(deferred(
            "Queue is full. Please retry after the specified time.",
            None,
            None,
            &deferral,
        )),
    }
}

/// `GET /api/commands/:id/status`
#[instrument(skip(state))]
pub async fn get_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(request_id) = id.parse::<RequestId>() else {
        return not_found(&id);
    };
    match state.provider.get_queue_status(&request_id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => not_found(&id),
    }
}

/// `GET /api/commands/:id/wait`
///
/// Claims the request once it is `Ready` and executes it on behalf of the
/// caller.
#[instrument(skip(state, headers))]
pub async fn wait_for_turn(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Ok(request_id) = id.parse::<RequestId>() else {
        return not_found(&id);
    };

    match state.provider.execute_ready_request(&request_id) {
        ClaimOutcome::Claimed(item) => {
            let response = run(&state, item.request_data(), ExecutionMode::Queued).await;
            match state.provider.finish_and_remove(&item, response.clone()) {
                QueueStatus::Expired => (
                    StatusCode::GONE,
                    Json(MessageBody::for_request("Request expired", request_id, Some(QueueStatus::Expired))),
                )
                    .into_response(),
                _ => Json(response).into_response(),
            }
        }
        ClaimOutcome::Pending { position } => {
            let client = client_id(&headers);
            let deferral = Deferral {
                retry_after_seconds: state.provider.retry_hint(&client),
                queue_length: state.provider.queue_length(),
                max_capacity: state.provider.max_capacity(),
                reason: REJECTION_REASON,
            };
            deferred(
                "Request is not ready yet. Please retry after the specified time.",
                Some(request_id),
                Some(position),
                &deferral,
            )
        }
        ClaimOutcome::InProgress(status) => (
            StatusCode::CONFLICT,
            Json(MessageBody::for_request(
                "Request is already being processed",
                request_id,
                Some(status),
            )),
        )
            .into_response(),
        ClaimOutcome::Expired => (
            StatusCode::GONE,
            Json(MessageBody::for_request("Request expired", request_id, Some(QueueStatus::Expired))),
        )
            .into_response(),
        ClaimOutcome::NotFound => not_found(&id),
    }
}

/// `GET /api/commands/:id/result?timeout_ms=`
///
/// Long-polls until the request completes or is promoted to `Ready`.
#[instrument(skip(state))]
pub async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ResultQuery>,
) -> Response {
    let Ok(request_id) = id.parse::<RequestId>() else {
        return not_found(&id);
    };
    let timeout = query
        .timeout_ms
        .map_or(DEFAULT_RESULT_TIMEOUT, Duration::from_millis)
        .min(MAX_RESULT_TIMEOUT);

    // Axum drops this future when the client disconnects.
    let cancel = CancellationToken::new();
    match state
        .provider
        .wait_for_response(&request_id, timeout, &cancel)
        .await
    {
        WaitOutcome::Completed(response) => Json(response).into_response(),
        WaitOutcome::Ready => (
            StatusCode::OK,
            [(header::LOCATION, format!("/api/commands/{request_id}/wait"))],
            Json(MessageBody::for_request(
                "Request is ready. Call the wait endpoint to execute it.",
                request_id,
                Some(QueueStatus::Ready),
            )),
        )
            .into_response(),
        WaitOutcome::Pending(status) => (
            StatusCode::ACCEPTED,
            Json(MessageBody::for_request(
                "Request is still being processed",
                request_id,
                Some(status),
            )),
        )
            .into_response(),
        WaitOutcome::NotFound => not_found(&id),
    }
}

/// `DELETE /api/commands/:id`
#[instrument(skip(state))]
pub async fn cancel_command(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(request_id) = id.parse::<RequestId>() else {
        return not_found(&id);
    };
    match state.provider.cancel_request(&request_id) {
        Ok(record) => Json(record).into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

/// `GET /api/commands`
#[instrument(skip(state))]
pub async fn list_commands(State(state): State<AppState>) -> Json<CommandList> {
    let now = Utc::now();
    let commands: Vec<CommandSummary> = state
        .provider
        .get_all_queued_commands()
        .iter()
        .map(|item| CommandSummary::new(item, now))
        .collect();

    info!(count = commands.len(), "Listed queued commands");
    Json(CommandList {
        total_command_count: commands.len(),
        commands,
        timestamp: now,
    })
}

/// `GET /api/commands/cleanup-summary`
pub async fn cleanup_summary(State(state): State<AppState>) -> Response {
    Json(state.provider.get_cleanup_summary()).into_response()
}

/// `GET /api/health`
pub async fn health(State(state): State<AppState>) -> Response {
    Json(state.provider.health()).into_response()
}
