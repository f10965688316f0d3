//! HTTP boundary for the admission service.

mod handlers;
mod responses;
mod server;

use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;

use crate::executor::CommandExecutor;
use crate::provider::CommandQueueProvider;

pub use handlers::{CreateCommandRequest, CLIENT_ID_HEADER};
pub use responses::{ApiError, QUEUE_POSITION_HEADER, REQUEST_ID_HEADER};
pub use server::HttpServer;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<CommandQueueProvider>,
    pub executor: Arc<dyn CommandExecutor>,
}

impl AppState {
    pub fn new(provider: Arc<CommandQueueProvider>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { provider, executor }
    }
}

/// Build the API router.
///
/// Routes:
/// - `POST   /api/commands`
/// - `GET    /api/commands`
/// - `GET    /api/commands/cleanup-summary`
/// - `DELETE /api/commands/:id`
/// - `GET    /api/commands/:id/status`
/// - `GET    /api/commands/:id/wait`
/// - `GET    /api/commands/:id/result`
/// - `GET    /api/health`
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/commands",
            post(handlers::create_command).get(handlers::list_commands),
        )
        .route("/api/commands/cleanup-summary", get(handlers::cleanup_summary))
        .route("/api/commands/:id", delete(handlers::cancel_command))
        .route("/api/commands/:id/status", get(handlers::get_status))
        .route("/api/commands/:id/wait", get(handlers::wait_for_turn))
        .route("/api/commands/:id/result", get(handlers::get_result))
        .route("/api/health", get(handlers::health))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorSettings, GatehouseConfig};
    use crate::executor::SimulatedExecutor;
    use crate::queue::RequestId;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use axum::response::Response;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(config: &GatehouseConfig) -> AppState {
        AppState::new(
            Arc::new(CommandQueueProvider::from_config(config)),
            Arc::new(SimulatedExecutor::new(&ExecutorSettings {
                processing_delay_ms: 0,
            })),
        )
    }

    fn config(max_requests: u64) -> GatehouseConfig {
        let mut config = GatehouseConfig::default();
        config.rate_limit.max_requests = max_requests;
        config.queue.enqueue_timeout_ms = 20;
        config
    }

    fn post_command(data: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/commands")
            .header(header::CONTENT_TYPE, "application/json")
            .header(CLIENT_ID_HEADER, "tester")
            .body(Body::from(json!({ "data": data }).to_string()))
            .unwrap()
    }

    fn get(uri: String) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_two_of_three_concurrent_requests_admitted() {
        let app = router(state(&config(2)));
        let calls = (0..3).map(|i| app.clone().oneshot(post_command(&format!("req-{i}"))));
        let responses = futures::future::join_all(calls).await;

        let mut ok = 0;
        let mut deferred = Vec::new();
        for response in responses {
            let response = response.unwrap();
            match response.status() {
                StatusCode::OK => ok += 1,
                StatusCode::TOO_MANY_REQUESTS => deferred.push(response),
                other => panic!("unexpected status {other}"),
            }
        }
        assert_eq!(ok, 2);
        assert_eq!(deferred.len(), 1);

        let response = deferred.pop().unwrap();
        let retry_after: u64 = response.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after > 0);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        assert_eq!(response.headers()[QUEUE_POSITION_HEADER], "1");

        let body = body_json(response).await;
        assert_eq!(body["reason"], "Rate Limit Exceeded or Queue Full.");
        assert_eq!(body["queueLength"], 1);
    }

    #[tokio::test]
    async fn test_direct_response_carries_result() {
        let app = router(state(&config(5)));
        let response = app.oneshot(post_command("hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["processedData"], "Processed: hello");
        assert_eq!(body["data"]["processingType"], "Direct");
    }

    #[tokio::test]
    async fn test_wait_drives_ready_request() {
        let mut config = config(1);
        config.rate_limit.window_secs = 1;
        let state = state(&config);
        let app = router(state.clone());

        let response = app.clone().oneshot(post_command("direct")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.clone().oneshot(post_command("queued")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let id = body_json(response).await["requestId"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .clone()
            .oneshot(get(format!("/api/commands/{id}/wait")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(matches!(
            state.provider.promote_next(),
            crate::provider::Promotion::Promoted(_)
        ));

        let response = app
            .clone()
            .oneshot(get(format!("/api/commands/{id}/wait")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["processingType"], "Queued");

        let response = app
            .oneshot(get(format!("/api/commands/{id}/wait")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_expired_request_is_gone() {
        let mut config = config(0);
        config.queue.item_timeout_secs = 0;
        let app = router(state(&config));

        let response = app.clone().oneshot(post_command("late")).await.unwrap();
        let id = body_json(response).await["requestId"]
            .as_str()
            .unwrap()
            .to_string();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let response = app
            .clone()
            .oneshot(get(format!("/api/commands/{id}/wait")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);

        let response = app
            .oneshot(get("/api/commands/cleanup-summary".to_string()))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["totalCleaned"], 1);
        assert_eq!(body["recentRecords"][0]["requestId"], id.as_str());
        assert_eq!(body["recentRecords"][0]["reason"], "Expired");
    }

    #[tokio::test]
    async fn test_result_long_poll_and_cancel() {
        let app = router(state(&config(0)));

        let response = app.clone().oneshot(post_command("pending")).await.unwrap();
        let id = body_json(response).await["requestId"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .clone()
            .oneshot(get(format!("/api/commands/{id}/result?timeout_ms=20")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["status"], "Queued");

        let response = app
            .clone()
            .oneshot(get(format!("/api/commands/{id}/status")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["position"], 1);

        let cancel = || {
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/commands/{id}"))
                .body(Body::empty())
                .unwrap()
        };
        let response = app.clone().oneshot(cancel()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["reason"], "Cancelled");

        let response = app.clone().oneshot(cancel()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(get(format!("/api/commands/{id}/result")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_result_returns_when_promoted() {
        let mut config = config(1);
        config.rate_limit.window_secs = 1;
        let state = state(&config);
        let app = router(state.clone());

        app.clone().oneshot(post_command("direct")).await.unwrap();
        let response = app.clone().oneshot(post_command("soon")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let id = body_json(response).await["requestId"]
            .as_str()
            .unwrap()
            .to_string();

        let poll = tokio::spawn(
            app.clone()
                .oneshot(get(format!("/api/commands/{id}/result?timeout_ms=5000"))),
        );
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!poll.is_finished());

        let promoted_at = tokio::time::Instant::now();
        assert!(matches!(
            state.provider.promote_next(),
            crate::provider::Promotion::Promoted(_)
        ));

        let response = poll.await.unwrap().unwrap();
        assert!(promoted_at.elapsed() < Duration::from_secs(1));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::LOCATION],
            format!("/api/commands/{id}/wait").as_str()
        );
        assert_eq!(body_json(response).await["status"], "Ready");
    }

    #[tokio::test]
    async fn test_listing_and_health() {
        let app = router(state(&config(0)));
        app.clone().oneshot(post_command("a")).await.unwrap();
        app.clone().oneshot(post_command("b")).await.unwrap();

        let response = app
            .clone()
            .oneshot(get("/api/commands".to_string()))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["totalCommandCount"], 2);
        assert_eq!(body["commands"][0]["requestData"], "a");
        assert_eq!(body["commands"][1]["requestData"], "b");

        let response = app.oneshot(get("/api/health".to_string())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["queueLength"], 2);
        assert_eq!(body["canAcceptRequest"], false);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let app = router(state(&config(1)));
        for uri in [
            format!("/api/commands/{}/status", RequestId::new()),
            format!("/api/commands/{}/wait", RequestId::new()),
            "/api/commands/not-a-uuid/status".to_string(),
        ] {
            let response = app.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }
}
