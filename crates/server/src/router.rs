//! HTTP router construction.
//!
//! `POST /trigger/{identifier}?nonce=…` starts a pass and answers at once;
//! the pass itself runs on a spawned task.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, warn};

use sluice_queue::InvocationContext;

use crate::state::AppState;

/// Build the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/trigger/{identifier}", post(trigger))
        .with_state(state)
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(State(state): State<Arc<AppState>>) -> Response {
    match state.processor.status().await {
        Ok(status) => Json(json!({
            "queue": status,
            "config": state.config.redacted_summary(),
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "status lookup failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TriggerQuery {
    #[serde(default)]
    pub nonce: Option<String>,
}

async fn trigger(
    State(state): State<Arc<AppState>>,
    Path(identifier): Path<String>,
    Query(query): Query<TriggerQuery>,
) -> Response {
    if identifier != state.processor.identifier() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown queue '{identifier}'") })),
        )
            .into_response();
    }

    let nonce = query.nonce.unwrap_or_default();
    if let Err(e) = state.gate.verify(&nonce, &identifier) {
        warn!(queue = %identifier, "rejected trigger with bad nonce");
        return (StatusCode::FORBIDDEN, Json(json!({ "error": e.to_string() }))).into_response();
    }

    let processor = state.processor.clone();
    tokio::spawn(async move {
        match processor.handle_trigger(InvocationContext::Trigger).await {
            Ok(outcome) => debug!(queue = %processor.identifier(), ?outcome, "triggered pass finished"),
            Err(e) => error!(queue = %processor.identifier(), error = %e, "triggered pass failed"),
        }
    });

    (StatusCode::ACCEPTED, Json(json!({ "accepted": true }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use sluice_core::Config;
    use sluice_queue::{BatchProcessor, ChannelDispatcher, MemoryStore, NonceGate, ProcessorConfig, StoreScheduler};

    use crate::command_handler::CommandHandler;

    fn test_state() -> Arc<AppState> {
        let store: Arc<dyn sluice_queue::QueueStore> = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(StoreScheduler::new(store.clone()));
        let (dispatcher, _rx) = ChannelDispatcher::new();
        let processor = BatchProcessor::builder(
            Arc::new(CommandHandler::new(Some("cat > /dev/null".into()))),
            store,
            Arc::new(dispatcher),
        )
        .config(ProcessorConfig::new("jobs"))
        .scheduler(scheduler.clone())
        .build()
        .unwrap();

        Arc::new(AppState {
            config: Config::for_profile(""),
            processor: Arc::new(processor),
            scheduler,
            gate: NonceGate::new("test-secret"),
        })
    }

    async fn send(state: Arc<AppState>, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
        let response = build_router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn wait_until_drained(state: &AppState) {
        for _ in 0..100 {
            if state.processor.is_queue_empty().await.unwrap() && !state.processor.is_processing().await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("queue was not drained");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = send(test_state(), Method::GET, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn valid_trigger_is_accepted_and_drains_queue() {
        let state = test_state();
        state.processor.push_to_queue(json!({"id": 1}));
        state.processor.save().await.unwrap();

        let nonce = state.gate.issue("jobs");
        let (status, body) = send(state.clone(), Method::POST, &format!("/trigger/jobs?nonce={nonce}")).await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, json!({ "accepted": true }));
        wait_until_drained(&state).await;
    }

    #[tokio::test]
    async fn bad_nonce_is_forbidden_and_runs_nothing() {
        let state = test_state();
        state.processor.push_to_queue(json!({"id": 1}));
        state.processor.save().await.unwrap();

        let (status, _) = send(state.clone(), Method::POST, "/trigger/jobs?nonce=deadbeef").await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(state.clone(), Method::POST, "/trigger/jobs").await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.processor.queue().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_queue_is_not_found() {
        let state = test_state();
        let nonce = state.gate.issue("other");
        let (status, _) = send(state, Method::POST, &format!("/trigger/other?nonce={nonce}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_snapshot_includes_queue_and_config() {
        let state = test_state();
        state.processor.push_to_queue(json!(1));
        state.processor.save().await.unwrap();

        let (status, body) = send(state, Method::GET, "/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queue"]["identifier"], "jobs");
        assert_eq!(body["queue"]["batches"], 1);
        assert_eq!(body["queue"]["locked"], false);
        assert_eq!(body["queue"]["state"], "idle");
        assert!(body["config"]["queue"].is_object());
    }
}
