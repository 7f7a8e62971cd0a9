//! REST API Server for the Advisor Orchestrator
//!
//! Exposes submit, session inspection and session reset over HTTP

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::agent::Orchestrator;
use crate::audit::AuditSummary;
use crate::error::OrchestrationError;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubmitRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub task: String,
    #[serde(default)]
    pub success_criterion: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

fn error_status(error: &OrchestrationError) -> StatusCode {
    match error {
        OrchestrationError::CheckpointCorrupted(_) => StatusCode::CONFLICT,
        OrchestrationError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Submit Endpoint
/// =============================

async fn submit(
    State(state): State<ApiState>,
    Json(req): Json<SubmitRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    if req.task.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("task must not be empty".into())),
        );
    }

    let conversation_id = req
        .conversation_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    info!(%conversation_id, task = %req.task, "Received submit request");

    match state
        .orchestrator
        .submit(&conversation_id, &req.task, req.success_criterion.as_deref())
        .await
    {
        Ok(response) => {
            let mut data = serde_json::to_value(&response).unwrap_or_default();
            if let Some(object) = data.as_object_mut() {
                object.insert(
                    "conversation_id".to_string(),
                    serde_json::json!(conversation_id),
                );
            }
            (StatusCode::OK, Json(ApiResponse::success(data)))
        }
        Err(e) => {
            error!(%conversation_id, error = %e, "Submit failed");
            (
                error_status(&e),
                Json(ApiResponse::error(format!("Submit failed: {}", e))),
            )
        }
    }
}

/// =============================
/// Session Endpoint
/// =============================

async fn get_session(
    State(state): State<ApiState>,
    Path(conversation_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.orchestrator.session(&conversation_id).await {
        Ok(Some(session)) => {
            let audit = AuditSummary::of(&session);
            (
                StatusCode::OK,
                Json(ApiResponse::success(serde_json::json!({
                    "conversation_id": session.conversation_id(),
                    "status": session.status(),
                    "success_criterion": session.success_criterion(),
                    "feedback": session.feedback(),
                    "shared_context": session.shared_context(),
                    "pending": session.pending(),
                    "turns": session.turns(),
                    "audit": audit,
                }))),
            )
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!(
                "No session for conversation {}",
                conversation_id
            ))),
        ),
        Err(e) => (
            error_status(&e),
            Json(ApiResponse::error(format!("Failed to load session: {}", e))),
        ),
    }
}

async fn delete_session(
    State(state): State<ApiState>,
    Path(conversation_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.orchestrator.reset(&conversation_id).await {
        Ok(true) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "conversation_id": conversation_id,
                "deleted": true,
            }))),
        ),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!(
                "No session for conversation {}",
                conversation_id
            ))),
        ),
        Err(e) => {
            error!(%conversation_id, error = %e, "Session reset failed");
            (
                error_status(&e),
                Json(ApiResponse::error(format!("Failed to reset session: {}", e))),
            )
        }
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/submit", post(submit))
        .route(
            "/api/sessions/:conversation_id",
            get(get_session).delete(delete_session),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
