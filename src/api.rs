//! REST API over session memory and user profiles
//!
//! Thin JSON layer: every handler delegates to [`ConversationMemory`] and
//! maps error kinds onto status codes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::conversational::ConversationMemory;
use crate::error::{ErrorKind, MemoryError};
use crate::models::{NewUser, Role, UserUpdate};

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct AppendMessageRequest {
    pub role: String,
    pub content: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    pub human: String,
    pub assistant: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AttachRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub count: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
}

#[derive(Debug, Deserialize)]
pub struct ContextQuery {
    pub user_id: Option<String>,
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

type ApiResult = (StatusCode, Json<ApiResponse>);

fn ok<T: Serialize>(data: T) -> ApiResult {
    (StatusCode::OK, Json(ApiResponse::success(data)))
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn fail(error: MemoryError) -> ApiResult {
    (
        status_for(error.kind()),
        Json(ApiResponse::error(error.to_string())),
    )
}

fn respond<T: Serialize>(result: crate::Result<T>) -> ApiResult {
    match result {
        Ok(data) => ok(data),
        Err(e) => fail(e),
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub memory: ConversationMemory,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health(State(state): State<ApiState>) -> ApiResult {
    match state.memory.health_check().await {
        Ok(()) => ok(serde_json::json!({ "status": "healthy" })),
        Err(e) => fail(e),
    }
}

/// =============================
/// User Endpoints
/// =============================

async fn create_user(State(state): State<ApiState>, Json(req): Json<NewUser>) -> ApiResult {
    match state.memory.users().create_user(req).await {
        Ok(profile) => (StatusCode::CREATED, Json(ApiResponse::success(profile))),
        Err(e) => fail(e),
    }
}

async fn list_users(State(state): State<ApiState>) -> ApiResult {
    respond(state.memory.users().list_users().await)
}

async fn get_user(State(state): State<ApiState>, Path(user_id): Path<String>) -> ApiResult {
    respond(state.memory.users().get_user(&user_id).await)
}

async fn update_user(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(req): Json<UserUpdate>,
) -> ApiResult {
    respond(state.memory.users().update_user(&user_id, req).await)
}

async fn delete_user(State(state): State<ApiState>, Path(user_id): Path<String>) -> ApiResult {
    respond(
        state
            .memory
            .users()
            .delete_user(&user_id)
            .await
            .map(|()| serde_json::json!({ "user_id": user_id, "deleted": true })),
    )
}

async fn user_sessions(State(state): State<ApiState>, Path(user_id): Path<String>) -> ApiResult {
    respond(state.memory.users().get_user_sessions(&user_id).await)
}

async fn user_context(State(state): State<ApiState>, Path(user_id): Path<String>) -> ApiResult {
    respond(state.memory.users().get_user_context(&user_id).await)
}

/// =============================
/// Session Endpoints
/// =============================

async fn list_sessions(State(state): State<ApiState>) -> ApiResult {
    respond(state.memory.memory().list_sessions().await)
}

async fn append_message(
    State(state): State<ApiState>,
    Path(session_key): Path<String>,
    Json(req): Json<AppendMessageRequest>,
) -> ApiResult {
    let role = match req.role.parse::<Role>() {
        Ok(role) => role,
        Err(e) => return fail(e),
    };

    let message = match state
        .memory
        .memory()
        .append(&session_key, role, &req.content)
        .await
    {
        Ok(message) => message,
        Err(e) => return fail(e),
    };

    let indexed = match req.user_id.as_deref().filter(|id| !id.trim().is_empty()) {
        Some(user_id) => state.memory.index_session(user_id, &session_key).await,
        None => false,
    };

    ok(serde_json::json!({ "message": message, "indexed": indexed }))
}

async fn record_exchange(
    State(state): State<ApiState>,
    Path(session_key): Path<String>,
    Json(req): Json<ExchangeRequest>,
) -> ApiResult {
    info!("Recording exchange for session {}", session_key);
    respond(
        state
            .memory
            .record_exchange(&session_key, req.user_id.as_deref(), &req.human, &req.assistant)
            .await,
    )
}

async fn recent_messages(
    State(state): State<ApiState>,
    Path(session_key): Path<String>,
    Query(query): Query<RecentQuery>,
) -> ApiResult {
    let store = state.memory.memory();
    let result = match query.count {
        Some(count) => store.recent(&session_key, count).await,
        None => store.history(&session_key).await,
    };
    respond(result)
}

async fn search_messages(
    State(state): State<ApiState>,
    Path(session_key): Path<String>,
    Query(query): Query<SearchQuery>,
) -> ApiResult {
    respond(state.memory.memory().search(&session_key, &query.q).await)
}

async fn session_info(State(state): State<ApiState>, Path(session_key): Path<String>) -> ApiResult {
    respond(state.memory.memory().info(&session_key).await)
}

async fn clear_session(State(state): State<ApiState>, Path(session_key): Path<String>) -> ApiResult {
    respond(
        state
            .memory
            .memory()
            .clear(&session_key)
            .await
            .map(|()| serde_json::json!({ "session_key": session_key, "cleared": true })),
    )
}

async fn attach_session(
    State(state): State<ApiState>,
    Path(session_key): Path<String>,
    Json(req): Json<AttachRequest>,
) -> ApiResult {
    respond(
        state
            .memory
            .users()
            .attach_session(&req.user_id, &session_key)
            .await
            .map(|()| serde_json::json!({ "session_key": session_key, "user_id": req.user_id })),
    )
}

async fn session_context(
    State(state): State<ApiState>,
    Path(session_key): Path<String>,
    Query(query): Query<ContextQuery>,
) -> ApiResult {
    respond(
        state
            .memory
            .load_context(&session_key, query.user_id.as_deref())
            .await,
    )
}

/// =============================
/// Router
/// =============================

pub fn create_router(memory: ConversationMemory) -> Router {
    let state = ApiState { memory };

    Router::new()
        .route("/health", get(health))
        .route("/users", get(list_users).post(create_user))
        .route(
            "/users/:user_id",
            get(get_user).patch(update_user).delete(delete_user),
        )
        .route("/users/:user_id/sessions", get(user_sessions))
        .route("/users/:user_id/context", get(user_context))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:session_key", axum::routing::delete(clear_session))
        .route(
            "/sessions/:session_key/messages",
            get(recent_messages).post(append_message),
        )
        .route("/sessions/:session_key/exchange", post(record_exchange))
        .route("/sessions/:session_key/search", get(search_messages))
        .route("/sessions/:session_key/info", get(session_info))
        .route("/sessions/:session_key/attach", post(attach_session))
        .route("/sessions/:session_key/context", get(session_context))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    memory: ConversationMemory,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(memory);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::config::StoreConfig;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router() -> Router {
        let memory = ConversationMemory::from_config(
            Arc::new(InMemoryBackend::new()),
            &StoreConfig::default(),
        );
        create_router(memory)
    }

    async fn call(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, ApiResponse) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&router(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
    }

    #[tokio::test]
    async fn test_user_lifecycle_status_codes() {
        let app = router();
        let new_user = serde_json::json!({
            "user_id": "u1",
            "name": "Ana",
            "preferences": {"language": "es", "topics_interest": ["space", "tech"], "font_size": 14}
        });

        let (status, _) = call(&app, "POST", "/users", Some(new_user.clone())).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(&app, "POST", "/users", Some(new_user)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(!body.success);

        let (status, body) = call(
            &app,
            "PATCH",
            "/users/u1",
            Some(serde_json::json!({"preferences": {"language": "en"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let prefs = &body.data.unwrap()["preferences"];
        assert_eq!(prefs["language"], "en");
        assert_eq!(prefs["topics_interest"], serde_json::json!(["space", "tech"]));
        assert_eq!(prefs["font_size"], serde_json::json!(14));

        let (status, _) = call(&app, "DELETE", "/users/u1", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&app, "GET", "/users/u1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_session_endpoints() {
        let app = router();

        let (status, _) = call(
            &app,
            "POST",
            "/sessions/s1/messages",
            Some(serde_json::json!({"role": "human", "content": "Hello there"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &app,
            "POST",
            "/sessions/s1/messages",
            Some(serde_json::json!({"role": "robot", "content": "beep"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&app, "GET", "/sessions/s1/search?q=HELLO", None).await;
        assert_eq!(body.data.unwrap().as_array().unwrap().len(), 1);

        let (_, body) = call(&app, "GET", "/sessions/s1/info", None).await;
        assert_eq!(body.data.unwrap()["message_count"], 1);

        let (status, _) = call(&app, "DELETE", "/sessions/s1", None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, "GET", "/sessions/s1/messages?count=5", None).await;
        assert!(body.data.unwrap().as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exchange_and_context() {
        let app = router();
        call(&app, "POST", "/users", Some(serde_json::json!({"user_id": "u1"}))).await;

        let (status, body) = call(
            &app,
            "POST",
            "/sessions/s1/exchange",
            Some(serde_json::json!({"human": "Hi", "assistant": "Hello!", "user_id": "u1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.data.unwrap()["indexed"], true);

        let (_, body) = call(&app, "GET", "/sessions/s1/context?user_id=u1", None).await;
        let data = body.data.unwrap();
        assert_eq!(data["messages"].as_array().unwrap().len(), 2);
        assert_eq!(data["user"]["session_count"], 1);

        let (_, body) = call(&app, "GET", "/users/u1/sessions", None).await;
        assert_eq!(body.data.unwrap(), serde_json::json!(["s1"]));
    }
}
