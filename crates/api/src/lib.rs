#![forbid(unsafe_code)]

//! HTTP surface: health, login, the WebSocket endpoint, and the REST
//! handlers that mutate room state. Every non-public route requires a
//! Bearer token; every route answers 503 once shutdown begins.

mod rest;
mod ws;


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use coderoom_auth::{AuthError, TokenKeys, DEFAULT_TOKEN_TTL};
use coderoom_core::protocol::ErrorResponse;
use coderoom_core::UserIdentity;
use coderoom_realtime::RoomRegistry;
use coderoom_storage::ProjectStore;

/// Process-wide shutdown latch: flipped once, read everywhere.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct ApiState {
    keys: Arc<TokenKeys>,
    store: Arc<dyn ProjectStore>,
    registry: RoomRegistry,
    allowed_origins: Arc<Vec<String>>,
    shutdown: ShutdownFlag,
}

impl ApiState {
    #[must_use]
    pub fn new(keys: Arc<TokenKeys>, store: Arc<dyn ProjectStore>, registry: RoomRegistry) -> Self {
        Self {
            keys,
            store,
            registry,
            allowed_origins: Arc::new(Vec::new()),
            shutdown: ShutdownFlag::new(),
        }
    }

    /// Origins accepted on the WebSocket handshake. An empty list allows
    /// any origin (development mode).
    #[must_use]
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = Arc::new(origins);
        self
    }

    #[must_use]
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }
}

pub fn router(state: ApiState) -> Router {
    let middleware_state = state.clone();
    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/login", post(login))
        .route("/api/projects/:id/permissions", post(rest::set_permission))
        .route(
            "/api/projects/:id/suggestions/:sid/approve",
            post(rest::approve_suggestion),
        )
        .route("/ws", get(ws::websocket_upgrade))
        .with_state(state)
        .layer(middleware::from_fn_with_state(
            middleware_state,
            guard_middleware,
        ))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, serde::Serialize)]
struct LoginResponse {
    token: String,
    user: UserIdentity,
}

async fn login(State(state): State<ApiState>, body: Json<serde_json::Value>) -> Response {
    let username = body
        .get("username")
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|username| !username.is_empty() && username.len() <= 64);
    let Some(username) = username else {
        return error_response(StatusCode::BAD_REQUEST, "username is required");
    };

    let profile = match state.store.login_user(username).await {
        Ok(profile) => profile,
        Err(error) => {
            tracing::error!(%error, "login failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "login failed");
        }
    };

    let user = UserIdentity {
        user_id: profile.user_id,
        username: profile.username,
        role: profile.role,
    };
    match state.keys.issue(&user, DEFAULT_TOKEN_TTL) {
        Ok(token) => (StatusCode::OK, Json(LoginResponse { token, user })).into_response(),
        Err(error) => {
            tracing::error!(%error, "token issuance failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "login failed")
        }
    }
}

/// 503 during shutdown, then Bearer auth for everything non-public.
async fn guard_middleware(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "server is shutting down");
    }
    if is_public_path(request.uri().path()) {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "));
    let Some(token) = token else {
        return error_response(StatusCode::UNAUTHORIZED, "missing authorization");
    };

    match state.keys.verify(token) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(AuthError::ExpiredToken) => {
            error_response(StatusCode::UNAUTHORIZED, "token has expired")
        }
        Err(AuthError::MissingToken | AuthError::InvalidToken) => {
            error_response(StatusCode::UNAUTHORIZED, "invalid token")
        }
    }
}

fn is_public_path(path: &str) -> bool {
    matches!(path, "/api/health" | "/api/auth/login" | "/ws")
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_owned(),
        }),
    )
        .into_response()
}
