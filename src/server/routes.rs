//! HTTP routes: auth, wallet reads, room listing and the WebSocket upgrade.

use crate::errors::{ErrorCode, GameError};
use crate::money::Amount;
use crate::server::gateway;
use crate::server::session::Role;
use crate::server::AppState;
use crate::UserId;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub fn router(app: AppState) -> Router {
    let cors = if app
        .services
        .config
        .server
        .allowed_origins
        .iter()
        .any(|origin| origin == "*")
    {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = app
            .services
            .config
            .server
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };
    let timeout = Duration::from_secs(app.services.config.server.request_timeout_secs);

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/rooms", get(rooms))
        .route("/wallet/balance", get(wallet_balance))
        .route("/wallet/history", get(wallet_history))
        .route("/admin/adjust", post(admin_adjust))
        .route("/ws", get(gateway::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
        .layer(cors)
        .with_state(app)
}

/// HTTP-facing error wrapper mapping [`ErrorCode`] to a status.
pub struct ApiError(GameError);

impl From<GameError> for ApiError {
    fn from(err: GameError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = match code {
            ErrorCode::NotAuthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::NotParticipant => StatusCode::FORBIDDEN,
            ErrorCode::RoomNotFound => StatusCode::NOT_FOUND,
            ErrorCode::RoomFull => StatusCode::CONFLICT,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        let body = json!({ "code": code, "message": self.0.client_message() });
        (status, Json(body)).into_response()
    }
}

fn bearer_user(app: &AppState, headers: &HeaderMap) -> Result<crate::server::session::AuthedUser, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(GameError::NotAuthenticated)?;
    Ok(app.sessions.authenticate(token)?)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(app): State<AppState>) -> Json<serde_json::Value> {
    let uptime = (Utc::now() - app.started_at).num_seconds();
    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "users": app.sessions.user_count(),
        "ledger_entries": app.services.wallet.ledger().len(),
    }))
}

#[derive(Deserialize)]
struct AuthRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct AuthResponse {
    user_id: UserId,
    username: String,
    token: String,
    balance: Amount,
}

async fn register(
    State(app): State<AppState>,
    Json(req): Json<AuthRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let (user, token) = app
        .sessions
        .register(&req.username, &req.password, Role::Player)?;
    let balance = app
        .services
        .wallet
        .grant_bonus(&user.user_id, app.services.config.wallet.starting_balance)?;
    Ok(Json(AuthResponse {
        user_id: user.user_id,
        username: user.username,
        token,
        balance,
    }))
}

async fn login(
    State(app): State<AppState>,
    Json(req): Json<AuthRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let (user, token) = app.sessions.login(&req.username, &req.password)?;
    let balance = app.services.wallet.balance(&user.user_id);
    Ok(Json(AuthResponse {
        user_id: user.user_id,
        username: user.username,
        token,
        balance,
    }))
}

async fn rooms(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "rooms": app.registry.list().await }))
}

async fn wallet_balance(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = bearer_user(&app, &headers)?;
    let balance = app.services.wallet.balance(&user.user_id);
    Ok(Json(json!({ "user_id": user.user_id, "balance": balance })))
}

async fn wallet_history(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = bearer_user(&app, &headers)?;
    let history = app
        .services
        .wallet
        .ledger()
        .history_for_user(&user.user_id, 100);
    Ok(Json(json!({ "user_id": user.user_id, "history": history })))
}

#[derive(Deserialize)]
struct AdjustRequest {
    username: String,
    amount: Amount,
    #[serde(default)]
    reason: Option<String>,
}

async fn admin_adjust(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AdjustRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = bearer_user(&app, &headers)?;
    if !caller.is_admin() {
        return Err(GameError::NotAuthenticated.into());
    }
    let target = app
        .sessions
        .lookup_by_name(&req.username)
        .ok_or_else(|| GameError::Validation(format!("no such user '{}'", req.username)))?;
    let reason = req.reason.unwrap_or_else(|| "operator adjustment".to_string());
    let balance = app.services.wallet.admin_adjust(&target, req.amount, &reason)?;
    Ok(Json(json!({ "user_id": target, "balance": balance })))
}
