//! HTTP surface of the server.
//!
//! Routes:
//! - `GET /health` and `POST /v1/auth/login` are public
//! - `/v1/api/file` CRUD and the `/v1/sync` WebSocket require a workspace token

mod files;
mod ws;

use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::auth::{self, AuthError, TokenService};
use crate::storage::{ObjectStorage, Repository, StorageError};
use crate::sync::connection::OriginPolicy;
use crate::sync::Hub;

/// Shared application state
pub struct AppState {
    pub hub: Arc<Hub>,
    pub repo: Arc<dyn Repository>,
    pub storage: Arc<dyn ObjectStorage>,
    pub tokens: Arc<TokenService>,
    pub origins: OriginPolicy,
}

/// Errors returned by HTTP handlers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Auth(e) => return e.into_response(),
            ApiError::Storage(StorageError::NotFound(what)) => {
                (StatusCode::NOT_FOUND, format!("{} not found", what))
            }
            ApiError::Storage(e) => {
                error!("Storage error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    connections: usize,
    files: usize,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    name: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
    expires_at: u64,
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats().await;

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: stats.uptime_secs,
        connections: stats.connections,
        files: stats.files,
    })
}

/// Exchange workspace credentials for an access token
async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let workspace = auth::authenticate(state.repo.as_ref(), &payload.name, &payload.password).await?;
    let token = state
        .tokens
        .issue(workspace.id)
        .map_err(AuthError::from)?;

    Ok(Json(LoginResponse {
        token: token.token,
        expires_at: token.expires_at,
    }))
}

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let protected = Router::new()
        .route("/v1/api/file", get(files::list_files).post(files::create_file))
        .route(
            "/v1/api/file/:id",
            get(files::get_file).delete(files::delete_file),
        )
        .route("/v1/sync", get(ws::ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.tokens.clone(),
            auth::require_workspace,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/v1/auth/login", post(login))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}


#[cfg(test)]
mod tests {
    use super::test_support::TestApp;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn login_request(name: &str, password: &str) -> Request<Body> {
        Request::post("/v1/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({ "name": name, "password": password }).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = TestApp::new();

        let response = app
            .router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn test_login_issues_verifiable_token() {
        let app = TestApp::new();

        let response = app
            .router()
            .oneshot(login_request("team", "secret"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let token = body["token"].as_str().unwrap();
        assert!(app.state.tokens.verify(token).is_ok());

        let response = app
            .router()
            .oneshot(login_request("team", "wrong"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_protected_routes_need_token() {
        let app = TestApp::new();

        let response = app
            .router()
            .oneshot(Request::get("/v1/api/file").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .router()
            .oneshot(
                Request::get("/v1/api/file")
                    .header(header::AUTHORIZATION, "Bearer not-a-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_sync_requires_upgrade() {
        let app = TestApp::new();
        let (_, token) = app.login("team").await;

        let response = app
            .router()
            .oneshot(
                Request::get(format!("/v1/sync?token={}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
