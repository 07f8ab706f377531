//! Workspace authentication.
//!
//! This module handles:
//! - Password hashing for workspace credentials
//! - Login, registering unknown workspaces on first use
//! - The middleware turning an access token into an [`AuthWorkspace`]

mod token;

pub use token::{AccessToken, TokenConfig, TokenError, TokenService};

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rand::RngCore;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::storage::{Repository, StorageError, Workspace};
use crate::sync::WorkspaceId;

/// Verified workspace of the current request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthWorkspace(pub WorkspaceId);

/// Errors that can occur while authenticating a request
#[derive(Error, Debug)]
pub enum AuthError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("Invalid workspace name or password")]
    InvalidCredentials,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::Token(_) | AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AuthError::Storage(e) => {
                error!("Authentication failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Random hex salt
pub fn generate_salt() -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    hex::encode(salt)
}

/// Hex SHA-256 of salt followed by password
pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn verify_password(workspace: &Workspace, password: &str) -> bool {
    hash_password(&workspace.salt, password) == workspace.password_hash
}

/// Check credentials, registering the workspace if the name is new.
pub async fn authenticate(
    repo: &dyn Repository,
    name: &str,
    password: &str,
) -> Result<Workspace, AuthError> {
    if name.trim().is_empty() || password.is_empty() {
        return Err(AuthError::InvalidCredentials);
    }

    if let Some(workspace) = repo.fetch_workspace(name).await? {
        return check(workspace, password);
    }

    let salt = generate_salt();
    let password_hash = hash_password(&salt, password);
    match repo.add_workspace(name, &salt, &password_hash).await {
        Ok(workspace) => {
            info!(workspace_id = workspace.id, "Registered workspace {}", name);
            Ok(workspace)
        }
        // Lost a registration race; the other login owns the name now
        Err(StorageError::AlreadyExists(_)) => match repo.fetch_workspace(name).await? {
            Some(workspace) => check(workspace, password),
            None => Err(AuthError::InvalidCredentials),
        },
        Err(e) => Err(e.into()),
    }
}

fn check(workspace: Workspace, password: &str) -> Result<Workspace, AuthError> {
    if verify_password(&workspace, password) {
        Ok(workspace)
    } else {
        Err(AuthError::InvalidCredentials)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// `token` query parameter, for browser WebSocket clients that cannot set
/// headers
fn query_token(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, value)| *key == "token" && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// Reject requests without a valid access token.
pub async fn require_workspace(
    State(tokens): State<Arc<TokenService>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = bearer_token(req.headers())
        .or_else(|| query_token(req.uri().query()))
        .ok_or(TokenError::MissingToken)?;

    let workspace_id = tokens.verify(&token)?;
    req.extensions_mut().insert(AuthWorkspace(workspace_id));

    Ok(next.run(req).await)
}
