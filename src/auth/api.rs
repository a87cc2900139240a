//! Authentication API Endpoints
//! Mission: Provide login, refresh and identity endpoints

use crate::auth::{
    jwt::TokenError,
    middleware::{CurrentPrincipal, RequestIdentity},
    models::{LoginRequest, Principal, RefreshRequest, SessionResponse, TokenPair},
    session::{CredentialVerifier, SessionError, SessionService},
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Shared auth state
#[derive(Clone)]
pub struct AuthState {
    pub sessions: Arc<SessionService>,
    pub credentials: Arc<dyn CredentialVerifier>,
}

impl AuthState {
    pub fn new(sessions: Arc<SessionService>, credentials: Arc<dyn CredentialVerifier>) -> Self {
        Self {
            sessions,
            credentials,
        }
    }
}

/// Login endpoint - POST /api/auth/login
pub async fn login(
    State(state): State<AuthState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<TokenPair>, AuthApiError> {
    info!(username = %payload.username, "Login attempt");

    let Some(principal) = state
        .credentials
        .verify_credentials(&payload.username, &payload.password)
    else {
        warn!(username = %payload.username, "Failed login attempt");
        return Err(AuthApiError::InvalidCredentials);
    };

    let pair = state.sessions.authenticate(&principal).map_err(|e| {
        error!("Failed to issue session: {}", e);
        AuthApiError::InternalError
    })?;

    Ok(Json(pair))
}

/// Refresh endpoint - POST /api/auth/refresh
pub async fn refresh(
    State(state): State<AuthState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, AuthApiError> {
    match state.sessions.refresh(&payload.refresh_token) {
        Ok(pair) => Ok(Json(pair)),
        Err(SessionError::Token(TokenError::Signing(reason))) => {
            error!("Failed to issue refreshed session: {}", reason);
            Err(AuthApiError::InternalError)
        }
        Err(err) => {
            debug!(reason = %err, "Refresh rejected");
            Err(AuthApiError::InvalidRefreshToken)
        }
    }
}

/// Get current user info - GET /api/auth/me
/// Built from the access token claims; no directory lookup.
pub async fn get_current_user(CurrentPrincipal(principal): CurrentPrincipal) -> Json<Principal> {
    Json(principal)
}

/// Session probe - GET /api/auth/session (optional auth)
pub async fn get_session(identity: RequestIdentity) -> Json<SessionResponse> {
    let principal = identity.principal().cloned();
    Json(SessionResponse {
        authenticated: principal.is_some(),
        principal,
    })
}

/// Auth API errors
#[derive(Debug)]
pub enum AuthApiError {
    InvalidCredentials,
    InvalidRefreshToken,
    InternalError,
}

impl IntoResponse for AuthApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthApiError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, "Invalid username or password")
            }
            AuthApiError::InvalidRefreshToken => {
                (StatusCode::UNAUTHORIZED, "Invalid or expired refresh token")
            }
            AuthApiError::InternalError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_api_error_responses() {
        let invalid_creds = AuthApiError::InvalidCredentials.into_response();
        assert_eq!(invalid_creds.status(), StatusCode::UNAUTHORIZED);

        let invalid_refresh = AuthApiError::InvalidRefreshToken.into_response();
        assert_eq!(invalid_refresh.status(), StatusCode::UNAUTHORIZED);

        let internal = AuthApiError::InternalError.into_response();
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
