//! Authentication Middleware
//! Mission: Gate API endpoints on bearer token identity and role

use crate::auth::{
    jwt::{TokenError, TokenService},
    models::Principal,
};
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, Extensions, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::headers::{authorization::Bearer, Authorization, HeaderMapExt};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a route demands of the caller's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePolicy {
    /// Any valid access token.
    Required,
    /// A valid access token carrying the admin role.
    Admin,
    /// Never rejects; identity is attached when a valid token is present.
    Optional,
}

/// Where a request stopped in the gate. Recorded in the response extensions.
///
/// The full path is `NoToken -> TokenPresent -> Validated -> IdentityAttached
/// -> {Authorized | Forbidden}`. Validation and attachment never stop a
/// request on their own, so only the stages a request can end in are listed:
/// `Authorized` and `Forbidden` imply both were passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStage {
    /// No usable `Authorization: Bearer` header.
    NoToken,
    /// A bearer token was present but failed validation.
    TokenPresent,
    Authorized,
    Forbidden,
}

/// Identity recorded in the request extensions by the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestIdentity {
    Authenticated(Principal),
    Anonymous,
}

impl RequestIdentity {
    pub fn principal(&self) -> Option<&Principal> {
        match self {
            RequestIdentity::Authenticated(principal) => Some(principal),
            RequestIdentity::Anonymous => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Rejected(AuthError),
}

/// Result of running the gate over a request's headers.
#[derive(Debug, PartialEq, Eq)]
pub struct GateOutcome {
    /// Identity to attach before the verdict is acted on, if any.
    pub identity: Option<RequestIdentity>,
    pub stage: GateStage,
    pub verdict: Verdict,
}

impl GateOutcome {
    fn unauthenticated(policy: GatePolicy, stage: GateStage, error: AuthError) -> Self {
        match policy {
            GatePolicy::Optional => Self {
                identity: Some(RequestIdentity::Anonymous),
                stage,
                verdict: Verdict::Proceed,
            },
            GatePolicy::Required | GatePolicy::Admin => Self {
                identity: None,
                stage,
                verdict: Verdict::Rejected(error),
            },
        }
    }
}

/// Decide whether a request may continue.
///
/// Pure over its inputs: the caller applies `identity` to the request and
/// then acts on `verdict`.
pub fn evaluate(
    tokens: &TokenService,
    headers: &HeaderMap,
    policy: GatePolicy,
    now: DateTime<Utc>,
) -> GateOutcome {
    let token = match bearer_token(headers) {
        Ok(Some(token)) => token,
        Ok(None) => {
            return GateOutcome::unauthenticated(policy, GateStage::NoToken, AuthError::MissingToken)
        }
        Err(err) => return GateOutcome::unauthenticated(policy, GateStage::NoToken, err),
    };

    let claims = match tokens.validate_access_token_at(&token, now) {
        Ok(claims) => claims,
        Err(err) => {
            debug!(reason = %err, ?policy, "Bearer token rejected");
            return GateOutcome::unauthenticated(
                policy,
                GateStage::TokenPresent,
                AuthError::InvalidToken(err),
            );
        }
    };

    let principal = claims.principal();
    let identity = Some(RequestIdentity::Authenticated(principal.clone()));

    if policy == GatePolicy::Admin && !principal.role.is_admin() {
        return GateOutcome {
            identity,
            stage: GateStage::Forbidden,
            verdict: Verdict::Rejected(AuthError::InsufficientRole),
        };
    }

    GateOutcome {
        identity,
        stage: GateStage::Authorized,
        verdict: Verdict::Proceed,
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<Option<String>, AuthError> {
    match headers.typed_try_get::<Authorization<Bearer>>() {
        Ok(Some(auth)) if !auth.token().trim().is_empty() => Ok(Some(auth.token().to_string())),
        Ok(Some(_)) | Err(_) => Err(AuthError::InvalidFormat),
        Ok(None) => Ok(None),
    }
}

async fn gate(tokens: &TokenService, policy: GatePolicy, mut req: Request, next: Next) -> Response {
    let outcome = evaluate(tokens, req.headers(), policy, Utc::now());

    let user_id = outcome
        .identity
        .as_ref()
        .and_then(RequestIdentity::principal)
        .map(|p| p.user_id.clone());

    if let Some(identity) = outcome.identity {
        req.extensions_mut().insert(identity);
    }

    let mut response = match outcome.verdict {
        Verdict::Proceed => next.run(req).await,
        Verdict::Rejected(err) => {
            match &err {
                AuthError::InsufficientRole => warn!(
                    user_id = user_id.as_deref().unwrap_or("-"),
                    path = %req.uri().path(),
                    "Admin route denied"
                ),
                _ => debug!(
                    stage = ?outcome.stage,
                    path = %req.uri().path(),
                    "Unauthenticated request rejected"
                ),
            }
            err.into_response()
        }
    };

    response.extensions_mut().insert(outcome.stage);
    response
}

/// Auth middleware that requires a valid access token
pub async fn require_auth(
    State(tokens): State<Arc<TokenService>>,
    req: Request,
    next: Next,
) -> Response {
    gate(&tokens, GatePolicy::Required, req, next).await
}

/// Auth middleware that requires a valid access token with the admin role
pub async fn require_admin(
    State(tokens): State<Arc<TokenService>>,
    req: Request,
    next: Next,
) -> Response {
    gate(&tokens, GatePolicy::Admin, req, next).await
}

/// Optional auth middleware - allows requests without token but adds identity if valid
pub async fn optional_auth(
    State(tokens): State<Arc<TokenService>>,
    req: Request,
    next: Next,
) -> Response {
    gate(&tokens, GatePolicy::Optional, req, next).await
}

/// Principal attached by the gate, if the request is authenticated.
pub fn current_principal(extensions: &Extensions) -> Option<&Principal> {
    extensions
        .get::<RequestIdentity>()
        .and_then(RequestIdentity::principal)
}

/// Extractor for handlers behind `require_auth` or `require_admin`.
#[derive(Debug, Clone)]
pub struct CurrentPrincipal(pub Principal);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentPrincipal
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        current_principal(&parts.extensions)
            .cloned()
            .map(CurrentPrincipal)
            .ok_or(AuthError::MissingToken)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestIdentity
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestIdentity>()
            .cloned()
            .unwrap_or(RequestIdentity::Anonymous))
    }
}

/// Auth error types
#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    MissingToken,
    InvalidFormat,
    /// The cause is kept for logs only; clients see one generic message.
    InvalidToken(TokenError),
    InsufficientRole,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization token"),
            AuthError::InvalidFormat => (
                StatusCode::UNAUTHORIZED,
                "Invalid authorization format. Use: Bearer {token}",
            ),
            AuthError::InvalidToken(_) => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::InsufficientRole => (StatusCode::FORBIDDEN, "Insufficient permissions"),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
