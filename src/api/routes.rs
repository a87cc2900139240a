use axum::{
    extract::State,
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::{
    api as auth_api, optional_auth, require_admin, require_auth, AuthState, CredentialVerifier,
    SessionService, TokenService,
};
use crate::middleware::{log_gate_outcome, rate_limit_middleware, ClientLimiter, RateLimitState};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub tokens: Arc<TokenService>,
    pub sessions: Arc<SessionService>,
    pub credentials: Arc<dyn CredentialVerifier>,
    pub limiter: Arc<ClientLimiter>,
    pub trust_forwarded_for: bool,
}

/// Create the API router
///
/// Every route sits behind the rate limiter; identity gates are applied per
/// route group.
pub fn build_router(state: AppState) -> Router {
    let auth_state = AuthState::new(state.sessions.clone(), state.credentials.clone());

    let auth_routes = Router::new()
        .route("/api/auth/login", post(auth_api::login))
        .route("/api/auth/refresh", post(auth_api::refresh))
        .with_state(auth_state);

    let protected_routes = Router::new()
        .route("/api/auth/me", get(auth_api::get_current_user))
        .route_layer(middleware::from_fn_with_state(
            state.tokens.clone(),
            require_auth,
        ));

    let optional_routes = Router::new()
        .route("/api/auth/session", get(auth_api::get_session))
        .route_layer(middleware::from_fn_with_state(
            state.tokens.clone(),
            optional_auth,
        ));

    let admin_routes = Router::new()
        .route("/api/admin/limiter", get(limiter_status))
        .route_layer(middleware::from_fn_with_state(
            state.tokens.clone(),
            require_admin,
        ))
        .with_state(state.limiter.clone());

    let rate_limit_state = RateLimitState {
        limiter: state.limiter.clone(),
        trust_forwarded_for: state.trust_forwarded_for,
    };

    Router::new()
        .route("/health", get(health_check))
        .merge(auth_routes)
        .merge(protected_routes)
        .merge(optional_routes)
        .merge(admin_routes)
        .layer(middleware::from_fn_with_state(
            rate_limit_state,
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn(log_gate_outcome))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ===== Route Handlers =====

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
struct LimiterStatus {
    tracked_clients: usize,
    requests_per_second: f64,
    burst: u32,
    idle_timeout_secs: u64,
}

/// Limiter status - GET /api/admin/limiter (Admin only)
async fn limiter_status(State(limiter): State<Arc<ClientLimiter>>) -> Json<LimiterStatus> {
    let config = limiter.config();
    Json(LimiterStatus {
        tracked_clients: limiter.tracked_clients(),
        requests_per_second: config.requests_per_second,
        burst: config.burst,
        idle_timeout_secs: config.idle_timeout.as_secs(),
    })
}
