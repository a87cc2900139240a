//! Gate outcome logging.
//!
//! `TraceLayer` already records method, URI, status and latency for every
//! request. This layer adds what the gate knows: the client id the limiter
//! charged and the stage an identity gate stopped at.

use crate::auth::middleware::GateStage;
use crate::middleware::rate_limit::ClientId;
use axum::{
    extract::Request,
    http::{header::RETRY_AFTER, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::{debug, info, warn};

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refusal {
    Throttled,
    /// 401, from an identity gate (with its stage) or from the login/refresh handlers.
    Unauthenticated(Option<GateStage>),
    Forbidden,
}

fn refusal(status: StatusCode, stage: Option<GateStage>) -> Option<Refusal> {
    match status {
        StatusCode::TOO_MANY_REQUESTS => Some(Refusal::Throttled),
        StatusCode::UNAUTHORIZED => Some(Refusal::Unauthenticated(stage)),
        StatusCode::FORBIDDEN if stage == Some(GateStage::Forbidden) => Some(Refusal::Forbidden),
        _ => None,
    }
}

/// Logs one line per request with the limiter's client id and the gate stage.
///
/// Refusals are logged at INFO (WARN for throttling), admitted requests at DEBUG.
pub async fn log_gate_outcome(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let client = response
        .extensions()
        .get::<ClientId>()
        .map_or("unknown", |ClientId(id)| id.as_str());
    let stage = response.extensions().get::<GateStage>().copied();

    match refusal(response.status(), stage) {
        Some(Refusal::Throttled) => warn!(
            client,
            %method,
            %path,
            retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-"),
            "Rate limit exceeded"
        ),
        Some(Refusal::Unauthenticated(stage)) => info!(
            client,
            %method,
            %path,
            stage = ?stage,
            "Request refused: not authenticated"
        ),
        Some(Refusal::Forbidden) => info!(
            client,
            %method,
            %path,
            "Request refused: insufficient role"
        ),
        None => debug!(
            client,
            %method,
            %path,
            status = response.status().as_u16(),
            stage = ?stage,
            "Request admitted"
        ),
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refusal_classification() {
        assert_eq!(
            refusal(StatusCode::TOO_MANY_REQUESTS, None),
            Some(Refusal::Throttled)
        );
        assert_eq!(
            refusal(StatusCode::UNAUTHORIZED, Some(GateStage::TokenPresent)),
            Some(Refusal::Unauthenticated(Some(GateStage::TokenPresent)))
        );
        // Bad password at login: no gate involved.
        assert_eq!(
            refusal(StatusCode::UNAUTHORIZED, None),
            Some(Refusal::Unauthenticated(None))
        );
        assert_eq!(
            refusal(StatusCode::FORBIDDEN, Some(GateStage::Forbidden)),
            Some(Refusal::Forbidden)
        );
        assert_eq!(refusal(StatusCode::OK, Some(GateStage::Authorized)), None);
        assert_eq!(refusal(StatusCode::NOT_FOUND, None), None);
    }
}
