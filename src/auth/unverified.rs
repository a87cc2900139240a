//! Unverified token inspection.
//!
//! Nothing in this module checks a signature. The answers come from data an
//! attacker controls, so they are for diagnostics and logging only and must
//! never feed an authorization decision. Use [`TokenService`] for that.
//!
//! [`TokenService`]: crate::auth::jwt::TokenService

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Deserialize)]
struct ExpiryOnly {
    exp: i64,
}

/// Reads `exp` from the payload segment without verifying the token.
///
/// Tokens that cannot be decoded report `true`.
pub fn peek_expired_unverified(token: &str, now: DateTime<Utc>) -> bool {
    match peek_expiry(token) {
        Some(exp) => exp <= now.timestamp(),
        None => true,
    }
}

fn peek_expiry(token: &str) -> Option<i64> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice::<ExpiryOnly>(&bytes).ok().map(|c| c.exp)
}
