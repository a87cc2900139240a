//! JWT Token Service
//! Mission: Mint and verify access/refresh tokens with one immutable signing config

use crate::auth::models::{AccessClaims, Principal, RefreshClaims, ACCESS_ISSUER, REFRESH_ISSUER};
use chrono::{DateTime, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Token failure taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("signing secret is not configured")]
    NotInitialized,
    #[error("token lifetimes must be non-zero, access shorter than refresh, at most ten years")]
    InvalidLifetimes,
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token was issued for a different purpose")]
    WrongIssuer,
    #[error("token has expired")]
    Expired,
    #[error("token is not valid yet")]
    NotYetValid,
    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Longest lifetime either token kind may be configured with.
pub const MAX_TOKEN_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// Signing secret and token lifetimes. Built once at startup.
#[derive(Clone)]
pub struct SigningConfig {
    secret: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl SigningConfig {
    pub fn new(
        secret: impl Into<String>,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Result<Self, TokenError> {
        let secret = secret.into();
        if secret.trim().is_empty() {
            return Err(TokenError::NotInitialized);
        }
        if access_ttl.as_secs() == 0 || access_ttl >= refresh_ttl || refresh_ttl > MAX_TOKEN_TTL {
            return Err(TokenError::InvalidLifetimes);
        }

        Ok(Self {
            secret,
            access_ttl,
            refresh_ttl,
        })
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }
}

impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningConfig")
            .field("secret", &"<redacted>")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish()
    }
}

/// Issues and validates access and refresh tokens.
///
/// Holds no per-call mutable state; share it behind an `Arc`.
pub struct TokenService {
    config: SigningConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    expiry_probe: Validation,
}

/// The one claim read before the signature is checked.
#[derive(Deserialize)]
struct ExpiryClaim {
    exp: i64,
}

impl TokenService {
    pub fn new(config: SigningConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        // Only HS256 is accepted. Registered claims are checked by hand
        // against an explicit clock reading.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let mut expiry_probe = validation.clone();
        expiry_probe.insecure_disable_signature_validation();

        Self {
            config,
            encoding_key,
            decoding_key,
            validation,
            expiry_probe,
        }
    }

    pub fn config(&self) -> &SigningConfig {
        &self.config
    }

    /// Access token lifetime in whole seconds.
    pub fn access_ttl_secs(&self) -> i64 {
        ttl_secs(self.config.access_ttl)
    }

    pub fn issue_access_token(&self, principal: &Principal) -> Result<String, TokenError> {
        self.issue_access_token_at(principal, Utc::now())
    }

    pub fn issue_access_token_at(
        &self,
        principal: &Principal,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let iat = now.timestamp();
        let claims = AccessClaims {
            user_id: principal.user_id.clone(),
            username: principal.username.clone(),
            role: principal.role,
            iss: ACCESS_ISSUER.to_string(),
            sub: principal.user_id.clone(),
            iat,
            nbf: iat,
            exp: iat + self.access_ttl_secs(),
            jti: Uuid::new_v4().to_string(),
        };

        debug!(
            user_id = %principal.user_id,
            role = %principal.role,
            exp = claims.exp,
            "Issuing access token"
        );

        self.sign(&claims)
    }

    pub fn issue_refresh_token(&self, user_id: &str) -> Result<String, TokenError> {
        self.issue_refresh_token_at(user_id, Utc::now())
    }

    pub fn issue_refresh_token_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let iat = now.timestamp();
        let claims = RefreshClaims {
            iss: REFRESH_ISSUER.to_string(),
            sub: user_id.to_string(),
            iat,
            nbf: iat,
            exp: iat + ttl_secs(self.config.refresh_ttl),
            jti: Uuid::new_v4().to_string(),
        };

        debug!(user_id, exp = claims.exp, "Issuing refresh token");

        self.sign(&claims)
    }

    pub fn validate_access_token(&self, token: &str) -> Result<AccessClaims, TokenError> {
        self.validate_access_token_at(token, Utc::now())
    }

    /// Verify an access token against the clock reading `now`.
    ///
    /// A token whose `exp` has passed is reported as `Expired` whatever its
    /// signature. Otherwise checks run in order: algorithm and signature,
    /// issuer, then the validity window. Any structural problem is reported
    /// as `Malformed`.
    pub fn validate_access_token_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessClaims, TokenError> {
        let claims: AccessClaims = self.verify(token, ACCESS_ISSUER, now)?;
        check_window(claims.nbf, claims.exp, now)?;
        Ok(claims)
    }

    /// Returns the subject of a valid refresh token.
    pub fn validate_refresh_token(&self, token: &str) -> Result<String, TokenError> {
        self.validate_refresh_token_at(token, Utc::now())
    }

    pub fn validate_refresh_token_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let claims: RefreshClaims = self.verify(token, REFRESH_ISSUER, now)?;
        check_window(claims.nbf, claims.exp, now)?;
        Ok(claims.sub)
    }

    fn sign<T: Serialize>(&self, claims: &T) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    fn verify<T: DeserializeOwned>(
        &self,
        token: &str,
        issuer: &str,
        now: DateTime<Utc>,
    ) -> Result<T, TokenError> {
        // Unverified, so it may only turn a rejection into `Expired`. A token
        // that passes here still has its signature checked below.
        if let Some(exp) = self.unverified_expiry(token) {
            if exp <= now.timestamp() {
                return Err(TokenError::Expired);
            }
        }

        // Decode into an untyped map first so an issuer mismatch is reported
        // as such instead of as a missing field.
        let data = decode::<serde_json::Value>(token, &self.decoding_key, &self.validation)
            .map_err(|e| classify(e.kind()))?;

        match data.claims.get("iss").and_then(|v| v.as_str()) {
            Some(iss) if iss == issuer => {}
            Some(_) => return Err(TokenError::WrongIssuer),
            None => return Err(TokenError::Malformed),
        }

        serde_json::from_value(data.claims).map_err(|_| TokenError::Malformed)
    }

    fn unverified_expiry(&self, token: &str) -> Option<i64> {
        decode::<ExpiryClaim>(token, &self.decoding_key, &self.expiry_probe)
            .ok()
            .map(|data| data.claims.exp)
    }
}

// Lifetimes are capped at `MAX_TOKEN_TTL`, far below `i64::MAX` seconds.
fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}

fn check_window(nbf: i64, exp: i64, now: DateTime<Utc>) -> Result<(), TokenError> {
    let now = now.timestamp();
    if exp <= now {
        return Err(TokenError::Expired);
    }
    if nbf > now {
        return Err(TokenError::NotYetValid);
    }
    Ok(())
}

fn classify(kind: &ErrorKind) -> TokenError {
    match kind {
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm | ErrorKind::MissingAlgorithm => {
            TokenError::InvalidSignature
        }
        ErrorKind::InvalidIssuer => TokenError::WrongIssuer,
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::ImmatureSignature => TokenError::NotYetValid,
        _ => TokenError::Malformed,
    }
}
