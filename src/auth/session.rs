//! Session Service
//! Mission: Turn verified principals and refresh tokens into fresh token pairs

use crate::auth::{
    jwt::{TokenError, TokenService},
    models::{Principal, TokenPair},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Checks login credentials. Implemented by the user store collaborator.
pub trait CredentialVerifier: Send + Sync {
    fn verify_credentials(&self, username: &str, password: &str) -> Option<Principal>;
}

/// Resolves a subject to its current principal when a refresh token is redeemed.
pub trait PrincipalDirectory: Send + Sync {
    fn find_principal(&self, user_id: &str) -> Option<Principal>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("subject {0} is no longer known")]
    UnknownSubject(String),
}

/// Issues token pairs for login and refresh.
pub struct SessionService {
    tokens: Arc<TokenService>,
    directory: Arc<dyn PrincipalDirectory>,
}

impl SessionService {
    pub fn new(tokens: Arc<TokenService>, directory: Arc<dyn PrincipalDirectory>) -> Self {
        Self { tokens, directory }
    }

    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    /// Mint a pair for a principal whose credentials were already checked.
    pub fn authenticate(&self, principal: &Principal) -> Result<TokenPair, TokenError> {
        self.authenticate_at(principal, Utc::now())
    }

    pub fn authenticate_at(
        &self,
        principal: &Principal,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, TokenError> {
        let access_token = self.tokens.issue_access_token_at(principal, now)?;
        let refresh_token = self.tokens.issue_refresh_token_at(&principal.user_id, now)?;

        info!(
            user_id = %principal.user_id,
            role = %principal.role,
            "Session issued"
        );

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer",
            expires_in: self.tokens.access_ttl_secs(),
        })
    }

    /// Redeem a refresh token for a brand-new pair.
    ///
    /// Username and role come from the directory, not from the old token.
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair, SessionError> {
        self.refresh_at(refresh_token, Utc::now())
    }

    pub fn refresh_at(
        &self,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, SessionError> {
        let user_id = self.tokens.validate_refresh_token_at(refresh_token, now)?;

        let Some(principal) = self.directory.find_principal(&user_id) else {
            warn!(user_id = %user_id, "Refresh for unknown subject");
            return Err(SessionError::UnknownSubject(user_id));
        };

        Ok(self.authenticate_at(&principal, now)?)
    }
}
