//! Static User Directory
//! Mission: Read-only credential lookup for the login and refresh endpoints
//!
//! Users come from configuration with pre-computed bcrypt hashes. Nothing here
//! hashes or stores passwords.

use crate::auth::{
    models::{Principal, Role},
    session::{CredentialVerifier, PrincipalDirectory},
};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use tracing::warn;

struct DirectoryEntry {
    principal: Principal,
    password_hash: String,
}

/// In-memory users keyed by username and by id.
#[derive(Default)]
pub struct StaticDirectory {
    by_username: HashMap<String, DirectoryEntry>,
    ids: HashMap<String, String>, // user_id -> username
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `user_id:username:ROLE:bcrypt_hash` entries separated by commas.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut directory = Self::new();

        for raw in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let parts: Vec<&str> = raw.splitn(4, ':').collect();
            let [user_id, username, role, hash] = parts[..] else {
                bail!("user entry must be user_id:username:ROLE:hash, got {:?}", raw);
            };
            let role: Role = role
                .parse()
                .with_context(|| format!("invalid role for user {}", username))?;

            directory.insert(Principal::new(user_id, username, role), hash)?;
        }

        Ok(directory)
    }

    pub fn insert(&mut self, principal: Principal, password_hash: impl Into<String>) -> Result<()> {
        if principal.user_id.is_empty() || principal.username.is_empty() {
            bail!("user id and username must not be empty");
        }
        if self.by_username.contains_key(&principal.username) {
            bail!("duplicate username {}", principal.username);
        }
        if self.ids.contains_key(&principal.user_id) {
            bail!("duplicate user id {}", principal.user_id);
        }

        self.ids
            .insert(principal.user_id.clone(), principal.username.clone());
        self.by_username.insert(
            principal.username.clone(),
            DirectoryEntry {
                principal,
                password_hash: password_hash.into(),
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.by_username.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_username.is_empty()
    }
}

impl CredentialVerifier for StaticDirectory {
    fn verify_credentials(&self, username: &str, password: &str) -> Option<Principal> {
        let entry = self.by_username.get(username)?;
        match bcrypt::verify(password, &entry.password_hash) {
            Ok(true) => Some(entry.principal.clone()),
            Ok(false) => None,
            Err(e) => {
                warn!(username, "Stored password hash is unusable: {}", e);
                None
            }
        }
    }
}

impl PrincipalDirectory for StaticDirectory {
    fn find_principal(&self, user_id: &str) -> Option<Principal> {
        let username = self.ids.get(user_id)?;
        self.by_username
            .get(username)
            .map(|entry| entry.principal.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(password: &str) -> String {
        bcrypt::hash(password, 4).unwrap()
    }

    #[test]
    fn test_parse_and_verify() {
        let spec = format!(
            "u1:alice:USER:{}, u2:root:ADMIN:{}",
            hash("alice-pass"),
            hash("root-pass")
        );
        let directory = StaticDirectory::parse(&spec).unwrap();
        assert_eq!(directory.len(), 2);

        let alice = directory.verify_credentials("alice", "alice-pass").unwrap();
        assert_eq!(alice, Principal::new("u1", "alice", Role::User));

        assert!(directory.verify_credentials("alice", "wrong").is_none());
        assert!(directory.verify_credentials("nobody", "alice-pass").is_none());

        assert_eq!(
            directory.find_principal("u2"),
            Some(Principal::new("u2", "root", Role::Admin))
        );
        assert!(directory.find_principal("u3").is_none());
    }

    #[test]
    fn test_parse_empty_spec() {
        let directory = StaticDirectory::parse("").unwrap();
        assert!(directory.is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_entries() {
        assert!(StaticDirectory::parse("u1:alice:USER").is_err());
        assert!(StaticDirectory::parse("u1:alice:admin:$2b$04$abc").is_err());
        assert!(StaticDirectory::parse("u1:alice:USER:h1,u1:bob:USER:h2").is_err());
        assert!(StaticDirectory::parse("u1:alice:USER:h1,u2:alice:USER:h2").is_err());
    }

    #[test]
    fn test_unusable_hash_fails_closed() {
        let directory = StaticDirectory::parse("u1:alice:USER:not-a-bcrypt-hash").unwrap();
        assert!(directory.verify_credentials("alice", "anything").is_none());
    }
}
