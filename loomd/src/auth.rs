//! Shared-secret request tokens
//!
//! A request is accepted when one of its `username` / `username_limit`
//! fields names an allow-listed user, or when its `token` field carries that
//! user's token. With no secret configured every request passes.

use loom_core::{LoomError, LoomResult, ServerConfig};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

const USER_FIELDS: [&str; 2] = ["username", "username_limit"];

/// Token for a user: hex SHA-256 of `username + secret + username`
#[must_use]
pub fn token_for(username: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(secret.as_bytes());
    hasher.update(username.as_bytes());
    hex::encode(hasher.finalize())
}

/// Request gate
#[derive(Debug, Clone, Default)]
pub struct Auth {
    secret: Option<String>,
    allowed: HashSet<String>,
}

impl Auth {
    /// Gate built from the server settings
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            secret: config.token_secret.clone().filter(|s| !s.is_empty()),
            allowed: config.allowed_users.iter().cloned().collect(),
        }
    }

    /// Whether requests are checked at all
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Token a client of `username` should send, if auth is on
    #[must_use]
    pub fn token(&self, username: &str) -> Option<String> {
        self.secret.as_deref().map(|secret| token_for(username, secret))
    }

    /// Check one request
    ///
    /// # Errors
    /// Returns `LoomError::Unauthorized` if no user field passes.
    pub fn check(&self, request: &Value) -> LoomResult<()> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let token = request.get("token").and_then(Value::as_str);

        let accepted = USER_FIELDS
            .iter()
            .filter_map(|field| request.get(*field).and_then(Value::as_str))
            .any(|user| self.allowed.contains(user) || token.is_some_and(|t| t == token_for(user, secret)));

        if accepted {
            Ok(())
        } else {
            Err(LoomError::Unauthorized("missing or invalid token".to_string()))
        }
    }
}
