//! User accounts and bearer-token sessions.
//!
//! Passwords and tokens are stored as salted SHA-256 digests; the plaintext
//! token is returned once at register/login and never kept. This is a play
//! money service, so there is no token expiry or refresh.

use crate::errors::{GameError, GameResult};
use crate::UserId;
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Player,
    Admin,
}

#[derive(Debug)]
pub struct User {
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
    salt: String,
    password_hash: String,
}

/// The identity attached to an authenticated connection or request.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
}

impl AuthedUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

pub struct Sessions {
    by_name: DashMap<String, Arc<User>>,
    by_id: DashMap<UserId, Arc<User>>,
    /// SHA-256 of the bearer token -> user id.
    tokens: DashMap<String, UserId>,
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

fn valid_username(username: &str) -> bool {
    (3..=20).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Sessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            by_name: DashMap::new(),
            by_id: DashMap::new(),
            tokens: DashMap::new(),
        })
    }

    pub fn user_count(&self) -> usize {
        self.by_id.len()
    }

    /// Create an account and a first session token.
    pub fn register(
        &self,
        username: &str,
        password: &str,
        role: Role,
    ) -> GameResult<(AuthedUser, String)> {
        if !valid_username(username) {
            return Err(GameError::Validation(
                "username must be 3-20 characters: letters, digits, underscore".into(),
            ));
        }
        if password.len() < 6 {
            return Err(GameError::Validation(
                "password must be at least 6 characters".into(),
            ));
        }
        let salt = random_hex(16);
        let user = Arc::new(User {
            user_id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            role,
            password_hash: sha256_hex(&format!("{}{}", salt, password)),
            salt,
        });
        // The name entry is the uniqueness gate.
        match self.by_name.entry(username.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(GameError::Validation("username already taken".into()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(user.clone());
            }
        }
        self.by_id.insert(user.user_id.clone(), user.clone());
        info!(user_id = %user.user_id, username = %user.username, "user registered");
        Ok(self.issue_token(&user))
    }

    pub fn login(&self, username: &str, password: &str) -> GameResult<(AuthedUser, String)> {
        let user = self
            .by_name
            .get(username)
            .map(|entry| entry.clone())
            .ok_or(GameError::NotAuthenticated)?;
        let hash = sha256_hex(&format!("{}{}", user.salt, password));
        if hash != user.password_hash {
            return Err(GameError::NotAuthenticated);
        }
        Ok(self.issue_token(&user))
    }

    fn issue_token(&self, user: &Arc<User>) -> (AuthedUser, String) {
        let token = random_hex(32);
        self.tokens
            .insert(sha256_hex(&token), user.user_id.clone());
        (
            AuthedUser {
                user_id: user.user_id.clone(),
                username: user.username.clone(),
                role: user.role,
            },
            token,
        )
    }

    pub fn authenticate(&self, token: &str) -> GameResult<AuthedUser> {
        let user_id = self
            .tokens
            .get(&sha256_hex(token))
            .map(|entry| entry.clone())
            .ok_or(GameError::NotAuthenticated)?;
        let user = self
            .by_id
            .get(&user_id)
            .map(|entry| entry.clone())
            .ok_or(GameError::NotAuthenticated)?;
        Ok(AuthedUser {
            user_id: user.user_id.clone(),
            username: user.username.clone(),
            role: user.role,
        })
    }

    pub fn lookup_by_name(&self, username: &str) -> Option<UserId> {
        self.by_name.get(username).map(|user| user.user_id.clone())
    }
}
