//! Account actions served on the `frontend_to_backend` queue.
//!
//! Sessions use opaque bearer tokens kept in the user store: an access token
//! (1 hour), a refresh token (30 days) and a password-reset token (1 hour).
//! Redelivered `signup` requests hit the store's email uniqueness constraint
//! and answer `Email already exists`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::{text, user_id, MISSING_FIELDS};
use crate::dispatch::{ActionTable, DispatchError, HandlerError, HandlerResult};
use crate::envelope::{Payload, ResponseEnvelope};

pub const SIGNUP: &str = "signup";
pub const LOGIN: &str = "login";
pub const REFRESH_TOKEN: &str = "refresh_token";
pub const LOGOUT: &str = "logout";
pub const VERIFY_AUTH: &str = "verify_auth";
pub const FORGOT_PASSWORD: &str = "forgotPassword";
pub const UPDATE_PROFILE: &str = "updateProfile";

const MIN_PASSWORD_LEN: usize = 8;
const INVALID_ACCESS_TOKEN: &str = "Invalid or expired access token";

/// Kinds of bearer token a user can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Access,
    Refresh,
    PasswordReset,
}

impl TokenKind {
    pub fn ttl(self) -> Duration {
        match self {
            TokenKind::Access => Duration::hours(1),
            TokenKind::Refresh => Duration::days(30),
            TokenKind::PasswordReset => Duration::hours(1),
        }
    }
}

/// Salted SHA-256 digest of a password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    salt: String,
    digest: String,
}

impl Credential {
    pub fn new(password: &str) -> Self {
        let salt = Uuid::new_v4().simple().to_string();
        let digest = digest(&salt, password);
        Self { salt, digest }
    }

    pub fn verify(&self, password: &str) -> bool {
        digest(&self.salt, password) == self.digest
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// A registered account.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub credential: Credential,
}

impl User {
    /// Public fields returned to callers.
    pub fn profile(&self) -> Value {
        json!({"id": self.id, "name": self.name, "email": self.email})
    }
}

/// Fields of an account to create.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub credential: Credential,
}

/// Errors from a user store.
#[derive(Debug, thiserror::Error)]
pub enum UserStoreError {
    #[error("Email {0} is already registered")]
    EmailTaken(String),

    #[error("No user with id {0}")]
    NotFound(i64),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Accounts and their bearer tokens.
///
/// Emails are unique: `insert` or `update` onto an email held by another
/// account fails with `UserStoreError::EmailTaken`.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert(&self, user: NewUser) -> Result<User, UserStoreError>;

    async fn by_email(&self, email: &str) -> Result<Option<User>, UserStoreError>;

    async fn by_id(&self, id: i64) -> Result<Option<User>, UserStoreError>;

    async fn update(&self, user: User) -> Result<User, UserStoreError>;

    /// Issue a fresh token of `kind` for `user_id`, valid for `ttl`.
    async fn issue_token(
        &self,
        user_id: i64,
        kind: TokenKind,
        ttl: Duration,
    ) -> Result<String, UserStoreError>;

    /// Owner of an unexpired token of `kind`.
    async fn token_owner(&self, token: &str, kind: TokenKind) -> Result<Option<i64>, UserStoreError>;

    /// Revoke every token of `kind` held by `user_id`.
    async fn revoke_tokens(&self, user_id: i64, kind: TokenKind) -> Result<(), UserStoreError>;
}

struct IssuedToken {
    user_id: i64,
    kind: TokenKind,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct UserState {
    users: HashMap<i64, User>,
    emails: HashMap<String, i64>,
    tokens: HashMap<String, IssuedToken>,
    last_id: i64,
}

/// In-memory user store.
#[derive(Default)]
pub struct InMemoryUserStore {
    state: RwLock<UserState>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn insert(&self, user: NewUser) -> Result<User, UserStoreError> {
        let mut state = self.state.write().await;
        if state.emails.contains_key(&user.email) {
            return Err(UserStoreError::EmailTaken(user.email));
        }

        state.last_id += 1;
        let created = User {
            id: state.last_id,
            name: user.name,
            email: user.email,
            credential: user.credential,
        };
        state.emails.insert(created.email.clone(), created.id);
        state.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn by_email(&self, email: &str) -> Result<Option<User>, UserStoreError> {
        let state = self.state.read().await;
        Ok(state
            .emails
            .get(email)
            .and_then(|id| state.users.get(id))
            .cloned())
    }

    async fn by_id(&self, id: i64) -> Result<Option<User>, UserStoreError> {
        Ok(self.state.read().await.users.get(&id).cloned())
    }

    async fn update(&self, user: User) -> Result<User, UserStoreError> {
        let mut state = self.state.write().await;
        let Some(current_email) = state.users.get(&user.id).map(|u| u.email.clone()) else {
            return Err(UserStoreError::NotFound(user.id));
        };
        if matches!(state.emails.get(&user.email), Some(owner) if *owner != user.id) {
            return Err(UserStoreError::EmailTaken(user.email));
        }

        state.emails.remove(&current_email);
        state.emails.insert(user.email.clone(), user.id);
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn issue_token(
        &self,
        user_id: i64,
        kind: TokenKind,
        ttl: Duration,
    ) -> Result<String, UserStoreError> {
        let token = Uuid::new_v4().simple().to_string();
        self.state.write().await.tokens.insert(
            token.clone(),
            IssuedToken {
                user_id,
                kind,
                expires_at: Utc::now() + ttl,
            },
        );
        Ok(token)
    }

    async fn token_owner(&self, token: &str, kind: TokenKind) -> Result<Option<i64>, UserStoreError> {
        let now = Utc::now();
        Ok(self
            .state
            .read()
            .await
            .tokens
            .get(token)
            .filter(|t| t.kind == kind && t.expires_at > now)
            .map(|t| t.user_id))
    }

    async fn revoke_tokens(&self, user_id: i64, kind: TokenKind) -> Result<(), UserStoreError> {
        self.state
            .write()
            .await
            .tokens
            .retain(|_, t| t.user_id != user_id || t.kind != kind);
        Ok(())
    }
}

/// Action table for the auth dispatcher.
pub fn auth_table(store: Arc<dyn UserStore>) -> Result<ActionTable, DispatchError> {
    let mut table = ActionTable::new();
    register(&mut table, SIGNUP, &store, |s, p| signup(s, p).boxed())?;
    register(&mut table, LOGIN, &store, |s, p| login(s, p).boxed())?;
    register(&mut table, REFRESH_TOKEN, &store, |s, p| refresh_token(s, p).boxed())?;
    register(&mut table, LOGOUT, &store, |s, p| logout(s, p).boxed())?;
    register(&mut table, VERIFY_AUTH, &store, |s, p| verify_auth(s, p).boxed())?;
    register(&mut table, FORGOT_PASSWORD, &store, |s, p| forgot_password(s, p).boxed())?;
    register(&mut table, UPDATE_PROFILE, &store, |s, p| update_profile(s, p).boxed())?;
    Ok(table)
}

type AuthFuture = BoxFuture<'static, HandlerResult>;

/// Bind an action to a handler taking the shared store.
fn register(
    table: &mut ActionTable,
    action: &str,
    store: &Arc<dyn UserStore>,
    handler: fn(Arc<dyn UserStore>, Payload) -> AuthFuture,
) -> Result<(), DispatchError> {
    let store = Arc::clone(store);
    table.register(action, move |payload: Payload| handler(Arc::clone(&store), payload))
}

fn storage(e: UserStoreError) -> HandlerError {
    HandlerError::Storage(e.to_string())
}

pub async fn signup(store: Arc<dyn UserStore>, payload: Payload) -> HandlerResult {
    let (Some(name), Some(email), Some(password)) = (
        text(&payload, "name"),
        text(&payload, "email"),
        text(&payload, "password"),
    ) else {
        return Ok(ResponseEnvelope::error(MISSING_FIELDS));
    };

    if store.by_email(&email).await.map_err(storage)?.is_some() {
        return Ok(ResponseEnvelope::error("Email already exists"));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Ok(ResponseEnvelope::error(
            "Password must be at least 8 characters long",
        ));
    }

    let new_user = NewUser {
        name,
        email,
        credential: Credential::new(&password),
    };
    match store.insert(new_user).await {
        Ok(user) => {
            info!(user_id = user.id, "User registered");
            Ok(ResponseEnvelope::success()
                .with_message("Signup successful")
                .with("user", user.profile()))
        }
        Err(UserStoreError::EmailTaken(_)) => Ok(ResponseEnvelope::error("Email already exists")),
        Err(e) => Err(storage(e)),
    }
}

pub async fn login(store: Arc<dyn UserStore>, payload: Payload) -> HandlerResult {
    let (Some(email), Some(password)) = (text(&payload, "email"), text(&payload, "password")) else {
        return Ok(ResponseEnvelope::error(MISSING_FIELDS));
    };

    let user = match store.by_email(&email).await.map_err(storage)? {
        Some(user) if user.credential.verify(&password) => user,
        _ => return Ok(ResponseEnvelope::error("Invalid credentials")),
    };

    let access_token = store
        .issue_token(user.id, TokenKind::Access, TokenKind::Access.ttl())
        .await
        .map_err(storage)?;
    let refresh_token = store
        .issue_token(user.id, TokenKind::Refresh, TokenKind::Refresh.ttl())
        .await
        .map_err(storage)?;

    info!(user_id = user.id, "Login successful");
    Ok(ResponseEnvelope::success()
        .with_message("Login successful")
        .with("user", user.profile())
        .with(
            "tokens",
            json!({"access_token": access_token, "refresh_token": refresh_token}),
        ))
}

pub async fn refresh_token(store: Arc<dyn UserStore>, payload: Payload) -> HandlerResult {
    let Some(token) = text(&payload, "refresh_token") else {
        return Ok(ResponseEnvelope::error("Missing refresh token"));
    };

    let Some(owner) = store
        .token_owner(&token, TokenKind::Refresh)
        .await
        .map_err(storage)?
    else {
        return Ok(ResponseEnvelope::error("Invalid or expired refresh token"));
    };
    let Some(user) = store.by_id(owner).await.map_err(storage)? else {
        return Ok(ResponseEnvelope::error("User not found"));
    };

    let access_token = store
        .issue_token(user.id, TokenKind::Access, TokenKind::Access.ttl())
        .await
        .map_err(storage)?;

    Ok(ResponseEnvelope::success()
        .with_message("Token refreshed")
        .with("access_token", access_token))
}

pub async fn logout(store: Arc<dyn UserStore>, payload: Payload) -> HandlerResult {
    let Some(user_id) = user_id(&payload)? else {
        return Ok(ResponseEnvelope::error("Missing user ID"));
    };

    store
        .revoke_tokens(user_id, TokenKind::Refresh)
        .await
        .map_err(storage)?;
    store
        .revoke_tokens(user_id, TokenKind::Access)
        .await
        .map_err(storage)?;

    info!(user_id, "Logout successful");
    Ok(ResponseEnvelope::success().with_message("Logout successful"))
}

pub async fn verify_auth(store: Arc<dyn UserStore>, payload: Payload) -> HandlerResult {
    let Some(token) = text(&payload, "access_token") else {
        return Ok(ResponseEnvelope::error("Missing access token"));
    };

    let owner = store
        .token_owner(&token, TokenKind::Access)
        .await
        .map_err(storage)?;
    let user = match owner {
        Some(id) => store.by_id(id).await.map_err(storage)?,
        None => None,
    };

    Ok(match user {
        Some(user) => ResponseEnvelope::success()
            .with_message("Token valid")
            .with("user", user.profile()),
        None => ResponseEnvelope::error(INVALID_ACCESS_TOKEN),
    })
}

pub async fn forgot_password(store: Arc<dyn UserStore>, payload: Payload) -> HandlerResult {
    let Some(email) = text(&payload, "email") else {
        return Ok(ResponseEnvelope::error("Missing email"));
    };

    let Some(user) = store.by_email(&email).await.map_err(storage)? else {
        return Ok(ResponseEnvelope::error("Email not found"));
    };

    // Delivery of the reset link is outside this service.
    store
        .issue_token(
            user.id,
            TokenKind::PasswordReset,
            TokenKind::PasswordReset.ttl(),
        )
        .await
        .map_err(storage)?;

    info!(user_id = user.id, "Password reset requested");
    Ok(ResponseEnvelope::success().with_message("Password reset link has been sent to your email"))
}

pub async fn update_profile(store: Arc<dyn UserStore>, payload: Payload) -> HandlerResult {
    let user_id = if let Some(token) = text(&payload, "access_token") {
        match store
            .token_owner(&token, TokenKind::Access)
            .await
            .map_err(storage)?
        {
            Some(id) => id,
            None => return Ok(ResponseEnvelope::error(INVALID_ACCESS_TOKEN)),
        }
    } else if let Some(id) = user_id(&payload)? {
        id
    } else {
        return Ok(ResponseEnvelope::error("Authentication required"));
    };

    let Some(current) = store.by_id(user_id).await.map_err(storage)? else {
        return Ok(ResponseEnvelope::error("User not found"));
    };

    let mut updated = current.clone();
    if let Some(name) = text(&payload, "name") {
        updated.name = name;
    }
    if let Some(email) = text(&payload, "email") {
        if email != current.email {
            let taken = store.by_email(&email).await.map_err(storage)?;
            if taken.is_some_and(|other| other.id != user_id) {
                return Ok(ResponseEnvelope::error("Email is already in use"));
            }
        }
        updated.email = email;
    }
    if let (Some(old), Some(new)) = (
        text(&payload, "currentPassword"),
        text(&payload, "newPassword"),
    ) {
        if !current.credential.verify(&old) {
            return Ok(ResponseEnvelope::error("Current password is incorrect"));
        }
        if new.chars().count() < MIN_PASSWORD_LEN {
            return Ok(ResponseEnvelope::error(
                "New password must be at least 8 characters long",
            ));
        }
        updated.credential = Credential::new(&new);
    }

    if updated == current {
        return Ok(ResponseEnvelope::success().with_message("No changes to update"));
    }

    match store.update(updated).await {
        Ok(user) => {
            info!(user_id, "Profile updated");
            Ok(ResponseEnvelope::success()
                .with_message("Profile updated successfully")
                .with("user", user.profile()))
        }
        Err(UserStoreError::EmailTaken(_)) => Ok(ResponseEnvelope::error("Email is already in use")),
        Err(e) => Err(storage(e)),
    }
}
