//! API authentication via bearer tokens.
//!
//! Credentials are verified by an [`Authenticator`], which maps a bearer
//! token to the user it was issued for. The middleware stores the result as
//! an [`AuthedUser`] request extension for handlers to read.

use std::collections::HashMap;
use std::path::Path;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rand::Rng;
use tracing::{debug, info, warn};

use compass_core::config::AuthConfig;
use compass_core::types::UserId;

use crate::error::ApiError;
use crate::state::AppState;

/// Verifies bearer credentials.
pub trait Authenticator: Send + Sync {
    /// The user a token belongs to, or `None` if it is unknown.
    fn authenticate(&self, token: &str) -> Option<UserId>;
}

/// Fixed token-to-user table, read from the `[auth]` config section.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    tokens: HashMap<String, UserId>,
}

impl TokenTable {
    pub fn from_config(config: &AuthConfig) -> Self {
        let tokens = config
            .tokens
            .iter()
            .filter(|(token, user)| !token.trim().is_empty() && !user.trim().is_empty())
            .map(|(token, user)| (token.trim().to_string(), UserId::new(user.trim())))
            .collect();
        Self { tokens }
    }

    pub fn insert(&mut self, token: impl Into<String>, user: UserId) {
        self.tokens.insert(token.into(), user);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for TokenTable {
    fn authenticate(&self, token: &str) -> Option<UserId> {
        self.tokens.get(token).cloned()
    }
}

/// The authenticated caller, inserted by [`require_auth`].
#[derive(Debug, Clone)]
pub struct AuthedUser(pub UserId);

/// Generate a random 32-character hex token.
pub fn generate_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    hex::encode(bytes)
}

/// Load token from file, or generate and save a new one.
pub fn load_or_generate_token(token_path: &Path) -> String {
    if let Ok(contents) = std::fs::read_to_string(token_path) {
        let token = contents.trim().to_string();
        if !token.is_empty() {
            info!("API token loaded from {}", token_path.display());
            return token;
        }
    }

    let token = generate_token();

    if let Some(parent) = token_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(token_path, &token) {
        warn!(error = %e, "Failed to save API token to {}", token_path.display());
    } else {
        // Owner-only access.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(token_path, std::fs::Permissions::from_mode(0o600));
        }
        info!("API token saved to {}", token_path.display());
    }

    token
}

/// Middleware that validates `Authorization: Bearer <token>`.
///
/// Returns 401 if the header is missing, malformed or names an unknown token.
pub async fn require_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let header = match req.headers().get("authorization") {
        Some(value) => value,
        None => {
            return ApiError::Unauthorized("Missing Authorization header".into()).into_response()
        }
    };

    let value = match header.to_str() {
        Ok(s) => s,
        Err(_) => {
            return ApiError::Unauthorized("Invalid Authorization header encoding".into())
                .into_response()
        }
    };

    let user = value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .and_then(|token| state.authenticator.authenticate(token));

    match user {
        Some(user) => {
            debug!(user_id = %user, "Request authenticated");
            req.extensions_mut().insert(AuthedUser(user));
            next.run(req).await
        }
        None => ApiError::Unauthorized("Invalid bearer token".into()).into_response(),
    }
}
