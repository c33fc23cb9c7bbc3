use axum::http::{header, HeaderMap};
use std::collections::HashMap;

/// Identity of the caller of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
}

/// Authentication error
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication credentials")]
    MissingCredentials,

    #[error("Invalid authentication credentials")]
    InvalidCredentials,
}

/// Resolves request credentials to a caller identity
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, AuthError>;
}

/// API key authenticator. Keys arrive in `X-API-Key` or as a bearer token.
pub struct ApiKeyAuth {
    /// Map of API key -> user id
    keys: HashMap<String, String>,
}

impl ApiKeyAuth {
    pub fn new(api_keys: &[String]) -> Self {
        let mut keys = HashMap::new();

        for key_config in api_keys {
            // Format: "api_key:user_id"
            match key_config.split_once(':') {
                Some((key, user)) if !key.is_empty() && !user.is_empty() => {
                    keys.insert(key.to_string(), user.to_string());
                }
                _ => tracing::warn!("ignoring malformed API key entry"),
            }
        }

        Self { keys }
    }
}

impl Authenticator for ApiKeyAuth {
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, AuthError> {
        let api_key = headers
            .get("X-API-Key")
            .and_then(|h| h.to_str().ok())
            .or_else(|| {
                headers
                    .get(header::AUTHORIZATION)
                    .and_then(|h| h.to_str().ok())
                    .and_then(|h| h.strip_prefix("Bearer "))
            })
            .ok_or(AuthError::MissingCredentials)?;

        let user_id = self
            .keys
            .get(api_key.trim())
            .ok_or(AuthError::InvalidCredentials)?;

        Ok(AuthContext {
            user_id: user_id.clone(),
        })
    }
}

/// No-op authenticator for development (no auth required)
pub struct NoAuth {
    default_user_id: String,
}

impl NoAuth {
    pub fn new(default_user_id: impl Into<String>) -> Self {
        Self {
            default_user_id: default_user_id.into(),
        }
    }
}

impl Authenticator for NoAuth {
    fn authenticate(&self, _headers: &HeaderMap) -> Result<AuthContext, AuthError> {
        Ok(AuthContext {
            user_id: self.default_user_id.clone(),
        })
    }
}
