//! External authentication collaborator.
//!
//! The broker never inspects credentials itself; it hands the token and
//! username to an [`AuthValidator`] and acts on the grant. JWT parsing,
//! session lookup and the like live behind this trait.

use async_trait::async_trait;

use crate::domain::UserId;

/// Successful validation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGrant {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("credential rejected: {0}")]
    Rejected(String),
    #[error("auth backend unavailable: {0}")]
    Unavailable(String),
}

/// Credential validation, called once per AUTHENTICATE frame.
///
/// The call may suspend (remote validation); the dispatcher keeps the
/// connection unauthenticated until it resolves and discards grants that
/// arrive after the connection already closed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthValidator: Send + Sync {
    async fn validate(&self, token: &str, username: &str) -> Result<AuthGrant, AuthError>;
}

/// Development validator: any non-empty token is accepted and the user id is
/// derived from the username, so reconnecting as the same name yields the
/// same identity.
#[derive(Debug, Default)]
pub struct DevAuthValidator;

#[async_trait]
impl AuthValidator for DevAuthValidator {
    async fn validate(&self, token: &str, username: &str) -> Result<AuthGrant, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::Rejected("empty token".to_string()));
        }
        if username.trim().is_empty() {
            return Err(AuthError::Rejected("empty username".to_string()));
        }
        Ok(AuthGrant {
            user_id: UserId::new(format!("user-{username}")),
            display_name: username.to_string(),
        })
    }
}
