//! Authentication state machine
//!
//! `Unauthenticated -> Authenticating -> Authenticated | AuthFailed`. Every
//! credential change goes through [`AuthManager::authenticate`]; the result is
//! what authenticated requests observe once the pending authentication settles.

use crate::error::{AgentError, Result};
use crate::protocol::ExtensionConfiguration;
use crate::sync::{read, write};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum AuthStatus {
    #[default]
    Unauthenticated,
    Authenticating {
        endpoint: String,
    },
    #[serde(rename_all = "camelCase")]
    Authenticated {
        endpoint: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    AuthFailed {
        endpoint: String,
        error: String,
    },
}

impl AuthStatus {
    pub fn authenticated(&self) -> bool {
        matches!(self, AuthStatus::Authenticated { .. })
    }

    pub fn endpoint(&self) -> Option<&str> {
        match self {
            AuthStatus::Unauthenticated => None,
            AuthStatus::Authenticating { endpoint }
            | AuthStatus::Authenticated { endpoint, .. }
            | AuthStatus::AuthFailed { endpoint, .. } => Some(endpoint),
        }
    }
}

/// Validates credentials against a server
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, config: &ExtensionConfiguration) -> Result<AuthStatus>;
}

/// Accepts any non-empty token for a well-formed endpoint
///
/// Used when no network-backed provider is installed, which is the case for
/// headless sessions and tests.
#[derive(Debug, Default)]
pub struct StaticAuthProvider;

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn authenticate(&self, config: &ExtensionConfiguration) -> Result<AuthStatus> {
        let endpoint = Url::parse(&config.server_endpoint).map_err(|e| {
            AgentError::Auth(format!(
                "Invalid server endpoint '{}': {e}",
                config.server_endpoint
            ))
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(AgentError::Auth(format!(
                "Unsupported endpoint scheme '{}'",
                endpoint.scheme()
            )));
        }

        match config.access_token.as_deref() {
            Some(token) if !token.trim().is_empty() => Ok(AuthStatus::Authenticated {
                endpoint: endpoint.to_string(),
                username: config.anonymous_user_id.clone(),
            }),
            _ => Ok(AuthStatus::Unauthenticated),
        }
    }
}

pub struct AuthManager {
    provider: Box<dyn AuthProvider>,
    status: RwLock<AuthStatus>,
}

impl AuthManager {
    pub fn new(provider: Box<dyn AuthProvider>) -> Self {
        Self {
            provider,
            status: RwLock::new(AuthStatus::Unauthenticated),
        }
    }

    pub fn status(&self) -> AuthStatus {
        read(&self.status).clone()
    }

    /// Run the provider and record the resulting state
    ///
    /// Provider errors become `AuthFailed`; they never reject the caller.
    pub async fn authenticate(&self, config: &ExtensionConfiguration) -> AuthStatus {
        let endpoint = config.server_endpoint.clone();
        *write(&self.status) = AuthStatus::Authenticating {
            endpoint: endpoint.clone(),
        };

        let status = match self.provider.authenticate(config).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Authentication against {} failed: {}", endpoint, e);
                AuthStatus::AuthFailed {
                    endpoint,
                    error: e.to_string(),
                }
            }
        };

        info!("Authentication status: {:?}", status);
        *write(&self.status) = status.clone();
        status
    }

    /// Forget the current identity
    pub fn sign_out(&self) {
        *write(&self.status) = AuthStatus::Unauthenticated;
    }
}

impl Default for AuthManager {
    fn default() -> Self {
        Self::new(Box::new(StaticAuthProvider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(endpoint: &str, token: Option<&str>) -> ExtensionConfiguration {
        ExtensionConfiguration {
            server_endpoint: endpoint.to_string(),
            access_token: token.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_token_authenticates() {
        let manager = AuthManager::default();
        assert_eq!(manager.status(), AuthStatus::Unauthenticated);

        let status = manager
            .authenticate(&config("https://example.com/", Some("secret")))
            .await;
        assert!(status.authenticated());
        assert_eq!(status.endpoint(), Some("https://example.com/"));
        assert_eq!(manager.status(), status);
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthenticated() {
        let manager = AuthManager::default();
        let status = manager
            .authenticate(&config("https://example.com/", Some("  ")))
            .await;
        assert_eq!(status, AuthStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn test_bad_endpoint_fails() {
        let manager = AuthManager::default();
        let status = manager.authenticate(&config("not a url", Some("secret"))).await;
        assert!(matches!(status, AuthStatus::AuthFailed { .. }));
        assert!(!status.authenticated());

        let status = manager
            .authenticate(&config("ftp://example.com", Some("secret")))
            .await;
        assert!(matches!(status, AuthStatus::AuthFailed { .. }));
    }

    #[test]
    fn test_status_wire_shape() {
        let status = AuthStatus::Authenticated {
            endpoint: "https://example.com/".to_string(),
            username: Some("alice".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({"status": "authenticated", "endpoint": "https://example.com/", "username": "alice"})
        );
        assert_eq!(
            serde_json::to_value(AuthStatus::Unauthenticated).unwrap(),
            json!({"status": "unauthenticated"})
        );
        assert_eq!(
            serde_json::to_value(AuthStatus::AuthFailed {
                endpoint: "x".to_string(),
                error: "y".to_string()
            })
            .unwrap()["status"],
            "authFailed"
        );
    }
}
