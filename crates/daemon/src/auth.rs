//! API-key and webhook-secret checks.
//!
//! Keys come from a comma-separated setting, each entry optionally prefixed
//! with a role (`admin:key` or `readonly:key`; bare keys are admin). Secrets
//! never reach the logs; a rejected key is logged by an 8-character prefix.

use arm_transcoder_config::AuthConfig;
use std::collections::HashMap;
use thiserror::Error;

/// Access level attached to an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    ReadOnly,
}

/// Error type for failed authentication.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No key supplied where one is required (401).
    #[error("API key required")]
    MissingKey,

    /// Key supplied but unknown (403).
    #[error("invalid API key")]
    InvalidKey,

    /// Key valid but lacks the admin role (403).
    #[error("admin access required")]
    AdminRequired,

    /// Webhook secret missing or wrong (401).
    #[error("invalid webhook secret")]
    BadWebhookSecret,
}

/// API key registry.
pub struct ApiKeys {
    keys: HashMap<String, Role>,
    require_auth: bool,
}

impl ApiKeys {
    pub fn from_config(auth: &AuthConfig) -> Self {
        let mut keys = HashMap::new();
        for entry in auth.api_keys.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once(':') {
                Some((role, key)) => {
                    let role = match role.trim() {
                        "admin" => Role::Admin,
                        _ => Role::ReadOnly,
                    };
                    keys.insert(key.trim().to_string(), role);
                }
                None => {
                    keys.insert(entry.to_string(), Role::Admin);
                }
            }
        }

        if auth.require_api_auth && keys.is_empty() {
            tracing::warn!(
                "API authentication required but no keys configured; set API_KEYS"
            );
        }

        Self {
            keys,
            require_auth: auth.require_api_auth,
        }
    }

    /// Verifies a key from the request header, returning its role.
    ///
    /// With auth disabled every caller is admin, matching the single-operator
    /// deployment the service ships for.
    pub fn verify(&self, key: Option<&str>) -> Result<Role, AuthError> {
        if !self.require_auth {
            return Ok(Role::Admin);
        }

        let key = key.ok_or(AuthError::MissingKey)?;
        match self.keys.get(key) {
            Some(role) => Ok(*role),
            None => {
                let prefix: String = key.chars().take(8).collect();
                tracing::warn!("invalid API key attempt: {prefix}...");
                Err(AuthError::InvalidKey)
            }
        }
    }

    /// Verifies a key and requires the admin role.
    pub fn require_admin(&self, key: Option<&str>) -> Result<Role, AuthError> {
        match self.verify(key)? {
            Role::Admin => Ok(Role::Admin),
            Role::ReadOnly => Err(AuthError::AdminRequired),
        }
    }
}

/// Checks the webhook secret header against the configured secret.
///
/// An empty configured secret disables the check; when configured it is
/// always enforced, regardless of `require_api_auth`.
pub fn verify_webhook_secret(
    configured: &str,
    header: Option<&str>,
) -> Result<(), AuthError> {
    if configured.is_empty() {
        return Ok(());
    }
    match header {
        Some(supplied) if supplied == configured => Ok(()),
        _ => Err(AuthError::BadWebhookSecret),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(require: bool, keys: &str) -> AuthConfig {
        AuthConfig {
            require_api_auth: require,
            api_keys: keys.to_string(),
            webhook_secret: String::new(),
        }
    }

    #[test]
    fn test_auth_disabled_grants_admin() {
        let keys = ApiKeys::from_config(&config(false, ""));
        assert_eq!(keys.verify(None).unwrap(), Role::Admin);
        assert_eq!(keys.require_admin(None).unwrap(), Role::Admin);
    }

    #[test]
    fn test_bare_key_is_admin() {
        let keys = ApiKeys::from_config(&config(true, "sekrit"));
        assert_eq!(keys.verify(Some("sekrit")).unwrap(), Role::Admin);
    }

    #[test]
    fn test_role_prefixed_keys() {
        let keys = ApiKeys::from_config(&config(true, "admin:a1, readonly:r1"));
        assert_eq!(keys.verify(Some("a1")).unwrap(), Role::Admin);
        assert_eq!(keys.verify(Some("r1")).unwrap(), Role::ReadOnly);
        assert_eq!(
            keys.require_admin(Some("r1")).unwrap_err(),
            AuthError::AdminRequired
        );
    }

    #[test]
    fn test_missing_key_when_required() {
        let keys = ApiKeys::from_config(&config(true, "k"));
        assert_eq!(keys.verify(None).unwrap_err(), AuthError::MissingKey);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let keys = ApiKeys::from_config(&config(true, "k"));
        assert_eq!(keys.verify(Some("wrong")).unwrap_err(), AuthError::InvalidKey);
    }

    #[test]
    fn test_webhook_secret_unconfigured_allows_all() {
        assert!(verify_webhook_secret("", None).is_ok());
        assert!(verify_webhook_secret("", Some("anything")).is_ok());
    }

    #[test]
    fn test_webhook_secret_enforced_when_set() {
        assert!(verify_webhook_secret("s3cret", Some("s3cret")).is_ok());
        assert_eq!(
            verify_webhook_secret("s3cret", None).unwrap_err(),
            AuthError::BadWebhookSecret
        );
        assert_eq!(
            verify_webhook_secret("s3cret", Some("wrong")).unwrap_err(),
            AuthError::BadWebhookSecret
        );
    }
}
