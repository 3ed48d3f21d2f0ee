//! OAuth 2.0 client metadata as served by the client directory.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::oauth::TokenEndpointAuthMethod;
use crate::token::Jwks;
use crate::types::Scope;

// =============================================================================
// Grant Type
// =============================================================================

/// Grant types accepted at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrantType {
    /// Authorization code (RFC 6749 §4.1).
    #[serde(rename = "authorization_code")]
    AuthorizationCode,
    /// Refresh token (RFC 6749 §6).
    #[serde(rename = "refresh_token")]
    RefreshToken,
    /// JWT bearer assertion (RFC 7523 §2.1).
    #[serde(rename = "urn:ietf:params:oauth:grant-type:jwt-bearer")]
    JwtBearer,
    /// Device authorization (RFC 8628).
    #[serde(rename = "urn:ietf:params:oauth:grant-type:device_code")]
    DeviceCode,
    /// Client-initiated backchannel authentication, poll mode.
    #[serde(rename = "urn:openid:params:grant-type:ciba")]
    Ciba,
}

impl GrantType {
    /// Returns the `grant_type` parameter value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::RefreshToken => "refresh_token",
            Self::JwtBearer => "urn:ietf:params:oauth:grant-type:jwt-bearer",
            Self::DeviceCode => "urn:ietf:params:oauth:grant-type:device_code",
            Self::Ciba => "urn:openid:params:grant-type:ciba",
        }
    }

    /// Parses a `grant_type` parameter value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "authorization_code" => Some(Self::AuthorizationCode),
            "refresh_token" => Some(Self::RefreshToken),
            "urn:ietf:params:oauth:grant-type:jwt-bearer" => Some(Self::JwtBearer),
            "urn:ietf:params:oauth:grant-type:device_code" => Some(Self::DeviceCode),
            "urn:openid:params:grant-type:ciba" => Some(Self::Ciba),
            _ => None,
        }
    }
}

impl std::fmt::Display for GrantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Client
// =============================================================================

/// Registered OAuth client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    /// Client identifier.
    pub client_id: String,

    /// Shared secret for `client_secret_*` methods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Registered token endpoint authentication method.
    #[serde(default = "default_auth_method")]
    pub token_endpoint_auth_method: TokenEndpointAuthMethod,

    /// Grant types the client may use.
    pub grant_types: Vec<GrantType>,

    /// Registered redirect URIs.
    #[serde(default)]
    pub redirect_uris: Vec<String>,

    /// Scopes the client may obtain. Empty means any scope.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Public keys for `private_key_jwt`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks: Option<Jwks>,

    /// Require every token request to carry a DPoP proof (RFC 9449 §5.2).
    #[serde(default)]
    pub dpop_bound_access_tokens: bool,

    /// Access token lifetime override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_lifetime: Option<i64>,

    /// Refresh token lifetime override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_lifetime: Option<i64>,

    /// Whether the client may currently obtain tokens.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_auth_method() -> TokenEndpointAuthMethod {
    TokenEndpointAuthMethod::ClientSecretBasic
}

fn default_active() -> bool {
    true
}

impl Client {
    /// Returns `true` if the client authenticates without credentials.
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.token_endpoint_auth_method == TokenEndpointAuthMethod::None
    }

    /// Returns `true` if the client is registered for the grant type.
    #[must_use]
    pub fn allows_grant(&self, grant_type: GrantType) -> bool {
        self.grant_types.contains(&grant_type)
    }

    /// Returns `true` if the redirect URI exactly matches a registered one.
    #[must_use]
    pub fn is_redirect_uri_allowed(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|allowed| allowed == uri)
    }

    /// Restricts a requested scope to what the client may obtain.
    ///
    /// Returns `None` if any requested token is not allowed.
    #[must_use]
    pub fn permitted_scope(&self, requested: &Scope) -> Option<Scope> {
        if self.scopes.is_empty() {
            return Some(requested.clone());
        }
        let allowed = Scope::parse(&self.scopes.join(" "));
        requested.is_subset_of(&allowed).then(|| requested.clone())
    }

    /// Compares a presented secret with the registered one.
    ///
    /// Both sides are hashed first so the comparison time does not depend on
    /// how much of the secret matched.
    #[must_use]
    pub fn verify_secret(&self, presented: &str) -> bool {
        let Some(secret) = &self.client_secret else {
            return false;
        };
        let expected = Sha256::digest(secret.as_bytes());
        let actual = Sha256::digest(presented.as_bytes());
        expected
            .iter()
            .zip(actual.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Access token lifetime in seconds, honouring the client override.
    #[must_use]
    pub fn access_token_lifetime_or(&self, default: i64) -> i64 {
        self.access_token_lifetime.unwrap_or(default)
    }

    /// Refresh token lifetime in seconds, honouring the client override.
    #[must_use]
    pub fn refresh_token_lifetime_or(&self, default: i64) -> i64 {
        self.refresh_token_lifetime.unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client {
            client_id: "web".to_string(),
            client_secret: Some("s3cret".to_string()),
            token_endpoint_auth_method: TokenEndpointAuthMethod::ClientSecretBasic,
            grant_types: vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
            redirect_uris: vec!["https://app.example.com/cb".to_string()],
            scopes: vec!["openid".to_string(), "profile".to_string()],
            jwks: None,
            dpop_bound_access_tokens: false,
            access_token_lifetime: None,
            refresh_token_lifetime: Some(60),
            active: true,
        }
    }

    #[test]
    fn test_grant_type_round_trip() {
        for grant in [
            GrantType::AuthorizationCode,
            GrantType::RefreshToken,
            GrantType::JwtBearer,
            GrantType::DeviceCode,
            GrantType::Ciba,
        ] {
            assert_eq!(GrantType::parse(grant.as_str()), Some(grant));
        }
        assert_eq!(GrantType::parse("password"), None);
    }

    #[test]
    fn test_grant_type_serde_uses_wire_names() {
        let json = serde_json::to_string(&GrantType::Ciba).unwrap();
        assert_eq!(json, "\"urn:openid:params:grant-type:ciba\"");
    }

    #[test]
    fn test_verify_secret() {
        let client = client();
        assert!(client.verify_secret("s3cret"));
        assert!(!client.verify_secret("s3cre"));
        assert!(!client.verify_secret(""));
    }

    #[test]
    fn test_permitted_scope() {
        let client = client();
        assert!(client.permitted_scope(&Scope::parse("openid")).is_some());
        assert!(client.permitted_scope(&Scope::parse("openid admin")).is_none());
    }

    #[test]
    fn test_lifetime_overrides() {
        let client = client();
        assert_eq!(client.access_token_lifetime_or(3600), 3600);
        assert_eq!(client.refresh_token_lifetime_or(3600), 60);
    }
}
