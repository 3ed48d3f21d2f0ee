//! Token endpoint request and response types.
//!
//! # Supported Grant Types
//!
//! - `authorization_code` - Exchange an authorization code for tokens
//! - `refresh_token` - Rotate a refresh token
//! - `urn:ietf:params:oauth:grant-type:jwt-bearer` - RFC 7523 assertion grant
//! - `urn:ietf:params:oauth:grant-type:device_code` - RFC 8628 device flow
//! - `urn:openid:params:grant-type:ciba` - CIBA poll mode

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::AuthResult;
use crate::error::AuthError;

/// Token request parameters.
///
/// Which fields are required depends on `grant_type`:
///
/// - `authorization_code`: code, redirect_uri, code_verifier
/// - `refresh_token`: refresh_token, (optional) scope
/// - `jwt-bearer`: assertion, (optional) scope
/// - `device_code`: device_code
/// - `ciba`: auth_req_id
///
/// Client credentials (`client_id`, `client_secret`, `client_assertion*`) may
/// accompany any grant.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    /// OAuth 2.0 grant type.
    pub grant_type: String,

    /// Authorization code.
    #[serde(default)]
    pub code: Option<String>,

    /// Redirect URI (must match the authorization request).
    #[serde(default)]
    pub redirect_uri: Option<String>,

    /// PKCE code verifier.
    #[serde(default)]
    pub code_verifier: Option<String>,

    /// Client ID (public clients, `client_secret_post`, or alongside an assertion).
    #[serde(default)]
    pub client_id: Option<String>,

    /// Client secret (`client_secret_post`).
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Client assertion type.
    #[serde(default)]
    pub client_assertion_type: Option<String>,

    /// Client assertion JWT (`client_secret_jwt` / `private_key_jwt`).
    #[serde(default)]
    pub client_assertion: Option<String>,

    /// Refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Requested scope.
    #[serde(default)]
    pub scope: Option<String>,

    /// Authorization grant assertion (jwt-bearer grant).
    #[serde(default)]
    pub assertion: Option<String>,

    /// Device code (device grant).
    #[serde(default)]
    pub device_code: Option<String>,

    /// Backchannel authentication request ID (CIBA grant).
    #[serde(default)]
    pub auth_req_id: Option<String>,
}

impl TokenRequest {
    /// Parses an `application/x-www-form-urlencoded` body.
    ///
    /// Parameters sent more than once are rejected (RFC 6749 §3.2) and
    /// parameters with empty values are treated as absent.
    ///
    /// # Errors
    ///
    /// Returns `invalid_request` for repeated parameters or a missing
    /// `grant_type`.
    pub fn from_form(body: &[u8]) -> AuthResult<Self> {
        let mut params: HashMap<String, String> = HashMap::new();
        for (key, value) in url::form_urlencoded::parse(body) {
            if params.contains_key(key.as_ref()) {
                return Err(AuthError::invalid_request(format!(
                    "Parameter '{key}' is repeated"
                )));
            }
            params.insert(key.into_owned(), value.into_owned());
        }
        params.retain(|_, v| !v.is_empty());

        let mut take = |name: &str| params.remove(name);
        let grant_type = take("grant_type")
            .ok_or_else(|| AuthError::invalid_request("Missing grant_type"))?;

        Ok(Self {
            grant_type,
            code: take("code"),
            redirect_uri: take("redirect_uri"),
            code_verifier: take("code_verifier"),
            client_id: take("client_id"),
            client_secret: take("client_secret"),
            client_assertion_type: take("client_assertion_type"),
            client_assertion: take("client_assertion"),
            refresh_token: take("refresh_token"),
            scope: take("scope"),
            assertion: take("assertion"),
            device_code: take("device_code"),
            auth_req_id: take("auth_req_id"),
        })
    }

    /// Returns a required parameter or an `invalid_request` error naming it.
    ///
    /// # Errors
    ///
    /// Returns `invalid_request` when the value is absent.
    pub fn require<'a>(value: &'a Option<String>, name: &str) -> AuthResult<&'a str> {
        value
            .as_deref()
            .ok_or_else(|| AuthError::invalid_request(format!("Missing {name}")))
    }
}

/// Access token type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    /// Plain bearer token.
    Bearer,
    /// Sender-constrained token (RFC 9449).
    DPoP,
}

impl TokenType {
    /// Returns the `token_type` response value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bearer => "Bearer",
            Self::DPoP => "DPoP",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Successful token response.
///
/// ```json
/// {
///   "access_token": "eyJhbG...",
///   "token_type": "DPoP",
///   "expires_in": 3600,
///   "scope": "openid profile",
///   "refresh_token": "eyJhbG...",
///   "id_token": "eyJhbG..."
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The access token (JWT).
    pub access_token: String,

    /// `Bearer` or `DPoP`.
    pub token_type: TokenType,

    /// Access token lifetime in seconds.
    pub expires_in: u64,

    /// Granted scopes (space-separated).
    pub scope: String,

    /// Refresh token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// ID token (when `openid` was granted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl TokenResponse {
    /// Creates a response carrying only an access token.
    #[must_use]
    pub fn new(access_token: String, token_type: TokenType, expires_in: u64, scope: String) -> Self {
        Self {
            access_token,
            token_type,
            expires_in,
            scope,
            refresh_token: None,
            id_token: None,
        }
    }

    /// Adds a refresh token.
    #[must_use]
    pub fn with_refresh_token(mut self, token: String) -> Self {
        self.refresh_token = Some(token);
        self
    }

    /// Adds an ID token.
    #[must_use]
    pub fn with_id_token(mut self, token: String) -> Self {
        self.id_token = Some(token);
        self
    }
}

/// Token endpoint error response body.
///
/// ```json
/// {
///   "error": "invalid_grant",
///   "error_description": "Authorization code is invalid"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenError {
    /// OAuth 2.0 error code.
    pub error: TokenErrorCode,

    /// Human-readable error description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl TokenError {
    /// Creates an error with a description.
    #[must_use]
    pub fn with_description(error: TokenErrorCode, description: impl Into<String>) -> Self {
        Self {
            error,
            error_description: Some(description.into()),
        }
    }
}

impl From<&AuthError> for TokenError {
    fn from(err: &AuthError) -> Self {
        let code = TokenErrorCode::from(err);
        // Internal failures are not described to the caller.
        let description = if err.is_server_error() {
            "The server encountered an unexpected error".to_string()
        } else if matches!(err, AuthError::KeyRevoked { .. }) {
            "Invalid refresh token".to_string()
        } else {
            err.to_string()
        };
        Self::with_description(code, description)
    }
}

/// OAuth 2.0 token error codes (RFC 6749 §5.2 plus RFC 8628, RFC 9449 and CIBA).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenErrorCode {
    /// Malformed request.
    InvalidRequest,
    /// Client authentication failed.
    InvalidClient,
    /// Invalid, expired, revoked or replayed grant.
    InvalidGrant,
    /// Client not registered for the grant type.
    UnauthorizedClient,
    /// Unknown grant type.
    UnsupportedGrantType,
    /// Scope invalid or exceeding the grant.
    InvalidScope,
    /// Invalid DPoP proof.
    InvalidDpopProof,
    /// Device or CIBA authorization not completed yet.
    AuthorizationPending,
    /// Polling too fast.
    SlowDown,
    /// Device code or CIBA request expired.
    ExpiredToken,
    /// End user denied the request.
    AccessDenied,
    /// Unexpected server failure.
    ServerError,
}

impl TokenErrorCode {
    /// Returns the string representation of the error code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::InvalidScope => "invalid_scope",
            Self::InvalidDpopProof => "invalid_dpop_proof",
            Self::AuthorizationPending => "authorization_pending",
            Self::SlowDown => "slow_down",
            Self::ExpiredToken => "expired_token",
            Self::AccessDenied => "access_denied",
            Self::ServerError => "server_error",
        }
    }

    /// Returns the HTTP status code for this error.
    ///
    /// `invalid_client` is 400 here; the HTTP layer upgrades it to 401 when
    /// the client authenticated through the `Authorization` header.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ServerError => 500,
            _ => 400,
        }
    }
}

impl From<&AuthError> for TokenErrorCode {
    fn from(err: &AuthError) -> Self {
        match err {
            AuthError::InvalidRequest { .. } => Self::InvalidRequest,
            AuthError::InvalidClient { .. } => Self::InvalidClient,
            AuthError::InvalidGrant { .. } | AuthError::KeyRevoked { .. } => Self::InvalidGrant,
            AuthError::UnauthorizedClient { .. } => Self::UnauthorizedClient,
            AuthError::UnsupportedGrantType { .. } => Self::UnsupportedGrantType,
            AuthError::InvalidScope { .. } => Self::InvalidScope,
            AuthError::InvalidDpopProof { .. } => Self::InvalidDpopProof,
            AuthError::AuthorizationPending => Self::AuthorizationPending,
            AuthError::SlowDown => Self::SlowDown,
            AuthError::ExpiredToken { .. } => Self::ExpiredToken,
            AuthError::AccessDenied { .. } => Self::AccessDenied,
            AuthError::KeyManager { .. }
            | AuthError::Storage { .. }
            | AuthError::Configuration { .. }
            | AuthError::Internal { .. } => Self::ServerError,
        }
    }
}

impl fmt::Display for TokenErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_form_authorization_code() {
        let body = b"grant_type=authorization_code&code=3_abc&redirect_uri=https%3A%2F%2Fapp.example.com%2Fcb&code_verifier=xyz&client_id=app";
        let request = TokenRequest::from_form(body).unwrap();

        assert_eq!(request.grant_type, "authorization_code");
        assert_eq!(request.code.as_deref(), Some("3_abc"));
        assert_eq!(
            request.redirect_uri.as_deref(),
            Some("https://app.example.com/cb")
        );
        assert_eq!(request.client_id.as_deref(), Some("app"));
        assert!(request.refresh_token.is_none());
    }

    #[test]
    fn test_from_form_rejects_repeated_parameter() {
        let err = TokenRequest::from_form(b"grant_type=refresh_token&scope=a&scope=b").unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest { .. }));
    }

    #[test]
    fn test_from_form_empty_values_are_absent() {
        let request =
            TokenRequest::from_form(b"grant_type=refresh_token&refresh_token=rt&scope=").unwrap();
        assert!(request.scope.is_none());

        let err = TokenRequest::from_form(b"grant_type=&code=x").unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest { .. }));
    }

    #[test]
    fn test_require_names_missing_parameter() {
        let err = TokenRequest::require(&None, "code").unwrap_err();
        assert_eq!(err.to_string(), "Invalid request: Missing code");
    }

    #[test]
    fn test_token_response_serialization() {
        let response = TokenResponse::new(
            "at".to_string(),
            TokenType::DPoP,
            3600,
            "openid".to_string(),
        )
        .with_refresh_token("rt".to_string());

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["token_type"], "DPoP");
        assert_eq!(json["refresh_token"], "rt");
        assert!(json.get("id_token").is_none());
    }

    #[test]
    fn test_error_from_auth_error() {
        let body = TokenError::from(&AuthError::invalid_grant("code replayed"));
        assert_eq!(body.error, TokenErrorCode::InvalidGrant);

        let body = TokenError::from(&AuthError::storage("shard 7 timed out"));
        assert_eq!(body.error, TokenErrorCode::ServerError);
        assert!(!body.error_description.unwrap().contains("shard"));

        let json = serde_json::to_value(TokenError::from(&AuthError::invalid_dpop_proof("bad")))
            .unwrap();
        assert_eq!(json["error"], "invalid_dpop_proof");
    }

    #[test]
    fn test_revoked_key_error_hides_kid() {
        let body = TokenError::from(&AuthError::key_revoked("k1"));
        assert_eq!(body.error, TokenErrorCode::InvalidGrant);
        assert_eq!(body.error_description.as_deref(), Some("Invalid refresh token"));
    }

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(TokenErrorCode::InvalidGrant.http_status(), 400);
        assert_eq!(TokenErrorCode::ServerError.http_status(), 500);
    }
}
