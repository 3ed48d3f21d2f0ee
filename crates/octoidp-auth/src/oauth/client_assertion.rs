//! JWT client assertion validation (RFC 7523 §2.2, OIDC Core §9).
//!
//! One validator serves both assertion-based authentication methods:
//!
//! - `client_secret_jwt` - HMAC (HS256/HS384/HS512) keyed with the client secret
//! - `private_key_jwt` - asymmetric signature verified with the client's JWKS
//!
//! # Claim Requirements
//!
//! - `iss` and `sub` must equal the client_id
//! - `aud` must contain the token endpoint URL or the issuer
//! - `exp` must not be further in the future than the configured maximum
//! - `jti` must not have been seen before for this client

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::AuthResult;
use crate::error::AuthError;
use crate::oauth::TokenEndpointAuthMethod;
use crate::storage::JtiStorage;
use crate::types::Client;

/// The only supported `client_assertion_type`.
pub const JWT_BEARER_ASSERTION_TYPE: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Claims of a client assertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAssertionClaims {
    /// Issuer - must be the client_id.
    pub iss: String,

    /// Subject - must be the client_id.
    pub sub: String,

    /// Audience, a single string or an array.
    pub aud: StringOrArray,

    /// Expiration time as Unix timestamp.
    pub exp: i64,

    /// JWT ID, single use.
    pub jti: String,

    /// Issued at time as Unix timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

/// Audience claim can be a single string or an array of strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrArray {
    /// Single string audience.
    String(String),
    /// Array of audience strings.
    Array(Vec<String>),
}

impl StringOrArray {
    /// Checks if the audience contains the specified value.
    #[must_use]
    pub fn contains(&self, value: &str) -> bool {
        match self {
            Self::String(s) => s == value,
            Self::Array(arr) => arr.iter().any(|s| s == value),
        }
    }
}

/// Validates client assertions and records their JTIs.
pub struct ClientAssertionValidator {
    token_endpoint: String,
    issuer: String,
    max_lifetime: Duration,
    jti_storage: Arc<dyn JtiStorage>,
}

impl ClientAssertionValidator {
    /// Creates a validator accepting the token endpoint URL and the issuer
    /// as audiences.
    pub fn new(
        token_endpoint: impl Into<String>,
        issuer: impl Into<String>,
        max_lifetime: Duration,
        jti_storage: Arc<dyn JtiStorage>,
    ) -> Self {
        Self {
            token_endpoint: token_endpoint.into(),
            issuer: issuer.into(),
            max_lifetime,
            jti_storage,
        }
    }

    /// Validates an assertion presented by `client`.
    ///
    /// The key is chosen by the client's registered method: its secret for
    /// `client_secret_jwt`, its JWKS entry matching the header `kid` for
    /// `private_key_jwt`.
    ///
    /// # Errors
    ///
    /// Returns `invalid_client` for any signature, claim, lifetime or replay
    /// failure.
    pub async fn validate(
        &self,
        assertion: &str,
        client: &Client,
    ) -> AuthResult<ClientAssertionClaims> {
        let header = jsonwebtoken::decode_header(assertion)
            .map_err(|e| AuthError::invalid_client(format!("Malformed client assertion: {e}")))?;

        let decoding_key = match client.token_endpoint_auth_method {
            TokenEndpointAuthMethod::ClientSecretJwt => {
                if !is_hmac(header.alg) {
                    return Err(AuthError::invalid_client(
                        "client_secret_jwt requires an HMAC algorithm",
                    ));
                }
                let secret = client
                    .client_secret
                    .as_deref()
                    .ok_or_else(|| AuthError::invalid_client("Client has no secret"))?;
                DecodingKey::from_secret(secret.as_bytes())
            }
            TokenEndpointAuthMethod::PrivateKeyJwt => {
                if is_hmac(header.alg) {
                    return Err(AuthError::invalid_client(
                        "private_key_jwt requires an asymmetric algorithm",
                    ));
                }
                let jwks = client
                    .jwks
                    .as_ref()
                    .ok_or_else(|| AuthError::invalid_client("Client has no registered keys"))?;
                let jwk = jwks.find(header.kid.as_deref()).ok_or_else(|| {
                    AuthError::invalid_client("No registered key matches the assertion kid")
                })?;
                let (key, key_alg) = jwk
                    .to_decoding_key()
                    .map_err(|e| AuthError::invalid_client(e.to_string()))?;
                if jwk.alg.is_some() && key_alg != header.alg {
                    return Err(AuthError::invalid_client(
                        "Assertion algorithm does not match the registered key",
                    ));
                }
                key
            }
            other => {
                return Err(AuthError::invalid_client(format!(
                    "Client is registered for {other}, not an assertion method"
                )));
            }
        };

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[self.token_endpoint.as_str(), self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub", "aud"]);

        let claims = jsonwebtoken::decode::<ClientAssertionClaims>(
            assertion,
            &decoding_key,
            &validation,
        )
        .map_err(|e| {
            tracing::debug!(client_id = %client.client_id, error = %e, "Client assertion rejected");
            AuthError::invalid_client(format!("Invalid client assertion: {e}"))
        })?
        .claims;

        if claims.iss != client.client_id || claims.sub != client.client_id {
            return Err(AuthError::invalid_client(
                "Assertion iss and sub must equal client_id",
            ));
        }
        if !claims.aud.contains(&self.token_endpoint) && !claims.aud.contains(&self.issuer) {
            return Err(AuthError::invalid_client(
                "Assertion audience must contain the token endpoint or issuer",
            ));
        }

        let now = OffsetDateTime::now_utc();
        let max_exp = now + self.max_lifetime;
        if claims.exp > max_exp.unix_timestamp() {
            return Err(AuthError::invalid_client(format!(
                "Assertion exp must be within {} seconds",
                self.max_lifetime.as_secs()
            )));
        }

        let expires_at = OffsetDateTime::from_unix_timestamp(claims.exp)
            .map_err(|_| AuthError::invalid_client("Invalid exp timestamp"))?;
        let key = format!("client_assertion:{}:{}", client.client_id, claims.jti);
        if !self.jti_storage.mark_used(&key, expires_at).await? {
            tracing::warn!(
                client_id = %client.client_id,
                jti = %claims.jti,
                "Client assertion replayed"
            );
            return Err(AuthError::invalid_client("Assertion jti already used"));
        }

        Ok(claims)
    }
}

fn is_hmac(alg: Algorithm) -> bool {
    matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}

/// Extracts the client ID from an unverified assertion.
///
/// Only used to find the client whose key verifies the assertion; the
/// signature is checked afterwards.
///
/// # Errors
///
/// Returns `invalid_client` if the JWT is malformed or names no client.
pub fn extract_client_id_unverified(assertion: &str) -> AuthResult<String> {
    let mut parts = assertion.split('.');
    let (Some(_), Some(payload), Some(_), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::invalid_client("Invalid JWT format"));
    };

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AuthError::invalid_client("Invalid JWT payload encoding"))?;

    #[derive(Deserialize)]
    struct MinimalClaims {
        #[serde(default)]
        iss: Option<String>,
        #[serde(default)]
        sub: Option<String>,
    }

    let claims: MinimalClaims = serde_json::from_slice(&payload_bytes)
        .map_err(|_| AuthError::invalid_client("Invalid JWT payload JSON"))?;

    // Prefer `iss` but fall back to `sub`
    claims
        .iss
        .or(claims.sub)
        .ok_or_else(|| AuthError::invalid_client("JWT missing iss and sub claims"))
}
