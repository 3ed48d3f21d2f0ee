//! Token minting and refresh token verification.
//!
//! Tokens of one response are minted in a fixed order with the same signing
//! key: access token, then ID token (its `at_hash` covers the serialized
//! access token), then refresh token.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Validation, decode, decode_header};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::AuthResult;
use crate::error::AuthError;
use crate::keys::KeyCache;
use crate::token::jwt::{
    AccessTokenClaims, Confirmation, IdTokenClaims, RefreshTokenClaims, left_half_hash,
};

/// Claims enrichment may never set these.
pub const RESERVED_CLAIMS: &[&str] = &[
    "iss", "sub", "aud", "exp", "iat", "nbf", "jti", "scope", "client_id", "cnf", "auth_time",
    "nonce", "acr", "at_hash", "azp", "rtv",
];

/// ID token inputs.
#[derive(Debug, Clone, Default)]
pub struct IdTokenRequest {
    /// Nonce from the authorization request.
    pub nonce: Option<String>,
    /// End-user authentication time.
    pub auth_time: Option<i64>,
    /// Authentication context class.
    pub acr: Option<String>,
    /// Lifetime of the ID token.
    pub lifetime: Duration,
}

/// Refresh token inputs, as returned by the family store.
#[derive(Debug, Clone)]
pub struct RefreshTokenRequest {
    /// Shard-addressed JTI.
    pub jti: String,
    /// Family version.
    pub rtv: u64,
    /// Family expiry; the token expires with it.
    pub expires_at: OffsetDateTime,
}

/// Everything needed to mint one token response.
#[derive(Debug, Clone)]
pub struct MintRequest {
    /// End user (or client for client-only grants).
    pub subject: String,
    /// Client the tokens are issued to.
    pub client_id: String,
    /// Granted scope, space-delimited.
    pub scope: String,
    /// Access token JTI. Reserved before any state change so replay handling
    /// can revoke it.
    pub access_token_jti: String,
    /// Access token lifetime.
    pub access_token_lifetime: Duration,
    /// DPoP key thumbprint to bind the tokens to.
    pub dpop_jkt: Option<String>,
    /// Extra claims for the access and ID tokens.
    pub extra_claims: Map<String, Value>,
    /// Mint an ID token.
    pub id_token: Option<IdTokenRequest>,
    /// Mint a refresh token.
    pub refresh_token: Option<RefreshTokenRequest>,
}

/// The tokens of one response.
#[derive(Debug, Clone)]
pub struct MintedTokens {
    /// Serialized access token.
    pub access_token: String,
    /// Its `jti`.
    pub access_token_jti: String,
    /// Seconds until the access token expires.
    pub expires_in: u64,
    /// Serialized ID token.
    pub id_token: Option<String>,
    /// Serialized refresh token.
    pub refresh_token: Option<String>,
    /// `kid` of the signing key used.
    pub kid: String,
}

/// Signs tokens for one issuer.
pub struct TokenMinter {
    issuer: String,
    keys: Arc<KeyCache>,
}

impl TokenMinter {
    /// Creates a minter for `issuer` signing through `keys`.
    pub fn new(issuer: impl Into<String>, keys: Arc<KeyCache>) -> Self {
        Self {
            issuer: issuer.into(),
            keys,
        }
    }

    /// Issuer placed in every token.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// The key cache used for signing and verification.
    #[must_use]
    pub fn keys(&self) -> &Arc<KeyCache> {
        &self.keys
    }

    /// Mints the tokens of one response.
    ///
    /// # Errors
    ///
    /// Returns a server error if no signing key is available or signing
    /// fails. Nothing is returned partially.
    pub async fn mint(&self, request: MintRequest) -> AuthResult<MintedTokens> {
        let key = self.keys.signing_key(None).await?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let cnf = request
            .dpop_jkt
            .as_ref()
            .map(|jkt| Confirmation { jkt: jkt.clone() });
        let extra = sanitize_claims(request.extra_claims);

        let access_lifetime = request.access_token_lifetime.as_secs();
        let access_claims = AccessTokenClaims {
            iss: self.issuer.clone(),
            sub: request.subject.clone(),
            aud: vec![request.client_id.clone()],
            exp: now + access_lifetime as i64,
            iat: now,
            jti: request.access_token_jti.clone(),
            scope: request.scope.clone(),
            client_id: request.client_id.clone(),
            cnf: cnf.clone(),
            extra: extra.clone(),
        };
        let access_token = key.sign(&access_claims)?;

        let id_token = match request.id_token {
            Some(id) => {
                let claims = IdTokenClaims {
                    iss: self.issuer.clone(),
                    sub: request.subject.clone(),
                    aud: request.client_id.clone(),
                    exp: now + id.lifetime.as_secs() as i64,
                    iat: now,
                    auth_time: id.auth_time,
                    nonce: id.nonce,
                    acr: id.acr,
                    at_hash: Some(left_half_hash(&access_token, key.algorithm)),
                    azp: request.client_id.clone(),
                    extra,
                };
                Some(key.sign(&claims)?)
            }
            None => None,
        };

        let refresh_token = match request.refresh_token {
            Some(refresh) => {
                let claims = RefreshTokenClaims {
                    iss: self.issuer.clone(),
                    sub: request.subject.clone(),
                    aud: request.client_id.clone(),
                    exp: refresh.expires_at.unix_timestamp(),
                    iat: now,
                    jti: refresh.jti,
                    rtv: refresh.rtv,
                    client_id: request.client_id.clone(),
                    scope: request.scope.clone(),
                    cnf,
                };
                Some(key.sign(&claims)?)
            }
            None => None,
        };

        Ok(MintedTokens {
            access_token,
            access_token_jti: request.access_token_jti,
            expires_in: access_lifetime,
            id_token,
            refresh_token,
            kid: key.kid.clone(),
        })
    }

    /// Verifies a presented refresh token and returns its claims.
    ///
    /// The verification key is looked up by the header `kid`, so a token
    /// signed by a freshly rotated key triggers one key set refetch.
    ///
    /// # Errors
    ///
    /// Returns `InvalidGrant` for malformed, forged, expired, or foreign
    /// tokens, `KeyRevoked` if the `kid` is no longer published, and a server
    /// error if the Key Manager is unavailable.
    pub async fn verify_refresh_token(&self, token: &str) -> AuthResult<RefreshTokenClaims> {
        let header = decode_header(token)
            .map_err(|_| AuthError::invalid_grant("Malformed refresh token"))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::invalid_grant("Refresh token has no key id"))?;
        let key = self.keys.verification_key(&kid).await?;
        if header.alg != key.algorithm {
            return Err(AuthError::invalid_grant("Refresh token algorithm mismatch"));
        }

        let mut validation = Validation::new(key.algorithm);
        validation.validate_aud = false;
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = 0;

        let data = decode::<RefreshTokenClaims>(token, &key.key, &validation).map_err(|e| {
            tracing::debug!(error = %e, "Refresh token rejected");
            AuthError::invalid_grant("Invalid refresh token")
        })?;
        Ok(data.claims)
    }
}

/// Drops claims that would collide with registered ones.
#[must_use]
pub fn sanitize_claims(mut claims: Map<String, Value>) -> Map<String, Value> {
    claims.retain(|name, _| {
        let reserved = RESERVED_CLAIMS.contains(&name.as_str());
        if reserved {
            tracing::debug!(claim = %name, "Ignoring reserved claim from enrichment");
        }
        !reserved
    });
    claims
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::LocalKeyManager;
    use crate::token::SigningAlgorithm;
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    use serde_json::json;

    fn minter() -> TokenMinter {
        let manager = Arc::new(LocalKeyManager::new(SigningAlgorithm::ES384, 1).unwrap());
        let keys = Arc::new(KeyCache::new(
            manager,
            Duration::from_secs(600),
            Duration::from_secs(300),
        ));
        TokenMinter::new("https://idp.example.com", keys)
    }

    fn request() -> MintRequest {
        MintRequest {
            subject: "alice".to_string(),
            client_id: "app".to_string(),
            scope: "openid offline_access".to_string(),
            access_token_jti: "at-1".to_string(),
            access_token_lifetime: Duration::from_secs(900),
            dpop_jkt: None,
            extra_claims: Map::new(),
            id_token: None,
            refresh_token: None,
        }
    }

    fn payload(token: &str) -> Value {
        let segment = token.split('.').nth(1).unwrap();
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segment).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_id_token_at_hash_covers_access_token() {
        let minter = minter();
        let mut req = request();
        req.id_token = Some(IdTokenRequest {
            nonce: Some("n-1".to_string()),
            lifetime: Duration::from_secs(600),
            ..IdTokenRequest::default()
        });

        let minted = minter.mint(req).await.unwrap();
        let id = payload(minted.id_token.as_deref().unwrap());
        assert_eq!(
            id["at_hash"],
            json!(left_half_hash(&minted.access_token, SigningAlgorithm::ES384))
        );
        assert_eq!(id["nonce"], json!("n-1"));
        assert_eq!(id["azp"], json!("app"));
        assert_eq!(minted.expires_in, 900);
    }

    #[tokio::test]
    async fn test_dpop_binding_lands_in_cnf() {
        let minter = minter();
        let mut req = request();
        req.dpop_jkt = Some("thumb".to_string());
        req.refresh_token = Some(RefreshTokenRequest {
            jti: "v1_0_abc".to_string(),
            rtv: 1,
            expires_at: OffsetDateTime::now_utc() + Duration::from_secs(3600),
        });

        let minted = minter.mint(req).await.unwrap();
        assert_eq!(payload(&minted.access_token)["cnf"]["jkt"], json!("thumb"));
        assert_eq!(
            payload(minted.refresh_token.as_deref().unwrap())["cnf"]["jkt"],
            json!("thumb")
        );
    }

    #[tokio::test]
    async fn test_reserved_enrichment_claims_are_dropped() {
        let minter = minter();
        let mut req = request();
        req.extra_claims = json!({"sub": "mallory", "roles": ["admin"]})
            .as_object()
            .cloned()
            .unwrap();

        let minted = minter.mint(req).await.unwrap();
        let claims = payload(&minted.access_token);
        assert_eq!(claims["sub"], json!("alice"));
        assert_eq!(claims["roles"], json!(["admin"]));
    }

    #[tokio::test]
    async fn test_refresh_token_verifies() {
        let minter = minter();
        let mut req = request();
        req.refresh_token = Some(RefreshTokenRequest {
            jti: "v1_2_xyz".to_string(),
            rtv: 3,
            expires_at: OffsetDateTime::now_utc() + Duration::from_secs(3600),
        });
        let minted = minter.mint(req).await.unwrap();

        let claims = minter
            .verify_refresh_token(minted.refresh_token.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(claims.rtv, 3);
        assert_eq!(claims.jti, "v1_2_xyz");
    }

    #[tokio::test]
    async fn test_refresh_token_from_other_issuer_is_rejected() {
        let minter = minter();
        let other = TokenMinter::new("https://evil.example.com", minter.keys().clone());
        let mut req = request();
        req.refresh_token = Some(RefreshTokenRequest {
            jti: "v1_2_xyz".to_string(),
            rtv: 1,
            expires_at: OffsetDateTime::now_utc() + Duration::from_secs(3600),
        });
        let minted = other.mint(req).await.unwrap();

        let err = minter
            .verify_refresh_token(minted.refresh_token.as_deref().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidGrant { .. }));
    }

    #[tokio::test]
    async fn test_garbage_refresh_token_is_invalid_grant() {
        let err = minter().verify_refresh_token("abc").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidGrant { .. }));
    }
}
