//! JWT bearer grant (RFC 7523 §2.1).
//!
//! A trusted issuer asserts an end-user identity. The assertion must be
//! signed by a key from the issuer's configured JWKS, be addressed to this
//! server, live no longer than the assertion limit, and carry a fresh `jti`
//! when it has one. No refresh token is issued.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Validation, decode, decode_header};
use serde::Deserialize;
use time::OffsetDateTime;

use super::{GrantContext, GrantDecision, GrantOrchestrator, new_access_token_jti};
use crate::AuthResult;
use crate::config::TrustedIssuer;
use crate::error::AuthError;
use crate::oauth::TokenRequest;
use crate::types::Scope;

#[derive(Debug, Deserialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    exp: i64,
    #[serde(default)]
    jti: Option<String>,
}

impl GrantOrchestrator {
    pub(crate) async fn jwt_bearer(
        &self,
        ctx: &GrantContext,
        request: &TokenRequest,
    ) -> AuthResult<GrantDecision> {
        let assertion = TokenRequest::require(&request.assertion, "assertion")?;
        let issuer = self.trusted_issuer(assertion)?;

        let header = decode_header(assertion)
            .map_err(|_| AuthError::invalid_grant("Malformed assertion"))?;
        let jwk = issuer
            .jwks
            .find(header.kid.as_deref())
            .ok_or_else(|| AuthError::invalid_grant("No trusted key matches the assertion"))?;
        let (key, key_alg) = jwk
            .to_decoding_key()
            .map_err(|e| AuthError::configuration(format!("Trusted issuer key: {e}")))?;
        if key_alg != header.alg {
            return Err(AuthError::invalid_grant("Assertion algorithm mismatch"));
        }

        let mut validation = Validation::new(key_alg);
        validation.set_issuer(&[issuer.issuer.as_str()]);
        validation.set_audience(&[
            self.settings.token_endpoint.as_str(),
            self.minter.issuer(),
        ]);
        validation.set_required_spec_claims(&["exp", "iss", "sub", "aud"]);

        let claims = decode::<AssertionClaims>(assertion, &key, &validation)
            .map_err(|e| {
                tracing::debug!(issuer = %issuer.issuer, error = %e, "Assertion rejected");
                AuthError::invalid_grant("Invalid assertion")
            })?
            .claims;

        let now = OffsetDateTime::now_utc();
        if claims.exp > (now + self.settings.assertion_max_lifetime).unix_timestamp() {
            return Err(AuthError::invalid_grant("Assertion lifetime is too long"));
        }
        if let Some(jti) = &claims.jti {
            let expires_at = OffsetDateTime::from_unix_timestamp(claims.exp)
                .map_err(|_| AuthError::invalid_grant("Invalid exp timestamp"))?;
            let key = format!("jwt_bearer:{}:{jti}", claims.iss);
            if !self.assertion_jtis.mark_used(&key, expires_at).await? {
                tracing::warn!(issuer = %claims.iss, jti = %jti, "Assertion replayed");
                return Err(AuthError::invalid_grant("Assertion jti already used"));
            }
        }

        let requested = request
            .scope
            .as_deref()
            .map(Scope::parse)
            .unwrap_or_default();
        if !issuer.scopes.is_empty() {
            let allowed = Scope::parse(&issuer.scopes.join(" "));
            if !requested.is_subset_of(&allowed) {
                return Err(AuthError::invalid_scope(
                    "Scope not permitted for the assertion issuer",
                ));
            }
        }
        let scope = ctx
            .client
            .client
            .permitted_scope(&requested)
            .ok_or_else(|| AuthError::invalid_scope("Scope not permitted for this client"))?;

        Ok(GrantDecision {
            subject: claims.sub,
            scope: scope.to_string(),
            access_token_jti: new_access_token_jti(),
            id_token: None,
            refresh_token: None,
        })
    }

    /// Finds the trusted issuer named by the unverified `iss`.
    fn trusted_issuer(&self, assertion: &str) -> AuthResult<&TrustedIssuer> {
        #[derive(Deserialize)]
        struct IssuerOnly {
            iss: String,
        }

        let payload = assertion
            .split('.')
            .nth(1)
            .ok_or_else(|| AuthError::invalid_grant("Malformed assertion"))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::invalid_grant("Malformed assertion"))?;
        let IssuerOnly { iss } = serde_json::from_slice(&bytes)
            .map_err(|_| AuthError::invalid_grant("Assertion has no issuer"))?;

        self.settings
            .trusted_issuers
            .iter()
            .find(|t| t.issuer == iss)
            .ok_or_else(|| {
                tracing::debug!(issuer = %iss, "Assertion from untrusted issuer");
                AuthError::invalid_grant("Untrusted assertion issuer")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::super::TokenEndpointRequest;
    use super::super::tests::{ISSUER, client, form, harness_with, jwt_payload};
    use crate::config::{AuthConfig, TrustedIssuer};
    use crate::token::{Jwks, SigningAlgorithm, SigningKeyPair};
    use crate::types::GrantType;
    use serde_json::json;
    use time::OffsetDateTime;

    const PARTNER: &str = "https://partner.example.com";

    fn setup(scopes: &[&str]) -> (super::super::tests::Harness, SigningKeyPair) {
        let key = SigningKeyPair::generate(SigningAlgorithm::ES384).unwrap();
        let mut jwks = Jwks::new();
        jwks.add_key(key.to_jwk());
        let mut config = AuthConfig::new(ISSUER);
        config.jwt_bearer.trusted_issuers.push(TrustedIssuer {
            issuer: PARTNER.to_string(),
            jwks,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        });
        let h = harness_with(config, vec![client("app", &[GrantType::JwtBearer])]);
        (h, key)
    }

    fn assertion(key: &SigningKeyPair, jti: &str, lifetime: i64) -> String {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        key.sign(&json!({
            "iss": PARTNER,
            "sub": "bob",
            "aud": format!("{ISSUER}/token"),
            "iat": now,
            "exp": now + lifetime,
            "jti": jti,
        }))
        .unwrap()
    }

    fn request(assertion: &str, scope: &str) -> TokenEndpointRequest {
        TokenEndpointRequest::new(form(&[
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", assertion),
            ("scope", scope),
            ("client_id", "app"),
            ("client_secret", "s3cret"),
        ]))
    }

    #[tokio::test]
    async fn test_trusted_assertion_is_exchanged() {
        let (h, key) = setup(&[]);
        let response = h
            .orchestrator
            .handle(request(&assertion(&key, "a-1", 120), "read"))
            .await
            .unwrap();
        assert_eq!(jwt_payload(&response.access_token)["sub"], "bob");
        assert_eq!(response.scope, "read");
        assert!(response.refresh_token.is_none());
        assert!(response.id_token.is_none());
    }

    #[tokio::test]
    async fn test_replayed_assertion_is_rejected() {
        let (h, key) = setup(&[]);
        let assertion = assertion(&key, "a-1", 120);
        assert!(h.orchestrator.handle(request(&assertion, "read")).await.is_ok());
        let err = h
            .orchestrator
            .handle(request(&assertion, "read"))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_grant");
    }

    #[tokio::test]
    async fn test_untrusted_key_and_long_lifetime() {
        let (h, _) = setup(&[]);
        let stranger = SigningKeyPair::generate(SigningAlgorithm::ES384).unwrap();
        let err = h
            .orchestrator
            .handle(request(&assertion(&stranger, "a-2", 120), "read"))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_grant");

        let (h, key) = setup(&[]);
        let err = h
            .orchestrator
            .handle(request(&assertion(&key, "a-3", 3600), "read"))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_grant");
    }

    #[tokio::test]
    async fn test_issuer_scope_limit() {
        let (h, key) = setup(&["read"]);
        let err = h
            .orchestrator
            .handle(request(&assertion(&key, "a-4", 120), "read write"))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_scope");
    }
}
