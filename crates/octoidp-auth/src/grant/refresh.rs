//! Refresh token grant (RFC 6749 §6) with rotation.
//!
//! Every successful use returns a new refresh token with the next `rtv`.
//! Presenting an older version revokes the whole family.

use super::{GrantContext, GrantDecision, GrantOrchestrator, new_access_token_jti};
use crate::AuthResult;
use crate::audit::{SecurityEvent, SecurityEventKind};
use crate::error::AuthError;
use crate::oauth::TokenRequest;
use crate::shard::{RotateOutcome, RotateRequest};
use crate::token::RefreshTokenRequest;
use crate::types::Scope;

impl GrantOrchestrator {
    pub(crate) async fn refresh_token(
        &self,
        ctx: &GrantContext,
        request: &TokenRequest,
    ) -> AuthResult<GrantDecision> {
        let token = TokenRequest::require(&request.refresh_token, "refresh_token")?;

        let claims = match self.minter.verify_refresh_token(token).await {
            Ok(claims) => claims,
            Err(AuthError::KeyRevoked { kid }) => {
                tracing::warn!(
                    client_id = %ctx.client_id(),
                    kid = %kid,
                    "Refresh token signed by a revoked key"
                );
                self.audit.record(
                    SecurityEvent::new(SecurityEventKind::RevokedKey)
                        .client(ctx.client_id())
                        .with("kid", kid.clone()),
                );
                return Err(AuthError::invalid_grant("Invalid refresh token"));
            }
            Err(e) => return Err(e),
        };

        if claims.client_id != ctx.client_id() {
            tracing::warn!(
                client_id = %ctx.client_id(),
                token_client_id = %claims.client_id,
                "Refresh token presented by another client"
            );
            return Err(AuthError::invalid_grant("Invalid refresh token"));
        }
        ctx.require_binding(claims.cnf.as_ref().map(|c| c.jkt.as_str()))?;

        let outcome = self
            .refresh_families
            .rotate(RotateRequest {
                incoming_version: claims.rtv,
                incoming_jti: claims.jti.clone(),
                user_id: claims.sub.clone(),
                client_id: claims.client_id.clone(),
                requested_scope: request.scope.clone(),
            })
            .await?;

        match outcome {
            RotateOutcome::Rotated {
                new_version,
                new_jti,
                allowed_scope,
                expires_at,
                ..
            } => {
                let scope = Scope::parse(&allowed_scope);
                Ok(GrantDecision {
                    id_token: self.id_token_for(&scope, None, None, None),
                    subject: claims.sub,
                    scope: scope.to_string(),
                    access_token_jti: new_access_token_jti(),
                    refresh_token: Some(RefreshTokenRequest {
                        jti: new_jti,
                        rtv: new_version,
                        expires_at,
                    }),
                })
            }
            RotateOutcome::TheftDetected { family_id } => {
                tracing::warn!(
                    client_id = %claims.client_id,
                    subject = %claims.sub,
                    family_id = %family_id,
                    presented_version = claims.rtv,
                    "Refresh token reuse detected"
                );
                self.audit.record(
                    SecurityEvent::new(SecurityEventKind::RefreshTokenTheft)
                        .client(claims.client_id)
                        .subject(claims.sub)
                        .with("family_id", family_id)
                        .with("presented_jti", claims.jti)
                        .with("presented_version", claims.rtv),
                );
                Err(AuthError::invalid_grant("Invalid refresh token"))
            }
            RotateOutcome::Rejected(rejection) => {
                tracing::debug!(
                    client_id = %claims.client_id,
                    ?rejection,
                    "Refresh token rejected"
                );
                Err(AuthError::invalid_grant("Invalid refresh token"))
            }
            RotateOutcome::InvalidScope => Err(AuthError::invalid_scope(
                "Requested scope exceeds the original grant",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::TokenEndpointRequest;
    use crate::error::AuthError;
    use super::super::tests::{Harness, client, form, harness, jwt_payload};
    use crate::shard::AuthorizationCodeStore;
    use crate::storage::RevokedTokenStorage;
    use crate::types::{GrantType, NewAuthorizationCode};

    async fn initial_refresh_token(h: &Harness, scope: &str) -> String {
        let code = h
            .codes
            .issue(NewAuthorizationCode {
                client_id: "app".to_string(),
                subject: "alice".to_string(),
                redirect_uri: "https://app.example.com/cb".to_string(),
                scope: scope.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let response = h
            .orchestrator
            .handle(TokenEndpointRequest::new(form(&[
                ("grant_type", "authorization_code"),
                ("code", &code),
                ("redirect_uri", "https://app.example.com/cb"),
                ("client_id", "app"),
                ("client_secret", "s3cret"),
            ])))
            .await
            .unwrap();
        response.refresh_token.unwrap()
    }

    fn refresh(token: &str, scope: Option<&str>) -> TokenEndpointRequest {
        let mut pairs = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", token),
            ("client_id", "app"),
            ("client_secret", "s3cret"),
        ];
        if let Some(scope) = scope {
            pairs.push(("scope", scope));
        }
        TokenEndpointRequest::new(form(&pairs))
    }

    fn grants() -> Vec<GrantType> {
        vec![GrantType::AuthorizationCode, GrantType::RefreshToken]
    }

    #[tokio::test]
    async fn test_rotation_increments_version() {
        let h = harness(vec![client("app", &grants())]);
        let rt1 = initial_refresh_token(&h, "openid profile").await;
        assert_eq!(jwt_payload(&rt1)["rtv"], 1);

        let response = h.orchestrator.handle(refresh(&rt1, None)).await.unwrap();
        let rt2 = response.refresh_token.unwrap();
        let claims = jwt_payload(&rt2);
        assert_eq!(claims["rtv"], 2);
        assert_eq!(claims["sub"], "alice");
        assert_eq!(response.scope, "openid profile");
        assert!(response.id_token.is_some());

        let first_jti = jwt_payload(&rt1)["jti"].as_str().unwrap().to_string();
        let second_jti = claims["jti"].as_str().unwrap();
        assert_ne!(first_jti, second_jti);
        // Same generation and shard.
        let prefix = |jti: &str| jti.splitn(3, '_').take(2).collect::<Vec<_>>().join("_");
        assert_eq!(prefix(&first_jti), prefix(second_jti));
    }

    #[tokio::test]
    async fn test_stale_token_revokes_family() {
        let h = harness(vec![client("app", &grants())]);
        let rt1 = initial_refresh_token(&h, "profile").await;
        let rt2 = h
            .orchestrator
            .handle(refresh(&rt1, None))
            .await
            .unwrap()
            .refresh_token
            .unwrap();

        let theft = h.orchestrator.handle(refresh(&rt1, None)).await.unwrap_err();
        assert_eq!(theft.oauth_error_code(), "invalid_grant");

        let legit = h.orchestrator.handle(refresh(&rt2, None)).await.unwrap_err();
        assert_eq!(legit.oauth_error_code(), "invalid_grant");
    }

    #[tokio::test]
    async fn test_scope_narrowing_and_escalation() {
        let h = harness(vec![client("app", &grants())]);
        let rt1 = initial_refresh_token(&h, "profile email").await;

        let err = h
            .orchestrator
            .handle(refresh(&rt1, Some("profile admin")))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_scope");

        // The rejected scope did not advance the family.
        let response = h
            .orchestrator
            .handle(refresh(&rt1, Some("email")))
            .await
            .unwrap();
        assert_eq!(response.scope, "email");
        assert_eq!(jwt_payload(response.refresh_token.as_deref().unwrap())["rtv"], 2);
    }

    #[tokio::test]
    async fn test_token_of_other_client_is_rejected() {
        let h = harness(vec![client("app", &grants()), client("other", &grants())]);
        let rt1 = initial_refresh_token(&h, "profile").await;

        let err = h
            .orchestrator
            .handle(TokenEndpointRequest::new(form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &rt1),
                ("client_id", "other"),
                ("client_secret", "s3cret"),
            ])))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_grant");

        // The owner can still rotate.
        assert!(h.orchestrator.handle(refresh(&rt1, None)).await.is_ok());
    }

    #[tokio::test]
    async fn test_forged_token_is_invalid_grant() {
        let h = harness(vec![client("app", &grants())]);
        let err = h
            .orchestrator
            .handle(refresh("eyJhbGciOiJub25lIn0.e30.", None))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_grant");
    }

    #[tokio::test]
    async fn test_enrichment_claims_land_in_access_token() {
        let h = harness(vec![client("app", &grants())]);
        let mut claims = serde_json::Map::new();
        claims.insert("roles".to_string(), serde_json::json!(["admin"]));
        claims.insert("sub".to_string(), serde_json::json!("mallory"));
        h.enricher.set_claims("alice", claims);

        let rt1 = initial_refresh_token(&h, "profile").await;
        let response = h.orchestrator.handle(refresh(&rt1, None)).await.unwrap();
        let access = jwt_payload(&response.access_token);
        assert_eq!(access["roles"], serde_json::json!(["admin"]));
        assert_eq!(access["sub"], "alice");
        assert!(!h.revoked.is_revoked(access["jti"].as_str().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_token_signed_before_rotation_still_refreshes() {
        let h = harness(vec![client("app", &grants())]);
        let rt1 = initial_refresh_token(&h, "profile").await;
        let old_kid = h.keys.stats().signing_kid;

        h.keys.rotate_signing_key().await.unwrap();
        let response = h.orchestrator.handle(refresh(&rt1, None)).await.unwrap();

        let header = jsonwebtoken::decode_header(&response.access_token).unwrap();
        assert_ne!(header.kid, old_kid);
        assert!(h.keys.stats().refetches >= 1);
    }

    #[tokio::test]
    async fn test_token_of_retired_key_hides_its_kid() {
        let h = harness(vec![client("app", &grants())]);
        let rt1 = initial_refresh_token(&h, "profile").await;
        let old_kid = h.keys.stats().signing_kid.unwrap();

        for _ in 0..3 {
            h.keys.rotate_signing_key().await.unwrap();
        }
        let err = h.orchestrator.handle(refresh(&rt1, None)).await.unwrap_err();

        assert!(matches!(err, AuthError::InvalidGrant { .. }));
        assert!(!err.to_string().contains(&old_kid));
    }
}
