//! Authorization code grant (RFC 6749 §4.1.3).
//!
//! The access token JTI is reserved before the code is consumed and stored by
//! the shard actor in the same step. If the code is presented again, the
//! actor reports the recorded JTIs and this flow revokes what the first
//! redemption issued. A replay that arrives before the refresh token JTI is
//! recorded is reported when it is attached, and the first redemption then
//! revokes its own family and fails.

use time::OffsetDateTime;

use super::{GrantContext, GrantDecision, GrantOrchestrator, new_access_token_jti};
use crate::AuthResult;
use crate::audit::{SecurityEvent, SecurityEventKind};
use crate::error::AuthError;
use crate::oauth::TokenRequest;
use crate::shard::{
    AttachOutcome, ConsumeOutcome, ConsumeRejection, ConsumeRequest, code_fingerprint,
};
use crate::types::Scope;

impl GrantOrchestrator {
    pub(crate) async fn authorization_code(
        &self,
        ctx: &GrantContext,
        request: &TokenRequest,
    ) -> AuthResult<GrantDecision> {
        let code = TokenRequest::require(&request.code, "code")?;
        let access_token_jti = new_access_token_jti();

        let outcome = self
            .codes
            .consume(ConsumeRequest {
                code: code.to_string(),
                client_id: ctx.client_id().to_string(),
                code_verifier: request.code_verifier.clone(),
                dpop_jkt: ctx.proof_jkt().map(str::to_string),
                access_token_jti: access_token_jti.clone(),
            })
            .await?;

        let consumed = match outcome {
            ConsumeOutcome::Consumed(consumed) => consumed,
            ConsumeOutcome::ReplayDetected {
                subject,
                client_id,
                access_token_jti,
                refresh_token_jti,
            } => {
                self.revoke_replayed_code(
                    code,
                    ctx.client_id(),
                    &subject,
                    &client_id,
                    access_token_jti,
                    refresh_token_jti,
                )
                .await;
                return Err(AuthError::invalid_grant("Invalid authorization code"));
            }
            ConsumeOutcome::NotFoundOrExpired => {
                return Err(AuthError::invalid_grant("Invalid authorization code"));
            }
            ConsumeOutcome::Rejected(rejection) => {
                tracing::debug!(
                    client_id = %ctx.client_id(),
                    code = %code_fingerprint(code),
                    ?rejection,
                    "Authorization code redemption rejected"
                );
                let message = match rejection {
                    ConsumeRejection::PkceMismatch => "PKCE verification failed",
                    ConsumeRejection::ClientMismatch => "Invalid authorization code",
                    ConsumeRejection::DpopBindingMismatch => {
                        "Authorization code is bound to a different DPoP key"
                    }
                };
                return Err(AuthError::invalid_grant(message));
            }
        };

        if request.redirect_uri.as_deref() != Some(consumed.redirect_uri.as_str()) {
            tracing::debug!(
                client_id = %ctx.client_id(),
                code = %code_fingerprint(code),
                "redirect_uri does not match the authorization request"
            );
            return Err(AuthError::invalid_grant("redirect_uri mismatch"));
        }

        let scope = Scope::parse(&consumed.scope);
        let refresh_token = self
            .start_family(ctx, &consumed.subject, &consumed.scope)
            .await?;
        if let Some(refresh) = &refresh_token {
            match self.codes.attach_refresh_token(code, &refresh.jti).await {
                Ok(AttachOutcome::Attached) => {}
                Ok(AttachOutcome::Replayed) => {
                    self.revoke_raced_family(
                        code,
                        ctx.client_id(),
                        &consumed.subject,
                        &refresh.jti,
                    )
                    .await;
                    return Err(AuthError::invalid_grant("Invalid authorization code"));
                }
                Ok(AttachOutcome::Missing) => tracing::warn!(
                    code = %code_fingerprint(code),
                    "Consumed code vanished before its refresh token was recorded"
                ),
                Err(e) => tracing::warn!(
                    code = %code_fingerprint(code),
                    error = %e,
                    "Failed to record refresh token on consumed code"
                ),
            }
        }

        Ok(GrantDecision {
            id_token: self.id_token_for(&scope, consumed.nonce, consumed.auth_time, consumed.acr),
            subject: consumed.subject,
            scope: scope.to_string(),
            access_token_jti,
            refresh_token,
        })
    }

    /// Revokes the family this redemption registered after a replay raced it.
    ///
    /// The replay already revoked the access token JTI; no token has been
    /// handed out yet.
    async fn revoke_raced_family(&self, code: &str, client_id: &str, subject: &str, jti: &str) {
        let fingerprint = code_fingerprint(code);
        tracing::warn!(
            code = %fingerprint,
            client_id = %client_id,
            refresh_token_jti = %jti,
            "Authorization code replayed during redemption"
        );
        if let Err(e) = self
            .refresh_families
            .revoke_family(subject, client_id, Some(jti))
            .await
        {
            tracing::error!(
                jti = %jti,
                error = %e,
                "Failed to revoke refresh family of replayed code"
            );
        }
        self.audit.record(
            SecurityEvent::new(SecurityEventKind::CodeReplay)
                .client(client_id)
                .subject(subject)
                .with("code", fingerprint)
                .with("refresh_token_jti", jti.to_string()),
        );
    }

    /// Revokes what the first redemption of a replayed code issued.
    ///
    /// Failures are logged; the caller answers `invalid_grant` regardless.
    async fn revoke_replayed_code(
        &self,
        code: &str,
        presenting_client: &str,
        subject: &str,
        client_id: &str,
        access_token_jti: Option<String>,
        refresh_token_jti: Option<String>,
    ) {
        let fingerprint = code_fingerprint(code);
        tracing::warn!(
            code = %fingerprint,
            client_id = %client_id,
            presenting_client = %presenting_client,
            access_token_jti = access_token_jti.as_deref().unwrap_or("-"),
            refresh_token_jti = refresh_token_jti.as_deref().unwrap_or("-"),
            "Authorization code replay detected"
        );

        if let Some(jti) = &access_token_jti {
            let expires_at = OffsetDateTime::now_utc() + self.settings.access_token_lifetime;
            if let Err(e) = self.revoked_tokens.revoke(jti, expires_at).await {
                tracing::error!(
                    jti = %jti,
                    error = %e,
                    "Failed to revoke access token of replayed code"
                );
            }
        }
        if let Some(jti) = &refresh_token_jti {
            match self
                .refresh_families
                .revoke_family(subject, client_id, Some(jti))
                .await
            {
                Ok(revoked) => {
                    tracing::info!(jti = %jti, revoked, "Refresh family of replayed code revoked");
                }
                Err(e) => tracing::error!(
                    jti = %jti,
                    error = %e,
                    "Failed to revoke refresh family of replayed code"
                ),
            }
        }

        let mut event = SecurityEvent::new(SecurityEventKind::CodeReplay)
            .client(client_id)
            .subject(subject)
            .with("code", fingerprint)
            .with("presenting_client", presenting_client);
        if let Some(jti) = access_token_jti {
            event = event.with("access_token_jti", jti);
        }
        if let Some(jti) = refresh_token_jti {
            event = event.with("refresh_token_jti", jti);
        }
        self.audit.record(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::super::TokenEndpointRequest;
    use super::super::tests::{ISSUER, client, form, harness, harness_wrapping, jwt_payload};
    use crate::AuthResult;
    use crate::config::AuthConfig;
    use crate::oauth::{PkceChallenge, PkceChallengeMethod, PkceVerifier, TokenType};
    use crate::shard::{
        AuthorizationCodeStore, NewFamily, RefreshTokenFamilyStore, RegisteredFamily,
        RotateOutcome, RotateRejection, RotateRequest,
    };
    use crate::storage::RevokedTokenStorage;
    use crate::token::RefreshTokenClaims;
    use crate::types::{GrantType, NewAuthorizationCode};

    const REDIRECT: &str = "https://app.example.com/cb";

    fn verifier() -> String {
        "V".repeat(43)
    }

    fn new_code(scope: &str) -> NewAuthorizationCode {
        let challenge = PkceChallenge::from_verifier(&PkceVerifier::new(verifier()).unwrap());
        NewAuthorizationCode {
            client_id: "app".to_string(),
            subject: "alice".to_string(),
            redirect_uri: REDIRECT.to_string(),
            scope: scope.to_string(),
            nonce: Some("n-1".to_string()),
            code_challenge: Some(challenge.as_str().to_string()),
            code_challenge_method: Some(PkceChallengeMethod::S256),
            auth_time: Some(1_700_000_000),
            ..Default::default()
        }
    }

    fn exchange(code: &str, verifier: &str) -> TokenEndpointRequest {
        TokenEndpointRequest::new(form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", REDIRECT),
            ("code_verifier", verifier),
            ("client_id", "app"),
            ("client_secret", "s3cret"),
        ]))
    }

    #[tokio::test]
    async fn test_code_exchange_issues_all_tokens() {
        let h = harness(vec![client(
            "app",
            &[GrantType::AuthorizationCode, GrantType::RefreshToken],
        )]);
        let code = h.codes.issue(new_code("openid profile")).await.unwrap();

        let response = h.orchestrator.handle(exchange(&code, &verifier())).await.unwrap();
        assert_eq!(response.token_type, TokenType::Bearer);
        assert_eq!(response.scope, "openid profile");
        assert!(response.id_token.is_some());
        assert!(response.refresh_token.is_some());
        assert_eq!(response.expires_in, 3600);
    }

    #[tokio::test]
    async fn test_no_id_token_without_openid_and_no_refresh_without_grant() {
        let h = harness(vec![client("app", &[GrantType::AuthorizationCode])]);
        let code = h.codes.issue(new_code("profile")).await.unwrap();

        let response = h.orchestrator.handle(exchange(&code, &verifier())).await.unwrap();
        assert!(response.id_token.is_none());
        assert!(response.refresh_token.is_none());
    }

    #[tokio::test]
    async fn test_wrong_verifier_leaves_code_redeemable() {
        let h = harness(vec![client("app", &[GrantType::AuthorizationCode])]);
        let code = h.codes.issue(new_code("profile")).await.unwrap();

        let err = h
            .orchestrator
            .handle(exchange(&code, &"W".repeat(43)))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_grant");

        assert!(h.orchestrator.handle(exchange(&code, &verifier())).await.is_ok());
    }

    #[tokio::test]
    async fn test_redirect_uri_must_match() {
        let h = harness(vec![client("app", &[GrantType::AuthorizationCode])]);
        let code = h.codes.issue(new_code("profile")).await.unwrap();

        let err = h
            .orchestrator
            .handle(TokenEndpointRequest::new(form(&[
                ("grant_type", "authorization_code"),
                ("code", &code),
                ("redirect_uri", "https://evil.example.com/cb"),
                ("code_verifier", &verifier()),
                ("client_id", "app"),
                ("client_secret", "s3cret"),
            ])))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_grant");
    }

    #[tokio::test]
    async fn test_replay_revokes_first_redemption() {
        let h = harness(vec![client(
            "app",
            &[GrantType::AuthorizationCode, GrantType::RefreshToken],
        )]);
        let code = h.codes.issue(new_code("openid offline_access")).await.unwrap();

        let first = h.orchestrator.handle(exchange(&code, &verifier())).await.unwrap();
        let second = h
            .orchestrator
            .handle(exchange(&code, &verifier()))
            .await
            .unwrap_err();
        assert_eq!(second.oauth_error_code(), "invalid_grant");

        let access: serde_json::Value = jwt_payload(&first.access_token);
        let jti = access["jti"].as_str().unwrap();
        assert!(h.revoked.is_revoked(jti).await.unwrap());

        let refresh: RefreshTokenClaims =
            serde_json::from_value(jwt_payload(first.refresh_token.as_deref().unwrap())).unwrap();
        let outcome = h
            .families
            .rotate(RotateRequest {
                incoming_version: refresh.rtv,
                incoming_jti: refresh.jti,
                user_id: refresh.sub,
                client_id: refresh.client_id,
                requested_scope: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome, RotateOutcome::Rejected(RotateRejection::Revoked));
    }

    /// Holds family registration back so a second redemption can overtake it.
    struct SlowRegistration {
        inner: Arc<dyn RefreshTokenFamilyStore>,
        delay: Duration,
        registered: Mutex<Option<RegisteredFamily>>,
    }

    #[async_trait]
    impl RefreshTokenFamilyStore for SlowRegistration {
        async fn register_family(&self, family: NewFamily) -> AuthResult<RegisteredFamily> {
            tokio::time::sleep(self.delay).await;
            let registered = self.inner.register_family(family).await?;
            *self.registered.lock().unwrap() = Some(registered.clone());
            Ok(registered)
        }

        async fn rotate(&self, request: RotateRequest) -> AuthResult<RotateOutcome> {
            self.inner.rotate(request).await
        }

        async fn revoke_family(
            &self,
            user_id: &str,
            client_id: &str,
            jti: Option<&str>,
        ) -> AuthResult<bool> {
            self.inner.revoke_family(user_id, client_id, jti).await
        }
    }

    #[tokio::test]
    async fn test_replay_during_first_redemption_revokes_its_family() {
        let slow = Arc::new(Mutex::new(None::<Arc<SlowRegistration>>));
        let slot = slow.clone();
        let h = harness_wrapping(
            AuthConfig::new(ISSUER),
            vec![client(
                "app",
                &[GrantType::AuthorizationCode, GrantType::RefreshToken],
            )],
            move |inner| {
                let wrapper = Arc::new(SlowRegistration {
                    inner,
                    delay: Duration::from_millis(300),
                    registered: Mutex::new(None),
                });
                *slot.lock().unwrap() = Some(wrapper.clone());
                wrapper as Arc<dyn RefreshTokenFamilyStore>
            },
        );
        let slow = slow.lock().unwrap().clone().unwrap();
        let code = h.codes.issue(new_code("openid offline_access")).await.unwrap();

        let (first, second) = tokio::join!(
            h.orchestrator.handle(exchange(&code, &verifier())),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                h.orchestrator.handle(exchange(&code, &verifier())).await
            }
        );
        assert_eq!(second.unwrap_err().oauth_error_code(), "invalid_grant");
        assert_eq!(first.unwrap_err().oauth_error_code(), "invalid_grant");

        let registered = slow.registered.lock().unwrap().clone().unwrap();
        let outcome = h
            .families
            .rotate(RotateRequest {
                incoming_version: registered.version,
                incoming_jti: registered.jti,
                user_id: "alice".to_string(),
                client_id: "app".to_string(),
                requested_scope: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome, RotateOutcome::Rejected(RotateRejection::Revoked));
    }

    #[tokio::test]
    async fn test_unknown_code_is_invalid_grant() {
        let h = harness(vec![client("app", &[GrantType::AuthorizationCode])]);
        let err = h
            .orchestrator
            .handle(exchange("0_doesnotexist", &verifier()))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_grant");
    }

    #[tokio::test]
    async fn test_missing_code_is_invalid_request() {
        let h = harness(vec![client("app", &[GrantType::AuthorizationCode])]);
        let err = h
            .orchestrator
            .handle(TokenEndpointRequest::new(form(&[
                ("grant_type", "authorization_code"),
                ("client_id", "app"),
                ("client_secret", "s3cret"),
            ])))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_request");
    }
}
