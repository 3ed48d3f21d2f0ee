//! Device authorization grant (RFC 8628 §3.4).

use super::{GrantContext, GrantDecision, GrantOrchestrator, poll_result};
use crate::AuthResult;
use crate::oauth::TokenRequest;

impl GrantOrchestrator {
    pub(crate) async fn device_code(
        &self,
        ctx: &GrantContext,
        request: &TokenRequest,
    ) -> AuthResult<GrantDecision> {
        let device_code = TokenRequest::require(&request.device_code, "device_code")?;
        let outcome = self
            .device_codes
            .poll_device_code(device_code, ctx.client_id())
            .await?;
        tracing::debug!(client_id = %ctx.client_id(), ?outcome, "Device code polled");
        let grant = poll_result(outcome, "device code")?;
        self.approved_grant(ctx, grant).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::TokenEndpointRequest;
    use super::super::tests::{client, form, harness, jwt_payload};
    use crate::storage::ApprovedGrant;
    use crate::types::GrantType;

    fn poll(device_code: &str) -> TokenEndpointRequest {
        TokenEndpointRequest::new(form(&[
            ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
            ("device_code", device_code),
            ("client_id", "tv"),
            ("client_secret", "s3cret"),
        ]))
    }

    #[tokio::test]
    async fn test_pending_then_approved_once() {
        let h = harness(vec![client(
            "tv",
            &[GrantType::DeviceCode, GrantType::RefreshToken],
        )]);
        h.pending
            .create_device_code("dc-1", "tv", Duration::from_secs(600), Duration::ZERO);

        let err = h.orchestrator.handle(poll("dc-1")).await.unwrap_err();
        assert_eq!(err.oauth_error_code(), "authorization_pending");

        h.pending.approve_device_code(
            "dc-1",
            ApprovedGrant {
                subject: "carol".to_string(),
                scope: "openid media".to_string(),
                auth_time: Some(1_700_000_000),
                acr: None,
                dpop_jkt: None,
            },
        );
        let response = h.orchestrator.handle(poll("dc-1")).await.unwrap();
        assert_eq!(jwt_payload(&response.access_token)["sub"], "carol");
        assert!(response.id_token.is_some());
        assert!(response.refresh_token.is_some());

        let err = h.orchestrator.handle(poll("dc-1")).await.unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_grant");
    }

    #[tokio::test]
    async fn test_denied_and_fast_polling() {
        let h = harness(vec![client("tv", &[GrantType::DeviceCode])]);
        h.pending.create_device_code(
            "dc-2",
            "tv",
            Duration::from_secs(600),
            Duration::from_secs(5),
        );
        let first = h.orchestrator.handle(poll("dc-2")).await.unwrap_err();
        assert_eq!(first.oauth_error_code(), "authorization_pending");
        let second = h.orchestrator.handle(poll("dc-2")).await.unwrap_err();
        assert_eq!(second.oauth_error_code(), "slow_down");

        h.pending
            .create_device_code("dc-3", "tv", Duration::from_secs(600), Duration::ZERO);
        h.pending.deny_device_code("dc-3");
        let err = h.orchestrator.handle(poll("dc-3")).await.unwrap_err();
        assert_eq!(err.oauth_error_code(), "access_denied");
    }

    #[tokio::test]
    async fn test_dpop_bound_approval_requires_proof() {
        let h = harness(vec![client("tv", &[GrantType::DeviceCode])]);
        h.pending
            .create_device_code("dc-4", "tv", Duration::from_secs(600), Duration::ZERO);
        h.pending.approve_device_code(
            "dc-4",
            ApprovedGrant {
                subject: "carol".to_string(),
                scope: "media".to_string(),
                auth_time: None,
                acr: None,
                dpop_jkt: Some("bound-key".to_string()),
            },
        );
        let err = h.orchestrator.handle(poll("dc-4")).await.unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_grant");
    }
}
