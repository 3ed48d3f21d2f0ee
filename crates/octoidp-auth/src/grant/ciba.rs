//! CIBA grant, poll mode (OpenID CIBA Core §10.1).

use super::{GrantContext, GrantDecision, GrantOrchestrator, poll_result};
use crate::AuthResult;
use crate::oauth::TokenRequest;

impl GrantOrchestrator {
    pub(crate) async fn ciba(
        &self,
        ctx: &GrantContext,
        request: &TokenRequest,
    ) -> AuthResult<GrantDecision> {
        let auth_req_id = TokenRequest::require(&request.auth_req_id, "auth_req_id")?;
        let outcome = self
            .ciba_requests
            .poll_ciba_request(auth_req_id, ctx.client_id())
            .await?;
        let grant = poll_result(outcome, "authentication request")?;
        self.approved_grant(ctx, grant).await
    }
}
