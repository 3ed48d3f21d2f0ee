//! Grant orchestration for the token endpoint.
//!
//! A token request moves through a fixed sequence of states:
//!
//! ```text
//! ParamValidation -> ClientAuthn -> GrantDispatch -> flow -> TokenMint
//! ```
//!
//! Each flow lives in its own module:
//!
//! - [`authorization_code`] - code redemption with replay revocation
//! - [`refresh`] - refresh token rotation with theft detection
//! - [`jwt_bearer`] - RFC 7523 assertions from trusted issuers
//! - [`device_code`] - RFC 8628 polling
//! - [`ciba`] - CIBA poll mode
//!
//! Any failure short-circuits with an [`AuthError`]; tokens are only returned
//! once every token of the response has been minted.

pub mod authorization_code;
pub mod ciba;
pub mod device_code;
pub mod jwt_bearer;
pub mod refresh;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::AuthResult;
use crate::audit::{AuditQueue, SecurityEvent, SecurityEventKind};
use crate::config::{AuthConfig, TrustedIssuer};
use crate::dpop::{DpopProof, DpopValidator};
use crate::error::AuthError;
use crate::oauth::{
    AuthenticatedClient, ClientAuthenticator, ClientCredentials, TokenRequest, TokenResponse,
    TokenType,
};
use crate::shard::{AuthorizationCodeStore, NewFamily, RefreshTokenFamilyStore};
use crate::storage::{
    ApprovedGrant, CibaRequestStorage, ClaimsEnricher, DeviceCodeStorage, JtiStorage,
    PollOutcome, RevokedTokenStorage,
};
use crate::token::{IdTokenRequest, MintRequest, RefreshTokenRequest, TokenMinter};
use crate::types::{GrantType, Scope};

/// A token request as received by the HTTP layer.
#[derive(Debug, Clone)]
pub struct TokenEndpointRequest {
    /// Parsed form body.
    pub body: TokenRequest,
    /// Raw `Authorization` header.
    pub authorization: Option<String>,
    /// The single `DPoP` header, if sent.
    pub dpop: Option<String>,
    /// HTTP method, compared with the proof's `htm`.
    pub method: String,
}

impl TokenEndpointRequest {
    /// Creates a `POST` request without headers.
    #[must_use]
    pub fn new(body: TokenRequest) -> Self {
        Self {
            body,
            authorization: None,
            dpop: None,
            method: "POST".to_string(),
        }
    }

    /// Sets the `Authorization` header.
    #[must_use]
    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    /// Sets the `DPoP` header.
    #[must_use]
    pub fn with_dpop(mut self, proof: impl Into<String>) -> Self {
        self.dpop = Some(proof.into());
        self
    }
}

/// Collaborators of the orchestrator.
pub struct GrantDependencies {
    /// Client authentication.
    pub clients: ClientAuthenticator,
    /// DPoP proof validation.
    pub dpop: DpopValidator,
    /// Authorization code shards.
    pub codes: Arc<dyn AuthorizationCodeStore>,
    /// Refresh token family shards.
    pub refresh_families: Arc<dyn RefreshTokenFamilyStore>,
    /// Token signing.
    pub minter: TokenMinter,
    /// Access token deny-list.
    pub revoked_tokens: Arc<dyn RevokedTokenStorage>,
    /// Device authorization records.
    pub device_codes: Arc<dyn DeviceCodeStorage>,
    /// CIBA requests.
    pub ciba_requests: Arc<dyn CibaRequestStorage>,
    /// JWT bearer assertion JTIs.
    pub assertion_jtis: Arc<dyn JtiStorage>,
    /// Optional claims enrichment.
    pub enricher: Option<Arc<dyn ClaimsEnricher>>,
    /// Security event queue.
    pub audit: AuditQueue,
}

/// Lifetimes and limits resolved from [`AuthConfig`].
#[derive(Debug, Clone)]
struct GrantSettings {
    token_endpoint: String,
    access_token_lifetime: Duration,
    id_token_lifetime: Duration,
    refresh_token_lifetime: Duration,
    enrichment_timeout: Duration,
    assertion_max_lifetime: Duration,
    trusted_issuers: Vec<TrustedIssuer>,
}

/// Drives a token request from client authentication to minted tokens.
pub struct GrantOrchestrator {
    settings: GrantSettings,
    clients: ClientAuthenticator,
    dpop: DpopValidator,
    codes: Arc<dyn AuthorizationCodeStore>,
    refresh_families: Arc<dyn RefreshTokenFamilyStore>,
    minter: TokenMinter,
    revoked_tokens: Arc<dyn RevokedTokenStorage>,
    device_codes: Arc<dyn DeviceCodeStorage>,
    ciba_requests: Arc<dyn CibaRequestStorage>,
    assertion_jtis: Arc<dyn JtiStorage>,
    enricher: Option<Arc<dyn ClaimsEnricher>>,
    audit: AuditQueue,
}

/// State carried from client authentication into a flow.
pub(crate) struct GrantContext {
    pub(crate) client: AuthenticatedClient,
    pub(crate) proof: Option<DpopProof>,
}

impl GrantContext {
    pub(crate) fn client_id(&self) -> &str {
        &self.client.client.client_id
    }

    pub(crate) fn proof_jkt(&self) -> Option<&str> {
        self.proof.as_ref().map(|p| p.jkt.as_str())
    }

    /// Requires a proof for the key a code or token was bound to.
    pub(crate) fn require_binding(&self, bound_jkt: Option<&str>) -> AuthResult<()> {
        match bound_jkt {
            None => Ok(()),
            Some(expected) if self.proof_jkt() == Some(expected) => Ok(()),
            Some(_) => {
                tracing::warn!(
                    client_id = %self.client_id(),
                    proof_present = self.proof.is_some(),
                    "DPoP binding mismatch"
                );
                Err(AuthError::invalid_grant(
                    "Grant is bound to a different DPoP key",
                ))
            }
        }
    }
}

/// What a flow decided; turned into tokens by [`GrantOrchestrator::issue`].
pub(crate) struct GrantDecision {
    pub(crate) subject: String,
    pub(crate) scope: String,
    pub(crate) access_token_jti: String,
    pub(crate) id_token: Option<IdTokenRequest>,
    pub(crate) refresh_token: Option<RefreshTokenRequest>,
}

impl GrantOrchestrator {
    /// Creates an orchestrator.
    pub fn new(config: &AuthConfig, deps: GrantDependencies) -> Self {
        Self {
            settings: GrantSettings {
                token_endpoint: config.token_endpoint_url(),
                access_token_lifetime: config.tokens.access_token_lifetime,
                id_token_lifetime: config.tokens.id_token_lifetime,
                refresh_token_lifetime: config.tokens.refresh_token_lifetime,
                enrichment_timeout: config.enrichment.timeout,
                assertion_max_lifetime: config.client_assertion.max_lifetime,
                trusted_issuers: config.jwt_bearer.trusted_issuers.clone(),
            },
            clients: deps.clients,
            dpop: deps.dpop,
            codes: deps.codes,
            refresh_families: deps.refresh_families,
            minter: deps.minter,
            revoked_tokens: deps.revoked_tokens,
            device_codes: deps.device_codes,
            ciba_requests: deps.ciba_requests,
            assertion_jtis: deps.assertion_jtis,
            enricher: deps.enricher,
            audit: deps.audit,
        }
    }

    /// The minter, shared with the admin surface for key statistics.
    #[must_use]
    pub fn minter(&self) -> &TokenMinter {
        &self.minter
    }

    /// The audit queue.
    #[must_use]
    pub fn audit(&self) -> &AuditQueue {
        &self.audit
    }

    /// Handles one token request.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] of the first failed state. Replays and
    /// theft surface as plain `invalid_grant`.
    pub async fn handle(&self, request: TokenEndpointRequest) -> AuthResult<TokenResponse> {
        // ParamValidation
        let grant_type = GrantType::parse(&request.body.grant_type)
            .ok_or_else(|| AuthError::unsupported_grant_type(request.body.grant_type.clone()))?;

        // ClientAuthn
        let credentials =
            ClientCredentials::extract(request.authorization.as_deref(), &request.body)?;
        let client = self.clients.authenticate(&credentials).await?;
        if !client.client.allows_grant(grant_type) {
            return Err(AuthError::unauthorized_client(format!(
                "Client is not registered for {grant_type}"
            )));
        }

        let proof = self.validate_proof(&request, &client).await?;
        let ctx = GrantContext { client, proof };

        // GrantDispatch
        let decision = match grant_type {
            GrantType::AuthorizationCode => self.authorization_code(&ctx, &request.body).await?,
            GrantType::RefreshToken => self.refresh_token(&ctx, &request.body).await?,
            GrantType::JwtBearer => self.jwt_bearer(&ctx, &request.body).await?,
            GrantType::DeviceCode => self.device_code(&ctx, &request.body).await?,
            GrantType::Ciba => self.ciba(&ctx, &request.body).await?,
        };

        // TokenMint
        self.issue(&ctx, grant_type, decision).await
    }

    async fn validate_proof(
        &self,
        request: &TokenEndpointRequest,
        client: &AuthenticatedClient,
    ) -> AuthResult<Option<DpopProof>> {
        let client_id = client.client.client_id.as_str();
        let Some(proof) = request.dpop.as_deref() else {
            if client.client.dpop_bound_access_tokens {
                return Err(AuthError::invalid_dpop_proof(
                    "Client requires DPoP-bound access tokens",
                ));
            }
            return Ok(None);
        };

        match self
            .dpop
            .validate(proof, client_id, &request.method, &self.settings.token_endpoint)
            .await
        {
            Ok(proof) => Ok(Some(proof)),
            Err(e) => {
                if e.is_replay() {
                    tracing::warn!(client_id = %client_id, error = %e, "DPoP proof replayed");
                    self.audit.record(
                        SecurityEvent::new(SecurityEventKind::DpopReplay)
                            .client(client_id)
                            .with("reason", e.to_string()),
                    );
                } else {
                    tracing::debug!(client_id = %client_id, error = %e, "DPoP proof rejected");
                }
                Err(e.into())
            }
        }
    }

    /// Mints the tokens for a flow decision and builds the response.
    async fn issue(
        &self,
        ctx: &GrantContext,
        grant_type: GrantType,
        decision: GrantDecision,
    ) -> AuthResult<TokenResponse> {
        let client_id = ctx.client_id().to_string();
        let access_token_lifetime = self.access_token_lifetime(ctx);
        let extra_claims = self
            .enrich(&decision.subject, &client_id, &decision.scope)
            .await;
        let dpop_jkt = ctx.proof_jkt().map(str::to_string);
        let token_type = if dpop_jkt.is_some() {
            TokenType::DPoP
        } else {
            TokenType::Bearer
        };

        let minted = self
            .minter
            .mint(MintRequest {
                subject: decision.subject.clone(),
                client_id: client_id.clone(),
                scope: decision.scope.clone(),
                access_token_jti: decision.access_token_jti,
                access_token_lifetime,
                dpop_jkt,
                extra_claims,
                id_token: decision.id_token,
                refresh_token: decision.refresh_token,
            })
            .await?;

        tracing::info!(
            client_id = %client_id,
            grant_type = %grant_type,
            jti = %minted.access_token_jti,
            kid = %minted.kid,
            token_type = %token_type,
            "Tokens issued"
        );
        self.audit.record(
            SecurityEvent::new(SecurityEventKind::TokenIssued)
                .client(client_id)
                .subject(decision.subject)
                .with("grant_type", grant_type.as_str())
                .with("jti", minted.access_token_jti.clone()),
        );

        let mut response =
            TokenResponse::new(minted.access_token, token_type, minted.expires_in, decision.scope);
        if let Some(refresh) = minted.refresh_token {
            response = response.with_refresh_token(refresh);
        }
        if let Some(id_token) = minted.id_token {
            response = response.with_id_token(id_token);
        }
        Ok(response)
    }

    /// Best-effort claims enrichment, bounded by the configured timeout.
    async fn enrich(&self, subject: &str, client_id: &str, scope: &str) -> Map<String, Value> {
        let Some(enricher) = &self.enricher else {
            return Map::new();
        };
        match tokio::time::timeout(
            self.settings.enrichment_timeout,
            enricher.enrich(subject, client_id, scope),
        )
        .await
        {
            Ok(Ok(claims)) => claims,
            Ok(Err(e)) => {
                tracing::warn!(client_id = %client_id, error = %e, "Claims enrichment failed");
                Map::new()
            }
            Err(_) => {
                tracing::warn!(client_id = %client_id, "Claims enrichment timed out");
                Map::new()
            }
        }
    }

    fn access_token_lifetime(&self, ctx: &GrantContext) -> Duration {
        let default = self.settings.access_token_lifetime.as_secs();
        seconds(
            ctx.client
                .client
                .access_token_lifetime_or(i64::try_from(default).unwrap_or(i64::MAX)),
        )
    }

    fn refresh_token_lifetime(&self, ctx: &GrantContext) -> Duration {
        let default = self.settings.refresh_token_lifetime.as_secs();
        seconds(
            ctx.client
                .client
                .refresh_token_lifetime_or(i64::try_from(default).unwrap_or(i64::MAX)),
        )
    }

    /// ID token inputs when `openid` was granted.
    fn id_token_for(
        &self,
        scope: &Scope,
        nonce: Option<String>,
        auth_time: Option<i64>,
        acr: Option<String>,
    ) -> Option<IdTokenRequest> {
        scope.contains("openid").then(|| IdTokenRequest {
            nonce,
            auth_time,
            acr,
            lifetime: self.settings.id_token_lifetime,
        })
    }

    /// Starts a refresh family when the client may use refresh tokens.
    async fn start_family(
        &self,
        ctx: &GrantContext,
        subject: &str,
        scope: &str,
    ) -> AuthResult<Option<RefreshTokenRequest>> {
        if !ctx.client.client.allows_grant(GrantType::RefreshToken) {
            return Ok(None);
        }
        let family = self
            .refresh_families
            .register_family(NewFamily {
                user_id: subject.to_string(),
                client_id: ctx.client_id().to_string(),
                scope: scope.to_string(),
                ttl: self.refresh_token_lifetime(ctx),
                dpop_jkt: ctx.proof_jkt().map(str::to_string),
            })
            .await?;
        Ok(Some(RefreshTokenRequest {
            jti: family.jti,
            rtv: family.version,
            expires_at: family.expires_at,
        }))
    }

    /// Turns an approved device or CIBA grant into a decision.
    async fn approved_grant(
        &self,
        ctx: &GrantContext,
        grant: ApprovedGrant,
    ) -> AuthResult<GrantDecision> {
        ctx.require_binding(grant.dpop_jkt.as_deref())?;
        let scope = Scope::parse(&grant.scope);
        let refresh_token = self.start_family(ctx, &grant.subject, &grant.scope).await?;
        Ok(GrantDecision {
            id_token: self.id_token_for(&scope, None, grant.auth_time, grant.acr),
            subject: grant.subject,
            scope: scope.to_string(),
            access_token_jti: new_access_token_jti(),
            refresh_token,
        })
    }
}

/// Maps a poll result of a pending authorization onto the token endpoint.
pub(crate) fn poll_result(outcome: PollOutcome, what: &str) -> AuthResult<ApprovedGrant> {
    match outcome {
        PollOutcome::Approved(grant) => Ok(grant),
        PollOutcome::Pending => Err(AuthError::AuthorizationPending),
        PollOutcome::SlowDown => Err(AuthError::SlowDown),
        PollOutcome::Denied => Err(AuthError::access_denied(format!(
            "The user denied the {what}"
        ))),
        PollOutcome::Expired => Err(AuthError::expired_token(format!("The {what} expired"))),
        PollOutcome::NotFound => Err(AuthError::invalid_grant(format!("Unknown {what}"))),
    }
}

/// A fresh access token JTI.
pub(crate) fn new_access_token_jti() -> String {
    Uuid::new_v4().to_string()
}

fn seconds(value: i64) -> Duration {
    Duration::from_secs(u64::try_from(value).unwrap_or(0))
}
