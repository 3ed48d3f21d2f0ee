//! Authorization code shard actors.
//!
//! Each shard index is owned by one tokio task holding its codes in a plain
//! `HashMap`. Commands arrive over a bounded `mpsc` channel and are applied
//! one at a time, which makes every operation, in particular
//! [`CodeShardState::consume`], an atomic read-modify-write without locks.
//!
//! A consumed code is not deleted. Its entry keeps the JTIs of the tokens
//! the redemption produced for code TTL + grace, so a later replay can be
//! answered with [`ConsumeOutcome::ReplayDetected`] and those tokens revoked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};

use crate::AuthResult;
use crate::config::AuthConfig;
use crate::oauth::{PkceChallengeMethod, verify_code_verifier};
use crate::shard::call_actor;
use crate::shard::config::ShardConfigCache;
use crate::shard::namespace::{ActorHandle, ShardNamespace};
use crate::shard::router::{AuthorizationCodeValue, remap_shard_index, routing_key, shard_index};
use crate::types::{AuthorizationCode, NewAuthorizationCode};

// =============================================================================
// Operations
// =============================================================================

/// Input of a consume call.
#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    /// The presented code.
    pub code: String,

    /// The authenticated client.
    pub client_id: String,

    /// PKCE `code_verifier`, if sent.
    pub code_verifier: Option<String>,

    /// Thumbprint of the DPoP proof accompanying the request, if any.
    pub dpop_jkt: Option<String>,

    /// JTI reserved for the access token this redemption will mint.
    pub access_token_jti: String,
}

/// Grant data released by a successful consume.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedCode {
    /// Authenticated end user.
    pub subject: String,
    /// Granted scope.
    pub scope: String,
    /// Redirect URI of the authorization request.
    pub redirect_uri: String,
    /// OpenID Connect nonce.
    pub nonce: Option<String>,
    /// Client state.
    pub state: Option<String>,
    /// End-user authentication time.
    pub auth_time: Option<i64>,
    /// Authentication context class reference.
    pub acr: Option<String>,
    /// OpenID Connect `claims` request.
    pub claims: Option<serde_json::Value>,
    /// DPoP key the code was bound to.
    pub dpop_jkt: Option<String>,
}

/// Why a consume was refused without consuming the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeRejection {
    /// Missing or wrong `code_verifier`, or a verifier for a code without challenge.
    PkceMismatch,
    /// The code was issued to another client.
    ClientMismatch,
    /// The code is DPoP-bound and the proof is absent or for another key.
    DpopBindingMismatch,
}

/// Result of a consume call.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    /// This call consumed the code.
    Consumed(ConsumedCode),
    /// The code had already been consumed.
    ReplayDetected {
        /// End user of the original grant.
        subject: String,
        /// Client of the original grant.
        client_id: String,
        /// Access token minted by the first redemption.
        access_token_jti: Option<String>,
        /// Refresh token minted by the first redemption.
        refresh_token_jti: Option<String>,
    },
    /// Unknown, expired, or past the replay retention window.
    NotFoundOrExpired,
    /// Refused; the code stays redeemable.
    Rejected(ConsumeRejection),
}

/// Result of recording a refresh token on a consumed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Recorded; a later replay will revoke the family.
    Attached,
    /// Recorded, but the code was replayed after it was consumed. The caller
    /// must revoke the family it just registered.
    Replayed,
    /// The code is unknown or was never consumed.
    Missing,
}

/// Storage seam used by the grant orchestrator.
#[async_trait]
pub trait AuthorizationCodeStore: Send + Sync {
    /// Stores a new code and returns its value.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the owning actor is unavailable.
    async fn issue(&self, grant: NewAuthorizationCode) -> AuthResult<String>;

    /// Atomically checks and consumes a code.
    ///
    /// # Errors
    ///
    /// Returns a storage error on timeout or actor failure. Callers must not
    /// retry: the actor may have committed before the failure was observed.
    async fn consume(&self, request: ConsumeRequest) -> AuthResult<ConsumeOutcome>;

    /// Records the refresh token minted for a consumed code.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the owning actor is unavailable.
    async fn attach_refresh_token(
        &self,
        code: &str,
        refresh_token_jti: &str,
    ) -> AuthResult<AttachOutcome>;
}

/// Short, non-reversible code identifier for logs.
#[must_use]
pub fn code_fingerprint(code: &str) -> String {
    hex::encode(&Sha256::digest(code.as_bytes())[..8])
}

// =============================================================================
// Shard State
// =============================================================================

#[derive(Debug, Clone)]
struct Redemption {
    access_token_jti: String,
    refresh_token_jti: Option<String>,
    retain_until: OffsetDateTime,
    replayed: bool,
}

#[derive(Debug, Clone)]
struct CodeEntry {
    code: AuthorizationCode,
    redemption: Option<Redemption>,
}

/// State of one code shard. Only ever touched by its actor task.
#[derive(Debug)]
pub struct CodeShardState {
    shard: u32,
    code_ttl: Duration,
    grace: Duration,
    entries: HashMap<String, CodeEntry>,
}

impl CodeShardState {
    /// Creates an empty shard.
    #[must_use]
    pub fn new(shard: u32, code_ttl: Duration, grace: Duration) -> Self {
        Self {
            shard,
            code_ttl,
            grace,
            entries: HashMap::new(),
        }
    }

    /// Mints and stores a code on this shard.
    pub fn issue(&mut self, grant: NewAuthorizationCode, now: OffsetDateTime) -> String {
        let value = AuthorizationCodeValue::generate(self.shard).to_string();
        let code = AuthorizationCode {
            code: value.clone(),
            grant,
            created_at: now,
            expires_at: now + self.code_ttl,
        };
        self.entries.insert(
            value.clone(),
            CodeEntry {
                code,
                redemption: None,
            },
        );
        value
    }

    /// Consumes a code if every check passes.
    ///
    /// Checks and the state change happen in this single call, so no other
    /// consume of the same code can interleave.
    pub fn consume(&mut self, request: ConsumeRequest, now: OffsetDateTime) -> ConsumeOutcome {
        let Some(entry) = self.entries.get_mut(&request.code) else {
            return ConsumeOutcome::NotFoundOrExpired;
        };

        if let Some(redemption) = entry.redemption.as_mut() {
            if redemption.retain_until <= now {
                self.entries.remove(&request.code);
                return ConsumeOutcome::NotFoundOrExpired;
            }
            redemption.replayed = true;
            return ConsumeOutcome::ReplayDetected {
                subject: entry.code.grant.subject.clone(),
                client_id: entry.code.grant.client_id.clone(),
                access_token_jti: Some(redemption.access_token_jti.clone()),
                refresh_token_jti: redemption.refresh_token_jti.clone(),
            };
        }

        if entry.code.is_expired(now) {
            self.entries.remove(&request.code);
            return ConsumeOutcome::NotFoundOrExpired;
        }

        let grant = &entry.code.grant;
        if grant.client_id != request.client_id {
            return ConsumeOutcome::Rejected(ConsumeRejection::ClientMismatch);
        }

        let pkce_ok = match (&grant.code_challenge, &request.code_verifier) {
            (Some(challenge), Some(verifier)) => {
                let method = grant
                    .code_challenge_method
                    .unwrap_or(PkceChallengeMethod::S256);
                verify_code_verifier(challenge, method, verifier).is_ok()
            }
            (Some(_), None) | (None, Some(_)) => false,
            (None, None) => true,
        };
        if !pkce_ok {
            return ConsumeOutcome::Rejected(ConsumeRejection::PkceMismatch);
        }

        if let Some(bound) = &grant.dpop_jkt
            && request.dpop_jkt.as_deref() != Some(bound.as_str())
        {
            return ConsumeOutcome::Rejected(ConsumeRejection::DpopBindingMismatch);
        }

        entry.redemption = Some(Redemption {
            access_token_jti: request.access_token_jti,
            refresh_token_jti: None,
            retain_until: now + self.code_ttl + self.grace,
            replayed: false,
        });

        let grant = &entry.code.grant;
        ConsumeOutcome::Consumed(ConsumedCode {
            subject: grant.subject.clone(),
            scope: grant.scope.clone(),
            redirect_uri: grant.redirect_uri.clone(),
            nonce: grant.nonce.clone(),
            state: grant.state.clone(),
            auth_time: grant.auth_time,
            acr: grant.acr.clone(),
            claims: grant.claims.clone(),
            dpop_jkt: grant.dpop_jkt.clone(),
        })
    }

    /// Records the refresh token JTI of a consumed code.
    ///
    /// A replay seen between consume and this call had no refresh token to
    /// revoke; it is reported back as [`AttachOutcome::Replayed`].
    pub fn attach_refresh_token(&mut self, code: &str, refresh_token_jti: String) -> AttachOutcome {
        match self
            .entries
            .get_mut(code)
            .and_then(|e| e.redemption.as_mut())
        {
            Some(redemption) => {
                redemption.refresh_token_jti = Some(refresh_token_jti);
                if redemption.replayed {
                    AttachOutcome::Replayed
                } else {
                    AttachOutcome::Attached
                }
            }
            None => AttachOutcome::Missing,
        }
    }

    /// Drops expired unconsumed codes and consumed codes past retention.
    pub fn sweep(&mut self, now: OffsetDateTime) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| match &entry.redemption {
            Some(redemption) => redemption.retain_until > now,
            None => !entry.code.is_expired(now),
        });
        before - self.entries.len()
    }

    /// Number of held entries, consumed ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the shard holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Tuning shared by every code shard actor.
#[derive(Debug, Clone)]
pub struct CodeShardSettings {
    /// Authorization code lifetime.
    pub code_ttl: Duration,
    /// Retention of consumed codes beyond the code lifetime.
    pub consumed_grace: Duration,
    /// Upper bound for one actor call.
    pub call_timeout: Duration,
    /// Interval between sweeps.
    pub sweep_interval: Duration,
    /// Mailbox capacity.
    pub mailbox: usize,
}

impl CodeShardSettings {
    /// Derives actor settings from the engine configuration.
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            code_ttl: config.tokens.authorization_code_lifetime,
            consumed_grace: config.sharding.consumed_code_grace,
            call_timeout: config.sharding.actor_timeout,
            sweep_interval: config.sharding.sweep_interval,
            mailbox: config.sharding.actor_mailbox,
        }
    }
}

enum CodeCommand {
    Issue {
        grant: NewAuthorizationCode,
        reply: oneshot::Sender<String>,
    },
    Consume {
        request: ConsumeRequest,
        reply: oneshot::Sender<ConsumeOutcome>,
    },
    AttachRefreshToken {
        code: String,
        refresh_token_jti: String,
        reply: oneshot::Sender<AttachOutcome>,
    },
    Sweep {
        reply: oneshot::Sender<usize>,
    },
    Ping {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to a running code shard actor.
#[derive(Clone)]
pub struct CodeShardHandle {
    shard: u32,
    tx: mpsc::Sender<CodeCommand>,
    call_timeout: Duration,
}

impl ActorHandle for CodeShardHandle {
    fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl CodeShardHandle {
    /// Spawns the actor for `shard` on the current runtime.
    #[must_use]
    pub fn spawn(shard: u32, settings: &CodeShardSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.mailbox.max(1));
        let state = CodeShardState::new(shard, settings.code_ttl, settings.consumed_grace);
        tokio::spawn(run_code_shard(state, rx, settings.sweep_interval));
        Self {
            shard,
            tx,
            call_timeout: settings.call_timeout,
        }
    }

    /// Shard index owned by this actor.
    #[must_use]
    pub fn shard(&self) -> u32 {
        self.shard
    }

    async fn call<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> CodeCommand,
    ) -> AuthResult<R> {
        let label = format!("Code shard {}", self.shard);
        call_actor(&self.tx, self.call_timeout, &label, command).await
    }

    /// Stores a new code.
    ///
    /// # Errors
    ///
    /// Returns a storage error on timeout or actor failure.
    pub async fn issue(&self, grant: NewAuthorizationCode) -> AuthResult<String> {
        self.call(|reply| CodeCommand::Issue { grant, reply }).await
    }

    /// Consumes a code.
    ///
    /// # Errors
    ///
    /// Returns a storage error on timeout or actor failure.
    pub async fn consume(&self, request: ConsumeRequest) -> AuthResult<ConsumeOutcome> {
        self.call(|reply| CodeCommand::Consume { request, reply }).await
    }

    /// Records the refresh token of a consumed code.
    ///
    /// # Errors
    ///
    /// Returns a storage error on timeout or actor failure.
    pub async fn attach_refresh_token(
        &self,
        code: &str,
        refresh_token_jti: &str,
    ) -> AuthResult<AttachOutcome> {
        self.call(|reply| CodeCommand::AttachRefreshToken {
            code: code.to_string(),
            refresh_token_jti: refresh_token_jti.to_string(),
            reply,
        })
        .await
    }

    /// Runs a sweep now and returns how many entries were dropped.
    ///
    /// # Errors
    ///
    /// Returns a storage error on timeout or actor failure.
    pub async fn sweep(&self) -> AuthResult<usize> {
        self.call(|reply| CodeCommand::Sweep { reply }).await
    }

    /// Round-trips through the actor and returns its entry count.
    ///
    /// # Errors
    ///
    /// Returns a storage error on timeout or actor failure.
    pub async fn ping(&self) -> AuthResult<usize> {
        self.call(|reply| CodeCommand::Ping { reply }).await
    }
}

async fn run_code_shard(
    mut state: CodeShardState,
    mut rx: mpsc::Receiver<CodeCommand>,
    sweep_interval: Duration,
) {
    let mut ticker = tokio::time::interval(sweep_interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                let now = OffsetDateTime::now_utc();
                // A dropped reply receiver means the caller timed out; the
                // state change stands either way.
                match command {
                    CodeCommand::Issue { grant, reply } => {
                        let _ = reply.send(state.issue(grant, now));
                    }
                    CodeCommand::Consume { request, reply } => {
                        let _ = reply.send(state.consume(request, now));
                    }
                    CodeCommand::AttachRefreshToken { code, refresh_token_jti, reply } => {
                        let _ = reply.send(state.attach_refresh_token(&code, refresh_token_jti));
                    }
                    CodeCommand::Sweep { reply } => {
                        let _ = reply.send(state.sweep(now));
                    }
                    CodeCommand::Ping { reply } => {
                        let _ = reply.send(state.len());
                    }
                }
            }
            _ = ticker.tick() => {
                let dropped = state.sweep(OffsetDateTime::now_utc());
                if dropped > 0 {
                    tracing::debug!(shard = state.shard, dropped, "Swept authorization codes");
                }
            }
        }
    }
    tracing::debug!(shard = state.shard, "Code shard actor stopped");
}

// =============================================================================
// Sharded Store
// =============================================================================

/// [`AuthorizationCodeStore`] spread over in-process shard actors.
pub struct ShardedCodeStore {
    config: Arc<ShardConfigCache>,
    actors: ShardNamespace<u32, CodeShardHandle>,
    settings: CodeShardSettings,
}

impl ShardedCodeStore {
    /// Creates a store; actors are spawned on first use.
    pub fn new(config: Arc<ShardConfigCache>, settings: CodeShardSettings) -> Self {
        Self {
            config,
            actors: ShardNamespace::new("authorization_code"),
            settings,
        }
    }

    /// Returns the actor for a shard index, spawning it if needed.
    pub fn actor(&self, shard: u32) -> CodeShardHandle {
        self.actors
            .get_or_spawn(shard, |&index| CodeShardHandle::spawn(index, &self.settings))
    }

    /// Returns every running actor's shard index.
    #[must_use]
    pub fn live_shards(&self) -> Vec<u32> {
        let mut shards: Vec<u32> = self.actors.live().into_iter().map(|(k, _)| k).collect();
        shards.sort_unstable();
        shards
    }

    /// Returns every running actor.
    #[must_use]
    pub fn live_actors(&self) -> Vec<CodeShardHandle> {
        self.actors.live().into_iter().map(|(_, h)| h).collect()
    }

    /// Resolves the actor that owns a presented code, plus the original
    /// shard's actor when the code predates a scale-down.
    async fn route(&self, code: &AuthorizationCodeValue) -> (CodeShardHandle, Option<CodeShardHandle>) {
        let count = self.config.shard_count().await;
        let original = code.shard();
        let target = remap_shard_index(original, count);
        let drain = (target != original)
            .then(|| self.actors.get_live(&original))
            .flatten();
        (self.actor(target), drain)
    }
}

#[async_trait]
impl AuthorizationCodeStore for ShardedCodeStore {
    async fn issue(&self, grant: NewAuthorizationCode) -> AuthResult<String> {
        let count = self.config.shard_count().await;
        let shard = shard_index(&routing_key(&grant.subject, &grant.client_id), count);
        self.actor(shard).issue(grant).await
    }

    async fn consume(&self, request: ConsumeRequest) -> AuthResult<ConsumeOutcome> {
        let Ok(code) = request.code.parse::<AuthorizationCodeValue>() else {
            return Ok(ConsumeOutcome::NotFoundOrExpired);
        };
        let (actor, drain) = self.route(&code).await;

        let outcome = actor.consume(request.clone()).await?;
        match (outcome, drain) {
            (ConsumeOutcome::NotFoundOrExpired, Some(original)) => {
                tracing::debug!(
                    shard = original.shard(),
                    remapped = actor.shard(),
                    "Consuming code on its pre-scale-down shard"
                );
                original.consume(request).await
            }
            (outcome, _) => Ok(outcome),
        }
    }

    async fn attach_refresh_token(
        &self,
        code: &str,
        refresh_token_jti: &str,
    ) -> AuthResult<AttachOutcome> {
        let Ok(value) = code.parse::<AuthorizationCodeValue>() else {
            return Ok(AttachOutcome::Missing);
        };
        let (actor, drain) = self.route(&value).await;

        match (actor.attach_refresh_token(code, refresh_token_jti).await?, drain) {
            (AttachOutcome::Missing, Some(original)) => {
                original.attach_refresh_token(code, refresh_token_jti).await
            }
            (outcome, _) => Ok(outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardingConfig;
    use crate::oauth::{PkceChallenge, PkceVerifier};
    use crate::shard::config::InMemoryShardConfigStore;

    const VERIFIER: &str = "VVVVVVVVVVVVVVVVVVVVVVVVVVVVVVVVVVVVVVVVVVV";

    fn challenge() -> String {
        PkceChallenge::from_verifier(&PkceVerifier::new(VERIFIER).unwrap())
            .as_str()
            .to_string()
    }

    fn grant() -> NewAuthorizationCode {
        NewAuthorizationCode {
            client_id: "app".to_string(),
            subject: "alice".to_string(),
            redirect_uri: "https://app.example.com/cb".to_string(),
            scope: "openid offline_access".to_string(),
            nonce: Some("n-1".to_string()),
            code_challenge: Some(challenge()),
            code_challenge_method: Some(PkceChallengeMethod::S256),
            ..Default::default()
        }
    }

    fn consume_request(code: &str) -> ConsumeRequest {
        ConsumeRequest {
            code: code.to_string(),
            client_id: "app".to_string(),
            code_verifier: Some(VERIFIER.to_string()),
            dpop_jkt: None,
            access_token_jti: "at-1".to_string(),
        }
    }

    fn state() -> CodeShardState {
        CodeShardState::new(3, Duration::from_secs(60), Duration::from_secs(300))
    }

    #[test]
    fn test_consume_once_then_replay() {
        let mut shard = state();
        let now = OffsetDateTime::now_utc();
        let code = shard.issue(grant(), now);
        assert!(code.starts_with("3_"));

        let first = shard.consume(consume_request(&code), now);
        let ConsumeOutcome::Consumed(consumed) = first else {
            panic!("expected Consumed, got {first:?}");
        };
        assert_eq!(consumed.subject, "alice");
        assert_eq!(consumed.nonce.as_deref(), Some("n-1"));

        assert_eq!(
            shard.attach_refresh_token(&code, "v1_0_rt".to_string()),
            AttachOutcome::Attached
        );

        let mut second = consume_request(&code);
        second.access_token_jti = "at-2".to_string();
        assert_eq!(
            shard.consume(second, now),
            ConsumeOutcome::ReplayDetected {
                subject: "alice".to_string(),
                client_id: "app".to_string(),
                access_token_jti: Some("at-1".to_string()),
                refresh_token_jti: Some("v1_0_rt".to_string()),
            }
        );
    }

    #[test]
    fn test_replay_before_refresh_token_is_recorded() {
        let mut shard = state();
        let now = OffsetDateTime::now_utc();
        let code = shard.issue(grant(), now);
        assert!(matches!(
            shard.consume(consume_request(&code), now),
            ConsumeOutcome::Consumed(_)
        ));

        // The replay lands while the first redemption is still registering
        // its refresh family.
        assert_eq!(
            shard.consume(consume_request(&code), now),
            ConsumeOutcome::ReplayDetected {
                subject: "alice".to_string(),
                client_id: "app".to_string(),
                access_token_jti: Some("at-1".to_string()),
                refresh_token_jti: None,
            }
        );
        assert_eq!(
            shard.attach_refresh_token(&code, "v1_0_rt".to_string()),
            AttachOutcome::Replayed
        );

        // Later replays carry the recorded JTI.
        assert!(matches!(
            shard.consume(consume_request(&code), now),
            ConsumeOutcome::ReplayDetected { refresh_token_jti: Some(ref jti), .. } if jti == "v1_0_rt"
        ));
    }

    #[test]
    fn test_attach_to_unknown_code_is_missing() {
        let mut shard = state();
        assert_eq!(
            shard.attach_refresh_token("3_nothing", "v1_0_rt".to_string()),
            AttachOutcome::Missing
        );
    }

    #[test]
    fn test_rejections_do_not_consume() {
        let mut shard = state();
        let now = OffsetDateTime::now_utc();
        let code = shard.issue(grant(), now);

        let mut wrong_verifier = consume_request(&code);
        wrong_verifier.code_verifier = Some("W".repeat(43));
        assert_eq!(
            shard.consume(wrong_verifier, now),
            ConsumeOutcome::Rejected(ConsumeRejection::PkceMismatch)
        );

        let mut missing_verifier = consume_request(&code);
        missing_verifier.code_verifier = None;
        assert_eq!(
            shard.consume(missing_verifier, now),
            ConsumeOutcome::Rejected(ConsumeRejection::PkceMismatch)
        );

        let mut other_client = consume_request(&code);
        other_client.client_id = "evil".to_string();
        assert_eq!(
            shard.consume(other_client, now),
            ConsumeOutcome::Rejected(ConsumeRejection::ClientMismatch)
        );

        assert!(matches!(
            shard.consume(consume_request(&code), now),
            ConsumeOutcome::Consumed(_)
        ));
    }

    #[test]
    fn test_verifier_without_challenge_is_rejected() {
        let mut shard = state();
        let now = OffsetDateTime::now_utc();
        let code = shard.issue(
            NewAuthorizationCode {
                code_challenge: None,
                code_challenge_method: None,
                ..grant()
            },
            now,
        );
        assert_eq!(
            shard.consume(consume_request(&code), now),
            ConsumeOutcome::Rejected(ConsumeRejection::PkceMismatch)
        );
    }

    #[test]
    fn test_dpop_binding() {
        let mut shard = state();
        let now = OffsetDateTime::now_utc();
        let code = shard.issue(
            NewAuthorizationCode {
                dpop_jkt: Some("jkt-1".to_string()),
                ..grant()
            },
            now,
        );

        assert_eq!(
            shard.consume(consume_request(&code), now),
            ConsumeOutcome::Rejected(ConsumeRejection::DpopBindingMismatch)
        );

        let mut other_key = consume_request(&code);
        other_key.dpop_jkt = Some("jkt-2".to_string());
        assert_eq!(
            shard.consume(other_key, now),
            ConsumeOutcome::Rejected(ConsumeRejection::DpopBindingMismatch)
        );

        let mut bound = consume_request(&code);
        bound.dpop_jkt = Some("jkt-1".to_string());
        let ConsumeOutcome::Consumed(consumed) = shard.consume(bound, now) else {
            panic!("expected Consumed");
        };
        assert_eq!(consumed.dpop_jkt.as_deref(), Some("jkt-1"));
    }

    #[test]
    fn test_expiry_and_retention() {
        let mut shard = state();
        let now = OffsetDateTime::now_utc();
        let expired = shard.issue(grant(), now);
        let later = now + Duration::from_secs(61);
        assert_eq!(
            shard.consume(consume_request(&expired), later),
            ConsumeOutcome::NotFoundOrExpired
        );

        let code = shard.issue(grant(), now);
        assert!(matches!(
            shard.consume(consume_request(&code), now),
            ConsumeOutcome::Consumed(_)
        ));

        // Still reported as a replay within TTL + grace.
        let within = now + Duration::from_secs(300);
        assert!(matches!(
            shard.consume(consume_request(&code), within),
            ConsumeOutcome::ReplayDetected { .. }
        ));

        let past = now + Duration::from_secs(361);
        assert_eq!(shard.sweep(past), 1);
        assert!(shard.is_empty());
        assert_eq!(
            shard.consume(consume_request(&code), past),
            ConsumeOutcome::NotFoundOrExpired
        );
    }

    fn store(shards: u32) -> (Arc<InMemoryShardConfigStore>, ShardedCodeStore) {
        let control = Arc::new(InMemoryShardConfigStore::new());
        control.set_shard_count(Some(shards));
        let settings = ShardingConfig {
            config_cache_ttl: Duration::ZERO,
            ..ShardingConfig::default()
        };
        let cache = Arc::new(ShardConfigCache::new(control.clone(), settings));
        let store = ShardedCodeStore::new(
            cache,
            CodeShardSettings {
                code_ttl: Duration::from_secs(60),
                consumed_grace: Duration::from_secs(300),
                call_timeout: Duration::from_secs(5),
                sweep_interval: Duration::from_secs(60),
                mailbox: 16,
            },
        );
        (control, store)
    }

    #[tokio::test]
    async fn test_concurrent_consume_has_single_winner() {
        let (_control, store) = store(4);
        let store = Arc::new(store);
        let code = store.issue(grant()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let mut request = consume_request(&code);
            request.access_token_jti = format!("at-{i}");
            handles.push(tokio::spawn(async move { store.consume(request).await.unwrap() }));
        }

        let mut consumed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ConsumeOutcome::Consumed(_) => consumed += 1,
                ConsumeOutcome::ReplayDetected { .. } => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(consumed, 1);
    }

    #[tokio::test]
    async fn test_code_survives_scale_down() {
        let (control, store) = store(16);

        // Find a code whose shard will be out of range after scaling to 4.
        let code = loop {
            let mut g = grant();
            g.subject = uuid::Uuid::new_v4().to_string();
            let code = store.issue(g.clone()).await.unwrap();
            let value: AuthorizationCodeValue = code.parse().unwrap();
            if value.shard() >= 4 {
                break code;
            }
        };

        control.set_shard_count(Some(4));
        let outcome = store.consume(consume_request(&code)).await.unwrap();
        assert!(matches!(outcome, ConsumeOutcome::Consumed(_)));
        assert_eq!(
            store.attach_refresh_token(&code, "v1_0_x").await.unwrap(),
            AttachOutcome::Attached
        );

        let replay = store.consume(consume_request(&code)).await.unwrap();
        assert!(matches!(replay, ConsumeOutcome::ReplayDetected { .. }));
    }

    #[tokio::test]
    async fn test_malformed_code_is_not_found() {
        let (_control, store) = store(4);
        let outcome = store.consume(consume_request("garbage")).await.unwrap();
        assert_eq!(outcome, ConsumeOutcome::NotFoundOrExpired);
    }

    #[tokio::test]
    async fn test_actor_ping_and_sweep() {
        let (_control, store) = store(2);
        store.issue(grant()).await.unwrap();
        let shards = store.live_shards();
        assert_eq!(shards.len(), 1);

        let actor = store.actor(shards[0]);
        assert_eq!(actor.ping().await.unwrap(), 1);
        assert_eq!(actor.sweep().await.unwrap(), 0);
    }

    #[test]
    fn test_code_fingerprint_is_short_and_stable() {
        let a = code_fingerprint("3_secret");
        assert_eq!(a.len(), 16);
        assert_eq!(a, code_fingerprint("3_secret"));
        assert_ne!(a, code_fingerprint("3_other"));
    }
}
