//! Refresh token rotation shard actors.
//!
//! An actor is addressed by `(client_id, generation, shard_index)` and holds
//! one token family per `(user_id, client_id)` pair routed to it. A family
//! has a monotonically increasing version; every rotation checks the
//! presented version against the current one and advances it in the same
//! step. Presenting a token the family has already rotated past revokes the
//! family.
//!
//! The generation and shard come from the presented token's JTI, never from
//! the live topology, so families stay reachable after re-partitioning.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};

use crate::AuthResult;
use crate::config::AuthConfig;
use crate::shard::call_actor;
use crate::shard::config::ShardConfigCache;
use crate::shard::namespace::{ActorHandle, ShardNamespace};
use crate::shard::router::{RefreshTokenJti, routing_key, shard_index};
use crate::types::Scope;

// =============================================================================
// Operations
// =============================================================================

/// Address of one refresh shard actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct RefreshShardAddress {
    /// Client whose families live here.
    pub client_id: String,
    /// Topology generation.
    pub generation: u32,
    /// Shard within the generation.
    pub shard_index: u32,
}

impl RefreshShardAddress {
    /// Address encoded in a refresh token JTI.
    #[must_use]
    pub fn from_jti(client_id: &str, jti: &RefreshTokenJti) -> Self {
        Self {
            client_id: client_id.to_string(),
            generation: jti.generation(),
            shard_index: jti.shard(),
        }
    }
}

/// Input for registering a new family.
#[derive(Debug, Clone)]
pub struct NewFamily {
    /// End user.
    pub user_id: String,
    /// Client.
    pub client_id: String,
    /// Granted scope (space-delimited).
    pub scope: String,
    /// Absolute family lifetime.
    pub ttl: Duration,
    /// DPoP key the family is bound to.
    pub dpop_jkt: Option<String>,
}

/// A freshly registered family.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredFamily {
    /// JTI of the first refresh token; also the family ID.
    pub jti: String,
    /// Always 1.
    pub version: u64,
    /// When the family expires.
    pub expires_at: OffsetDateTime,
}

/// Input of a rotate call.
#[derive(Debug, Clone)]
pub struct RotateRequest {
    /// `rtv` of the presented token.
    pub incoming_version: u64,
    /// `jti` of the presented token.
    pub incoming_jti: String,
    /// Token subject.
    pub user_id: String,
    /// Authenticated client.
    pub client_id: String,
    /// Requested scope, if narrowing.
    pub requested_scope: Option<String>,
}

/// Why a rotation failed without theft.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateRejection {
    /// No family, or the token belongs to a family that was replaced.
    NotFound,
    /// The family was revoked.
    Revoked,
    /// The family outlived its lifetime.
    Expired,
}

/// Result of a rotate call.
#[derive(Debug, Clone, PartialEq)]
pub enum RotateOutcome {
    /// The family advanced.
    Rotated {
        /// Version the new token carries.
        new_version: u64,
        /// JTI of the new token, on the same generation and shard.
        new_jti: String,
        /// Scope for the tokens minted now.
        allowed_scope: String,
        /// Family expiry; the new token does not outlive it.
        expires_at: OffsetDateTime,
        /// DPoP key the family is bound to.
        dpop_jkt: Option<String>,
    },
    /// A rotated-past token was presented; the family is now revoked.
    TheftDetected {
        /// ID of the revoked family.
        family_id: String,
    },
    /// The family cannot be rotated.
    Rejected(RotateRejection),
    /// The requested scope exceeds the family's scope. Nothing changed.
    InvalidScope,
}

/// Storage seam used by the grant orchestrator.
#[async_trait]
pub trait RefreshTokenFamilyStore: Send + Sync {
    /// Starts a new family (replacing any existing one for the pair) and
    /// returns its first JTI.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the owning actor is unavailable.
    async fn register_family(&self, family: NewFamily) -> AuthResult<RegisteredFamily>;

    /// Checks and advances the family of the presented token.
    ///
    /// # Errors
    ///
    /// Returns a storage error on timeout or actor failure. Callers must not
    /// retry.
    async fn rotate(&self, request: RotateRequest) -> AuthResult<RotateOutcome>;

    /// Revokes the family of a user and client.
    ///
    /// With `jti`, only the family that issued that JTI is revoked; without,
    /// whatever family the pair currently has on the live topology.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the owning actor is unavailable.
    async fn revoke_family(&self, user_id: &str, client_id: &str, jti: Option<&str>)
    -> AuthResult<bool>;
}

// =============================================================================
// Shard State
// =============================================================================

/// How many of a family's most recent JTIs are remembered. Older tokens of
/// the family, except its first, are answered as unknown rather than stale.
const RECENT_JTIS: usize = 64;

#[derive(Debug, Clone)]
struct TokenFamily {
    family_id: String,
    version: u64,
    current_jti: String,
    recent_jtis: VecDeque<String>,
    scope: String,
    expires_at: OffsetDateTime,
    revoked: bool,
    dpop_jkt: Option<String>,
}

impl TokenFamily {
    /// Whether `jti` was issued by this family and is still remembered.
    fn issued(&self, jti: &str) -> bool {
        self.family_id == jti || self.recent_jtis.iter().any(|j| j == jti)
    }
}

/// State of one refresh shard. Only ever touched by its actor task.
#[derive(Debug, Default)]
pub struct RefreshShardState {
    families: HashMap<(String, String), TokenFamily>,
}

impl RefreshShardState {
    /// Creates an empty shard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a family whose first token carries `jti`.
    pub fn register_family(
        &mut self,
        jti: String,
        family: NewFamily,
        now: OffsetDateTime,
    ) -> RegisteredFamily {
        let expires_at = now + family.ttl;
        let key = (family.user_id, family.client_id);
        if let Some(previous) = self.families.get(&key)
            && !previous.revoked
        {
            tracing::debug!(
                user_id = %key.0,
                client_id = %key.1,
                family_id = %previous.family_id,
                "Replacing refresh token family"
            );
        }
        self.families.insert(
            key,
            TokenFamily {
                family_id: jti.clone(),
                version: 1,
                current_jti: jti.clone(),
                recent_jtis: VecDeque::from([jti.clone()]),
                scope: family.scope,
                expires_at,
                revoked: false,
                dpop_jkt: family.dpop_jkt,
            },
        );
        RegisteredFamily {
            jti,
            version: 1,
            expires_at,
        }
    }

    /// Rotates the family of the presented token.
    pub fn rotate(&mut self, request: RotateRequest, now: OffsetDateTime) -> RotateOutcome {
        let key = (request.user_id, request.client_id);
        let Some(family) = self.families.get_mut(&key) else {
            return RotateOutcome::Rejected(RotateRejection::NotFound);
        };

        if !family.issued(&request.incoming_jti) {
            return RotateOutcome::Rejected(RotateRejection::NotFound);
        }
        if family.revoked {
            return RotateOutcome::Rejected(RotateRejection::Revoked);
        }
        if family.expires_at <= now {
            return RotateOutcome::Rejected(RotateRejection::Expired);
        }

        if request.incoming_version != family.version || request.incoming_jti != family.current_jti
        {
            family.revoked = true;
            tracing::warn!(
                user_id = %key.0,
                client_id = %key.1,
                family_id = %family.family_id,
                presented_version = request.incoming_version,
                current_version = family.version,
                "Stale refresh token presented; family revoked"
            );
            return RotateOutcome::TheftDetected {
                family_id: family.family_id.clone(),
            };
        }

        let granted = Scope::parse(&family.scope);
        let allowed = match &request.requested_scope {
            Some(requested) => {
                let requested = Scope::parse(requested);
                if !requested.is_subset_of(&granted) {
                    return RotateOutcome::InvalidScope;
                }
                requested
            }
            None => granted,
        };

        let Ok(incoming) = request.incoming_jti.parse::<RefreshTokenJti>() else {
            return RotateOutcome::Rejected(RotateRejection::NotFound);
        };
        let new_jti = incoming.regenerate().to_string();

        family.version += 1;
        family.current_jti = new_jti.clone();
        family.recent_jtis.push_back(new_jti.clone());
        if family.recent_jtis.len() > RECENT_JTIS {
            family.recent_jtis.pop_front();
        }

        RotateOutcome::Rotated {
            new_version: family.version,
            new_jti,
            allowed_scope: allowed.to_string(),
            expires_at: family.expires_at,
            dpop_jkt: family.dpop_jkt.clone(),
        }
    }

    /// Revokes a family. With `jti`, only if the family issued it.
    pub fn revoke_family(&mut self, user_id: &str, client_id: &str, jti: Option<&str>) -> bool {
        let key = (user_id.to_string(), client_id.to_string());
        match self.families.get_mut(&key) {
            Some(family) if jti.is_none_or(|j| family.issued(j)) => {
                family.revoked = true;
                true
            }
            _ => false,
        }
    }

    /// Drops families past their lifetime, revoked or not.
    pub fn sweep(&mut self, now: OffsetDateTime) -> usize {
        let before = self.families.len();
        self.families.retain(|_, family| family.expires_at > now);
        before - self.families.len()
    }

    /// Number of held families.
    #[must_use]
    pub fn len(&self) -> usize {
        self.families.len()
    }

    /// Returns `true` if the shard holds no family.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Tuning shared by every refresh shard actor.
#[derive(Debug, Clone)]
pub struct RefreshShardSettings {
    /// Upper bound for one actor call.
    pub call_timeout: Duration,
    /// Interval between sweeps.
    pub sweep_interval: Duration,
    /// Mailbox capacity.
    pub mailbox: usize,
}

impl RefreshShardSettings {
    /// Derives actor settings from the engine configuration.
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            call_timeout: config.sharding.actor_timeout,
            sweep_interval: config.sharding.sweep_interval,
            mailbox: config.sharding.actor_mailbox,
        }
    }
}

enum RefreshCommand {
    Register {
        jti: String,
        family: NewFamily,
        reply: oneshot::Sender<RegisteredFamily>,
    },
    Rotate {
        request: RotateRequest,
        reply: oneshot::Sender<RotateOutcome>,
    },
    Revoke {
        user_id: String,
        client_id: String,
        jti: Option<String>,
        reply: oneshot::Sender<bool>,
    },
    Sweep {
        reply: oneshot::Sender<usize>,
    },
    Ping {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to a running refresh shard actor.
#[derive(Clone)]
pub struct RefreshShardHandle {
    address: RefreshShardAddress,
    tx: mpsc::Sender<RefreshCommand>,
    call_timeout: Duration,
}

impl ActorHandle for RefreshShardHandle {
    fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl RefreshShardHandle {
    /// Spawns the actor for `address` on the current runtime.
    #[must_use]
    pub fn spawn(address: RefreshShardAddress, settings: &RefreshShardSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.mailbox.max(1));
        tokio::spawn(run_refresh_shard(
            address.clone(),
            RefreshShardState::new(),
            rx,
            settings.sweep_interval,
        ));
        Self {
            address,
            tx,
            call_timeout: settings.call_timeout,
        }
    }

    /// Address of this actor.
    #[must_use]
    pub fn address(&self) -> &RefreshShardAddress {
        &self.address
    }

    async fn call<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> RefreshCommand,
    ) -> AuthResult<R> {
        let label = format!(
            "Refresh shard {}/v{}/{}",
            self.address.client_id, self.address.generation, self.address.shard_index
        );
        call_actor(&self.tx, self.call_timeout, &label, command).await
    }

    /// Registers a family.
    ///
    /// # Errors
    ///
    /// Returns a storage error on timeout or actor failure.
    pub async fn register_family(&self, jti: String, family: NewFamily) -> AuthResult<RegisteredFamily> {
        self.call(|reply| RefreshCommand::Register { jti, family, reply })
            .await
    }

    /// Rotates a family.
    ///
    /// # Errors
    ///
    /// Returns a storage error on timeout or actor failure.
    pub async fn rotate(&self, request: RotateRequest) -> AuthResult<RotateOutcome> {
        self.call(|reply| RefreshCommand::Rotate { request, reply })
            .await
    }

    /// Revokes a family.
    ///
    /// # Errors
    ///
    /// Returns a storage error on timeout or actor failure.
    pub async fn revoke_family(
        &self,
        user_id: &str,
        client_id: &str,
        jti: Option<&str>,
    ) -> AuthResult<bool> {
        self.call(|reply| RefreshCommand::Revoke {
            user_id: user_id.to_string(),
            client_id: client_id.to_string(),
            jti: jti.map(str::to_string),
            reply,
        })
        .await
    }

    /// Runs a sweep now and returns how many families were dropped.
    ///
    /// # Errors
    ///
    /// Returns a storage error on timeout or actor failure.
    pub async fn sweep(&self) -> AuthResult<usize> {
        self.call(|reply| RefreshCommand::Sweep { reply }).await
    }

    /// Round-trips through the actor and returns its family count.
    ///
    /// # Errors
    ///
    /// Returns a storage error on timeout or actor failure.
    pub async fn ping(&self) -> AuthResult<usize> {
        self.call(|reply| RefreshCommand::Ping { reply }).await
    }
}

async fn run_refresh_shard(
    address: RefreshShardAddress,
    mut state: RefreshShardState,
    mut rx: mpsc::Receiver<RefreshCommand>,
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
                match command {
                    RefreshCommand::Register { jti, family, reply } => {
                        let _ = reply.send(state.register_family(jti, family, now));
                    }
                    RefreshCommand::Rotate { request, reply } => {
                        let _ = reply.send(state.rotate(request, now));
                    }
                    RefreshCommand::Revoke { user_id, client_id, jti, reply } => {
                        let _ = reply.send(state.revoke_family(&user_id, &client_id, jti.as_deref()));
                    }
                    RefreshCommand::Sweep { reply } => {
                        let _ = reply.send(state.sweep(now));
                    }
                    RefreshCommand::Ping { reply } => {
                        let _ = reply.send(state.len());
                    }
                }
            }
            _ = ticker.tick() => {
                let dropped = state.sweep(OffsetDateTime::now_utc());
                if dropped > 0 {
                    tracing::debug!(
                        client_id = %address.client_id,
                        generation = address.generation,
                        shard = address.shard_index,
                        dropped,
                        "Swept refresh token families"
                    );
                }
            }
        }
    }
}

// =============================================================================
// Sharded Store
// =============================================================================

/// [`RefreshTokenFamilyStore`] spread over in-process shard actors.
pub struct ShardedRefreshStore {
    config: Arc<ShardConfigCache>,
    actors: ShardNamespace<RefreshShardAddress, RefreshShardHandle>,
    settings: RefreshShardSettings,
}

impl ShardedRefreshStore {
    /// Creates a store; actors are spawned on first use.
    pub fn new(config: Arc<ShardConfigCache>, settings: RefreshShardSettings) -> Self {
        Self {
            config,
            actors: ShardNamespace::new("refresh_token"),
            settings,
        }
    }

    /// Returns the actor at `address`, spawning it if needed.
    pub fn actor(&self, address: RefreshShardAddress) -> RefreshShardHandle {
        self.actors
            .get_or_spawn(address, |a| RefreshShardHandle::spawn(a.clone(), &self.settings))
    }

    /// Addresses of every shard of `client_id` on the live topology.
    pub async fn current_addresses(&self, client_id: &str) -> Vec<RefreshShardAddress> {
        let topology = self.config.refresh_token_shard_config().await;
        (0..topology.shard_count)
            .map(|shard_index| RefreshShardAddress {
                client_id: client_id.to_string(),
                generation: topology.generation,
                shard_index,
            })
            .collect()
    }

    /// Returns every running actor.
    #[must_use]
    pub fn live_actors(&self) -> Vec<RefreshShardHandle> {
        self.actors.live().into_iter().map(|(_, h)| h).collect()
    }

    async fn current_address(&self, user_id: &str, client_id: &str) -> RefreshShardAddress {
        let topology = self.config.refresh_token_shard_config().await;
        RefreshShardAddress {
            client_id: client_id.to_string(),
            generation: topology.generation,
            shard_index: shard_index(&routing_key(user_id, client_id), topology.shard_count),
        }
    }
}

#[async_trait]
impl RefreshTokenFamilyStore for ShardedRefreshStore {
    async fn register_family(&self, family: NewFamily) -> AuthResult<RegisteredFamily> {
        let address = self.current_address(&family.user_id, &family.client_id).await;
        let jti = RefreshTokenJti::generate(address.generation, address.shard_index).to_string();
        self.actor(address).register_family(jti, family).await
    }

    async fn rotate(&self, request: RotateRequest) -> AuthResult<RotateOutcome> {
        let Ok(jti) = request.incoming_jti.parse::<RefreshTokenJti>() else {
            return Ok(RotateOutcome::Rejected(RotateRejection::NotFound));
        };
        let address = RefreshShardAddress::from_jti(&request.client_id, &jti);
        self.actor(address).rotate(request).await
    }

    async fn revoke_family(
        &self,
        user_id: &str,
        client_id: &str,
        jti: Option<&str>,
    ) -> AuthResult<bool> {
        let address = match jti.map(str::parse::<RefreshTokenJti>) {
            Some(Ok(parsed)) => RefreshShardAddress::from_jti(client_id, &parsed),
            Some(Err(_)) => return Ok(false),
            None => self.current_address(user_id, client_id).await,
        };
        self.actor(address).revoke_family(user_id, client_id, jti).await
    }
}
