//! Shard topology configuration and its process-local cache.
//!
//! The live shard counts come from a control-plane [`ShardConfigStore`].
//! [`ShardConfigCache`] keeps an immutable [`ShardSnapshot`] behind an
//! `ArcSwap` and replaces it once the TTL has elapsed, so a change made in
//! the store reaches every instance within one TTL.
//!
//! Resolution order for each value: store, then environment variable, then
//! the configured default.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::AuthResult;
use crate::config::ShardingConfig;

/// Refresh token shard topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenShardConfig {
    /// Topology generation embedded in new refresh token JTIs.
    pub generation: u32,

    /// Number of shards per client in this generation.
    pub shard_count: u32,
}

/// Control-plane store holding the shard topology.
#[async_trait]
pub trait ShardConfigStore: Send + Sync {
    /// Returns the authorization code shard count, if configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    async fn get_shard_count(&self) -> AuthResult<Option<u32>>;

    /// Returns the refresh token shard topology, if configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    async fn get_refresh_token_shard_config(&self) -> AuthResult<Option<RefreshTokenShardConfig>>;
}

/// Where a snapshot value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// The shard config store.
    Store,
    /// An environment variable.
    Environment,
    /// The static configuration default.
    Default,
}

/// Immutable view of the shard topology.
#[derive(Debug, Clone, Serialize)]
pub struct ShardSnapshot {
    /// Authorization code shard count.
    pub code_shards: u32,

    /// Source of `code_shards`.
    pub code_source: ConfigSource,

    /// Refresh token topology.
    pub refresh: RefreshTokenShardConfig,

    /// Source of `refresh`.
    pub refresh_source: ConfigSource,

    /// When the snapshot was built. `None` until the store was first asked.
    #[serde(skip)]
    pub fetched_at: Option<Instant>,
}

impl ShardSnapshot {
    /// Milliseconds since the snapshot was fetched.
    #[must_use]
    pub fn age_ms(&self) -> Option<u128> {
        self.fetched_at.map(|at| at.elapsed().as_millis())
    }
}

/// TTL cache in front of a [`ShardConfigStore`].
///
/// Readers never wait on the store while a snapshot exists: when the
/// snapshot is stale, one caller refreshes it and concurrent callers keep
/// using the previous snapshot until the swap.
pub struct ShardConfigCache {
    store: Arc<dyn ShardConfigStore>,
    settings: ShardingConfig,
    snapshot: ArcSwap<ShardSnapshot>,
    refresh_lock: Mutex<()>,
}

impl ShardConfigCache {
    /// Creates a cache. The first read fetches from the store.
    pub fn new(store: Arc<dyn ShardConfigStore>, settings: ShardingConfig) -> Self {
        let initial = fallback_snapshot(&settings);
        Self {
            store,
            settings,
            snapshot: ArcSwap::from_pointee(initial),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Returns the current snapshot, refreshing it first if the TTL elapsed.
    pub async fn snapshot(&self) -> Arc<ShardSnapshot> {
        let current = self.snapshot.load_full();
        if self.is_fresh(&current) {
            return current;
        }

        // Someone else is refreshing; serve what we have.
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            return current;
        };
        // Re-check after winning the lock: another task may just have swapped.
        let current = self.snapshot.load_full();
        if self.is_fresh(&current) {
            return current;
        }
        self.fetch_and_swap().await
    }

    /// Returns the snapshot without consulting the store.
    #[must_use]
    pub fn current(&self) -> Arc<ShardSnapshot> {
        self.snapshot.load_full()
    }

    /// Returns the authorization code shard count.
    pub async fn shard_count(&self) -> u32 {
        self.snapshot().await.code_shards
    }

    /// Returns the refresh token shard topology.
    pub async fn refresh_token_shard_config(&self) -> RefreshTokenShardConfig {
        self.snapshot().await.refresh
    }

    /// Refetches from the store regardless of the TTL.
    pub async fn force_refresh(&self) -> Arc<ShardSnapshot> {
        let _guard = self.refresh_lock.lock().await;
        self.fetch_and_swap().await
    }

    fn is_fresh(&self, snapshot: &ShardSnapshot) -> bool {
        snapshot
            .fetched_at
            .is_some_and(|at| at.elapsed() < self.settings.config_cache_ttl)
    }

    async fn fetch_and_swap(&self) -> Arc<ShardSnapshot> {
        let fallback = fallback_snapshot(&self.settings);

        let (code_shards, code_source) = match self.store.get_shard_count().await {
            Ok(Some(count)) if count > 0 => (count, ConfigSource::Store),
            Ok(_) => (fallback.code_shards, fallback.code_source),
            Err(e) => {
                tracing::warn!(error = %e, "Shard count lookup failed, using fallback");
                (fallback.code_shards, fallback.code_source)
            }
        };

        let (refresh, refresh_source) =
            match self.store.get_refresh_token_shard_config().await {
                Ok(Some(cfg)) if cfg.shard_count > 0 => (cfg, ConfigSource::Store),
                Ok(_) => (fallback.refresh, fallback.refresh_source),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Refresh shard config lookup failed, using fallback"
                    );
                    (fallback.refresh, fallback.refresh_source)
                }
            };

        let previous = self.snapshot.load();
        if previous.fetched_at.is_some()
            && (previous.code_shards != code_shards || previous.refresh != refresh)
        {
            tracing::info!(
                code_shards,
                previous_code_shards = previous.code_shards,
                refresh_generation = refresh.generation,
                refresh_shards = refresh.shard_count,
                "Shard topology changed"
            );
        }

        let snapshot = Arc::new(ShardSnapshot {
            code_shards,
            code_source,
            refresh,
            refresh_source,
            fetched_at: Some(Instant::now()),
        });
        self.snapshot.store(snapshot.clone());
        snapshot
    }
}

fn env_count(name: &str) -> Option<u32> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|count| *count > 0)
}

fn fallback_snapshot(settings: &ShardingConfig) -> ShardSnapshot {
    let (code_shards, code_source) = match env_count(&settings.code_shards_env) {
        Some(count) => (count, ConfigSource::Environment),
        None => (settings.default_code_shards.max(1), ConfigSource::Default),
    };
    let (refresh_count, refresh_source) = match env_count(&settings.refresh_shards_env) {
        Some(count) => (count, ConfigSource::Environment),
        None => (settings.refresh_shard_count.max(1), ConfigSource::Default),
    };
    ShardSnapshot {
        code_shards,
        code_source,
        refresh: RefreshTokenShardConfig {
            generation: settings.refresh_generation,
            shard_count: refresh_count,
        },
        refresh_source,
        fetched_at: None,
    }
}

/// In-process shard config store for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryShardConfigStore {
    // Zero means unset.
    shard_count: AtomicU32,
    refresh: ArcSwapOption<RefreshTokenShardConfig>,
}

impl InMemoryShardConfigStore {
    /// Creates an empty store; every value falls back.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets or clears the authorization code shard count.
    pub fn set_shard_count(&self, count: Option<u32>) {
        self.shard_count.store(count.unwrap_or(0), Ordering::SeqCst);
    }

    /// Sets or clears the refresh token topology.
    pub fn set_refresh_token_shard_config(&self, config: Option<RefreshTokenShardConfig>) {
        self.refresh.store(config.map(Arc::new));
    }
}

#[async_trait]
impl ShardConfigStore for InMemoryShardConfigStore {
    async fn get_shard_count(&self) -> AuthResult<Option<u32>> {
        let count = self.shard_count.load(Ordering::SeqCst);
        Ok((count > 0).then_some(count))
    }

    async fn get_refresh_token_shard_config(&self) -> AuthResult<Option<RefreshTokenShardConfig>> {
        Ok(self.refresh.load_full().map(|cfg| *cfg))
    }
}
