//! Process-wide key caches.
//!
//! Two independent caches share one pattern: an immutable snapshot behind an
//! [`ArcSwapOption`] that readers load without locking, plus a mutex that
//! coalesces concurrent refetches. An entry is served while younger than its
//! TTL. A lookup naming a `kid` the cache does not hold bypasses the TTL and
//! refetches immediately, so a forced key rotation propagates in one
//! round-trip.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::AuthResult;
use crate::config::KeyCacheConfig;
use crate::error::AuthError;
use crate::keys::KeyManager;
use crate::token::{Jwks, SigningKeyPair};

/// A public key ready for signature verification.
#[derive(Clone)]
pub struct VerificationKey {
    /// Key ID.
    pub kid: String,
    /// Decoding key.
    pub key: DecodingKey,
    /// Algorithm the key verifies.
    pub algorithm: Algorithm,
}

struct CachedSigningKey {
    key: Arc<SigningKeyPair>,
    fetched_at: Instant,
}

struct CachedJwks {
    jwks: Jwks,
    keys: HashMap<String, VerificationKey>,
    fetched_at: Instant,
}

#[derive(Default)]
struct Counters {
    signing_hits: AtomicU64,
    signing_misses: AtomicU64,
    jwks_hits: AtomicU64,
    jwks_misses: AtomicU64,
    refetches: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct KeyCacheStats {
    /// Signing key lookups served from cache.
    pub signing_hits: u64,
    /// Signing key lookups that went to the Key Manager.
    pub signing_misses: u64,
    /// Verification lookups served from cache.
    pub jwks_hits: u64,
    /// Verification lookups that went to the Key Manager.
    pub jwks_misses: u64,
    /// Calls made to the Key Manager.
    pub refetches: u64,
    /// Fetched entries discarded as malformed.
    pub rejected: u64,
    /// `kid` of the cached signing key.
    pub signing_kid: Option<String>,
    /// Age of the cached signing key.
    pub signing_age_ms: Option<u128>,
    /// `kid`s in the cached key set.
    pub jwks_kids: Vec<String>,
    /// Age of the cached key set.
    pub jwks_age_ms: Option<u128>,
}

/// Signing key and verification key set caches in front of a [`KeyManager`].
pub struct KeyCache {
    manager: Arc<dyn KeyManager>,
    signing_ttl: Duration,
    jwks_ttl: Duration,
    signing: ArcSwapOption<CachedSigningKey>,
    jwks: ArcSwapOption<CachedJwks>,
    signing_refresh: Mutex<()>,
    jwks_refresh: Mutex<()>,
    counters: Counters,
}

impl KeyCache {
    /// Creates empty caches. Nothing is fetched until first use.
    pub fn new(manager: Arc<dyn KeyManager>, signing_ttl: Duration, jwks_ttl: Duration) -> Self {
        Self {
            manager,
            signing_ttl,
            jwks_ttl,
            signing: ArcSwapOption::empty(),
            jwks: ArcSwapOption::empty(),
            signing_refresh: Mutex::new(()),
            jwks_refresh: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// Creates caches with the configured TTLs.
    pub fn from_config(manager: Arc<dyn KeyManager>, config: &KeyCacheConfig) -> Self {
        Self::new(manager, config.signing_key_ttl, config.jwks_ttl)
    }

    /// Returns the key to sign with.
    ///
    /// With `expected_kid`, a cached key with a different `kid` is dropped
    /// and the active key is refetched regardless of TTL.
    ///
    /// # Errors
    ///
    /// Returns `KeyManager` if the Key Manager fails, or `Configuration` if it
    /// hands out malformed key material. Neither is cached.
    pub async fn signing_key(&self, expected_kid: Option<&str>) -> AuthResult<Arc<SigningKeyPair>> {
        if let Some(entry) = self.signing.load_full() {
            if self.signing_usable(&entry, expected_kid) {
                self.counters.signing_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.key.clone());
            }
            if let Some(kid) = expected_kid
                && entry.key.kid != kid
            {
                tracing::info!(
                    cached_kid = %entry.key.kid,
                    expected_kid = %kid,
                    "Signing key id changed, refetching"
                );
                self.signing.store(None);
            }
        }
        self.counters.signing_misses.fetch_add(1, Ordering::Relaxed);

        let _guard = self.signing_refresh.lock().await;
        if let Some(entry) = self.signing.load_full()
            && self.signing_usable(&entry, expected_kid)
        {
            return Ok(entry.key.clone());
        }
        self.fetch_signing_key().await
    }

    /// Returns the verification key for `kid`.
    ///
    /// A cached `kid` is served without contacting the Key Manager. An
    /// unknown `kid` triggers exactly one refetch.
    ///
    /// # Errors
    ///
    /// Returns `KeyRevoked` if the `kid` is still unknown after the refetch,
    /// `KeyManager` if the Key Manager fails, or `Configuration` if the key
    /// set it returns is malformed.
    pub async fn verification_key(&self, kid: &str) -> AuthResult<VerificationKey> {
        if let Some(entry) = self.jwks.load_full() {
            if self.jwks_fresh(&entry)
                && let Some(key) = entry.keys.get(kid)
            {
                self.counters.jwks_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(key.clone());
            }
            if !entry.keys.contains_key(kid) {
                tracing::info!(kid = %kid, "Unknown key id, refetching key set");
                self.jwks.store(None);
            }
        }
        self.counters.jwks_misses.fetch_add(1, Ordering::Relaxed);

        let _guard = self.jwks_refresh.lock().await;
        if let Some(entry) = self.jwks.load_full()
            && self.jwks_fresh(&entry)
            && let Some(key) = entry.keys.get(kid)
        {
            return Ok(key.clone());
        }

        let entry = self.fetch_jwks().await?;
        entry.keys.get(kid).cloned().ok_or_else(|| {
            tracing::warn!(kid = %kid, "Key id not published after refetch");
            AuthError::key_revoked(kid)
        })
    }

    /// Rotates the signing key at the Key Manager and caches the new one.
    ///
    /// The key set cache is dropped so the new `kid` is picked up by the next
    /// verification.
    ///
    /// # Errors
    ///
    /// Returns `KeyManager` or `Configuration` on failure; the previous key
    /// stays cached.
    pub async fn rotate_signing_key(&self) -> AuthResult<Arc<SigningKeyPair>> {
        let _guard = self.signing_refresh.lock().await;
        self.counters.refetches.fetch_add(1, Ordering::Relaxed);
        let material = self.manager.rotate_key().await?;
        let key = self.accept_signing_material(&material)?;
        self.invalidate_jwks();
        Ok(key)
    }

    /// Drops the cached signing key.
    pub fn invalidate_signing(&self) {
        self.signing.store(None);
    }

    /// Drops the cached key set.
    pub fn invalidate_jwks(&self) {
        self.jwks.store(None);
    }

    /// Returns cache statistics.
    #[must_use]
    pub fn stats(&self) -> KeyCacheStats {
        let signing = self.signing.load_full();
        let jwks = self.jwks.load_full();
        let mut jwks_kids: Vec<String> = jwks
            .as_ref()
            .map(|e| e.keys.keys().cloned().collect())
            .unwrap_or_default();
        jwks_kids.sort();

        KeyCacheStats {
            signing_hits: self.counters.signing_hits.load(Ordering::Relaxed),
            signing_misses: self.counters.signing_misses.load(Ordering::Relaxed),
            jwks_hits: self.counters.jwks_hits.load(Ordering::Relaxed),
            jwks_misses: self.counters.jwks_misses.load(Ordering::Relaxed),
            refetches: self.counters.refetches.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            signing_kid: signing.as_ref().map(|e| e.key.kid.clone()),
            signing_age_ms: signing.as_ref().map(|e| e.fetched_at.elapsed().as_millis()),
            jwks_kids,
            jwks_age_ms: jwks.as_ref().map(|e| e.fetched_at.elapsed().as_millis()),
        }
    }

    fn signing_usable(&self, entry: &CachedSigningKey, expected_kid: Option<&str>) -> bool {
        entry.fetched_at.elapsed() < self.signing_ttl
            && expected_kid.is_none_or(|kid| entry.key.kid == kid)
    }

    fn jwks_fresh(&self, entry: &CachedJwks) -> bool {
        entry.fetched_at.elapsed() < self.jwks_ttl
    }

    async fn fetch_signing_key(&self) -> AuthResult<Arc<SigningKeyPair>> {
        self.counters.refetches.fetch_add(1, Ordering::Relaxed);
        let material = self.manager.active_signing_key().await?;
        self.accept_signing_material(&material)
    }

    fn accept_signing_material(
        &self,
        material: &crate::token::SigningKeyMaterial,
    ) -> AuthResult<Arc<SigningKeyPair>> {
        let key = SigningKeyPair::from_material(material).map_err(|e| {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::error!(kid = %material.kid, error = %e, "Discarding malformed signing key");
            AuthError::configuration(format!("Malformed signing key material: {e}"))
        })?;
        let key = Arc::new(key);
        self.signing.store(Some(Arc::new(CachedSigningKey {
            key: key.clone(),
            fetched_at: Instant::now(),
        })));
        tracing::debug!(kid = %key.kid, "Cached signing key");
        Ok(key)
    }

    async fn fetch_jwks(&self) -> AuthResult<Arc<CachedJwks>> {
        self.counters.refetches.fetch_add(1, Ordering::Relaxed);
        let jwks = self.manager.jwks().await?;

        let mut keys = HashMap::with_capacity(jwks.keys.len());
        for jwk in &jwks.keys {
            let Some(kid) = jwk.kid.clone().filter(|k| !k.is_empty()) else {
                return Err(self.reject_jwks("key without kid"));
            };
            let (key, algorithm) = jwk
                .to_decoding_key()
                .map_err(|e| self.reject_jwks(&format!("key {kid}: {e}")))?;
            keys.insert(
                kid.clone(),
                VerificationKey {
                    kid,
                    key,
                    algorithm,
                },
            );
        }

        let entry = Arc::new(CachedJwks {
            jwks,
            keys,
            fetched_at: Instant::now(),
        });
        self.jwks.store(Some(entry.clone()));
        tracing::debug!(keys = entry.keys.len(), "Cached verification key set");
        Ok(entry)
    }

    fn reject_jwks(&self, reason: &str) -> AuthError {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::error!(reason = %reason, "Discarding malformed key set");
        AuthError::configuration(format!("Malformed key set: {reason}"))
    }
}
