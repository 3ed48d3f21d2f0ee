//! One-time JWT ID (JTI) tracking.
//!
//! Used for DPoP proofs (keyed per client), client assertions and JWT bearer
//! assertions. Callers namespace their keys, e.g. `dpop:{client_id}:{jti}`.

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::AuthResult;

/// Storage for used JTI values.
///
/// # Atomicity
///
/// `mark_used` is the only replay check the engine relies on. It must be a
/// single atomic check-and-insert per key: two concurrent calls with the same
/// key must not both return `true`. A database implementation would use a
/// conditional insert:
///
/// ```sql
/// INSERT INTO used_jtis (jti, expires_at)
/// VALUES ($1, $2)
/// ON CONFLICT (jti) DO NOTHING
/// RETURNING jti
/// ```
#[async_trait]
pub trait JtiStorage: Send + Sync {
    /// Marks a key as used.
    ///
    /// Returns `true` on first use and `false` when the key was already
    /// recorded and has not expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn mark_used(&self, key: &str, expires_at: OffsetDateTime) -> AuthResult<bool>;

    /// Returns `true` if the key is recorded and not yet expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn is_used(&self, key: &str) -> AuthResult<bool>;

    /// Deletes expired entries and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the cleanup operation fails.
    async fn cleanup_expired(&self) -> AuthResult<u64>;
}
