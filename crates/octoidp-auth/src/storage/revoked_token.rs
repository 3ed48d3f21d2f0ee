//! Revoked access token tracking.
//!
//! Access tokens are self-contained JWTs, so revocation is a deny-list of
//! JTIs kept until the token would have expired anyway. Entries are written
//! when a replayed authorization code reveals which access token the first
//! redemption produced.

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::AuthResult;

/// Storage for revoked access token JTIs.
#[async_trait]
pub trait RevokedTokenStorage: Send + Sync {
    /// Marks a JTI as revoked until `expires_at`.
    ///
    /// Revoking an already revoked JTI succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn revoke(&self, jti: &str, expires_at: OffsetDateTime) -> AuthResult<()>;

    /// Returns `true` if the JTI is revoked.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn is_revoked(&self, jti: &str) -> AuthResult<bool>;

    /// Deletes entries whose token has expired and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the cleanup operation fails.
    async fn cleanup_expired(&self) -> AuthResult<u64>;
}
