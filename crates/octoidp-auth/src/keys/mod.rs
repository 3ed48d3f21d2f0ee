//! Signing keys and verification key sets.
//!
//! - [`KeyManager`] - source of truth for keys
//! - [`LocalKeyManager`] - in-process key generation
//! - [`HttpKeyManager`] - client for a remote Key Manager
//! - [`KeyCache`] - TTL caches with kid-driven invalidation

pub mod cache;
pub mod manager;
pub mod remote;

use std::sync::Arc;

pub use cache::{KeyCache, KeyCacheStats, VerificationKey};
pub use manager::{KeyManager, LocalKeyManager};
pub use remote::HttpKeyManager;

use crate::AuthResult;
use crate::config::KeyCacheConfig;

/// Builds the Key Manager selected by configuration: remote when a URL is
/// set, local otherwise.
///
/// # Errors
///
/// Returns an error if the remote client cannot be built or local key
/// generation fails.
pub fn key_manager_from_config(config: &KeyCacheConfig) -> AuthResult<Arc<dyn KeyManager>> {
    match &config.url {
        Some(url) => {
            tracing::info!(url = %url, "Using remote Key Manager");
            Ok(Arc::new(HttpKeyManager::new(
                url,
                config.secret.clone(),
                config.request_timeout,
            )?))
        }
        None => {
            tracing::info!(algorithm = %config.algorithm, "Using local Key Manager");
            Ok(Arc::new(LocalKeyManager::new(
                config.algorithm,
                config.retained_keys,
            )?))
        }
    }
}
