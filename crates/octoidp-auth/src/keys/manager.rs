//! Key Manager interface and the in-process implementation.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::AuthResult;
use crate::error::AuthError;
use crate::token::{Jwk, Jwks, SigningAlgorithm, SigningKeyMaterial, SigningKeyPair};

/// Source of signing keys and the published verification key set.
#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Returns the key new tokens are signed with.
    ///
    /// # Errors
    ///
    /// Returns `KeyManager` if the key cannot be obtained.
    async fn active_signing_key(&self) -> AuthResult<SigningKeyMaterial>;

    /// Replaces the active key and returns the new one. The previous key
    /// stays in the key set for verification.
    ///
    /// # Errors
    ///
    /// Returns `KeyManager` if rotation fails.
    async fn rotate_key(&self) -> AuthResult<SigningKeyMaterial>;

    /// Returns the public keys tokens may be verified with.
    ///
    /// # Errors
    ///
    /// Returns `KeyManager` if the key set cannot be obtained.
    async fn jwks(&self) -> AuthResult<Jwks>;
}

struct LocalKeys {
    active: SigningKeyPair,
    retired: VecDeque<Jwk>,
}

/// Key Manager that generates and holds keys in this process.
///
/// Retired keys stay published until `retained` newer rotations pushed them
/// out, so tokens signed shortly before a rotation still verify.
pub struct LocalKeyManager {
    algorithm: SigningAlgorithm,
    retained: usize,
    keys: RwLock<LocalKeys>,
}

impl LocalKeyManager {
    /// Creates a manager with a freshly generated active key.
    ///
    /// # Errors
    ///
    /// Returns `KeyManager` if key generation fails.
    pub fn new(algorithm: SigningAlgorithm, retained: usize) -> AuthResult<Self> {
        let active = SigningKeyPair::generate(algorithm)
            .map_err(|e| AuthError::key_manager(e.to_string()))?;
        Ok(Self::with_key(active, retained))
    }

    /// Creates a manager around an existing key.
    #[must_use]
    pub fn with_key(active: SigningKeyPair, retained: usize) -> Self {
        Self {
            algorithm: active.algorithm,
            retained,
            keys: RwLock::new(LocalKeys {
                active,
                retired: VecDeque::new(),
            }),
        }
    }
}

#[async_trait]
impl KeyManager for LocalKeyManager {
    async fn active_signing_key(&self) -> AuthResult<SigningKeyMaterial> {
        Ok(self.keys.read().await.active.to_material())
    }

    async fn rotate_key(&self) -> AuthResult<SigningKeyMaterial> {
        let next = SigningKeyPair::generate(self.algorithm)
            .map_err(|e| AuthError::key_manager(e.to_string()))?;
        let material = next.to_material();

        let mut keys = self.keys.write().await;
        let previous = std::mem::replace(&mut keys.active, next);
        keys.retired.push_front(previous.to_jwk());
        keys.retired.truncate(self.retained);

        tracing::info!(
            kid = %material.kid,
            previous_kid = %previous.kid,
            "Rotated signing key"
        );
        Ok(material)
    }

    async fn jwks(&self) -> AuthResult<Jwks> {
        let keys = self.keys.read().await;
        let mut jwks = Jwks::new();
        jwks.add_key(keys.active.to_jwk());
        for jwk in &keys.retired {
            jwks.add_key(jwk.clone());
        }
        Ok(jwks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rotation_keeps_previous_key_published() {
        let manager = LocalKeyManager::new(SigningAlgorithm::ES384, 1).unwrap();
        let first = manager.active_signing_key().await.unwrap();

        let second = manager.rotate_key().await.unwrap();
        assert_ne!(first.kid, second.kid);

        let jwks = manager.jwks().await.unwrap();
        assert!(jwks.find(Some(&first.kid)).is_some());
        assert!(jwks.find(Some(&second.kid)).is_some());

        // A second rotation pushes the first key out.
        let third = manager.rotate_key().await.unwrap();
        let jwks = manager.jwks().await.unwrap();
        assert!(jwks.find(Some(&first.kid)).is_none());
        assert!(jwks.find(Some(&second.kid)).is_some());
        assert!(jwks.find(Some(&third.kid)).is_some());
    }

    #[tokio::test]
    async fn test_active_key_material_rebuilds() {
        let manager = LocalKeyManager::new(SigningAlgorithm::ES384, 0).unwrap();
        let material = manager.active_signing_key().await.unwrap();
        let pair = SigningKeyPair::from_material(&material).unwrap();
        assert_eq!(pair.kid, material.kid);
    }
}
