//! Shard routing.
//!
//! Pure functions mapping routing keys to shard indices, plus the two
//! identifier formats that embed a shard address:
//!
//! - authorization codes: `{shard}_{secret}`
//! - refresh token JTIs: `v{generation}_{shard}_{random}`
//!
//! A code minted while there were more shards than there are now is folded
//! back into range with [`remap_shard_index`]. Several original shards then
//! share one actor; this is accepted in exchange for codes staying
//! redeemable across a scale-down.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

/// Number of random bytes in an authorization code secret.
const CODE_SECRET_BYTES: usize = 32;

/// Number of random bytes in the random part of a refresh token JTI.
const JTI_RANDOM_BYTES: usize = 16;

/// Maps a routing key to a shard index in `[0, shard_count)`.
///
/// SHA-256 of the key, first four bytes big-endian, modulo the count.
/// A count of zero is treated as one.
#[must_use]
pub fn shard_index(routing_key: &str, shard_count: u32) -> u32 {
    let count = shard_count.max(1);
    let digest = Sha256::digest(routing_key.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % count
}

/// Folds an index minted under an older shard count into the current range.
///
/// Total and idempotent: the result is always in `[0, current_count)` and
/// remapping a remapped index returns it unchanged. A count of zero is
/// treated as one.
#[must_use]
pub fn remap_shard_index(original: u32, current_count: u32) -> u32 {
    original % current_count.max(1)
}

/// Builds the routing key for a (user, client) pair.
#[must_use]
pub fn routing_key(user_id: &str, client_id: &str) -> String {
    format!("{user_id}:{client_id}")
}

fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Error returned when an identifier does not carry a valid shard address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Malformed {kind}: {value}")]
pub struct ShardAddressError {
    kind: &'static str,
    value: String,
}

impl ShardAddressError {
    fn new(kind: &'static str, value: &str) -> Self {
        // Never echo a full secret back.
        let value = value.chars().take(12).collect();
        Self { kind, value }
    }
}

// =============================================================================
// Authorization Code
// =============================================================================

/// An authorization code value: `{shard}_{secret}`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AuthorizationCodeValue {
    shard: u32,
    secret: String,
}

impl AuthorizationCodeValue {
    /// Mints a fresh code for the given shard.
    #[must_use]
    pub fn generate(shard: u32) -> Self {
        Self {
            shard,
            secret: random_urlsafe(CODE_SECRET_BYTES),
        }
    }

    /// Returns the shard index the code was minted on.
    #[must_use]
    pub fn shard(&self) -> u32 {
        self.shard
    }
}

impl fmt::Display for AuthorizationCodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.shard, self.secret)
    }
}

impl fmt::Debug for AuthorizationCodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationCodeValue")
            .field("shard", &self.shard)
            .finish_non_exhaustive()
    }
}

impl FromStr for AuthorizationCodeValue {
    type Err = ShardAddressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let err = || ShardAddressError::new("authorization code", value);
        let (shard, secret) = value.split_once('_').ok_or_else(err)?;
        if secret.is_empty() {
            return Err(err());
        }
        let shard = shard.parse().map_err(|_| err())?;
        Ok(Self {
            shard,
            secret: secret.to_string(),
        })
    }
}

// =============================================================================
// Refresh Token JTI
// =============================================================================

/// A refresh token JTI: `v{generation}_{shard}_{random}`.
///
/// Rotation always re-addresses the generation and shard encoded here, even
/// when the live topology has moved on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefreshTokenJti {
    generation: u32,
    shard: u32,
    random: String,
}

impl RefreshTokenJti {
    /// Mints a fresh JTI on the given generation and shard.
    #[must_use]
    pub fn generate(generation: u32, shard: u32) -> Self {
        Self {
            generation,
            shard,
            random: random_urlsafe(JTI_RANDOM_BYTES),
        }
    }

    /// Mints a new JTI on the same generation and shard.
    #[must_use]
    pub fn regenerate(&self) -> Self {
        Self::generate(self.generation, self.shard)
    }

    /// Returns the shard generation.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Returns the shard index.
    #[must_use]
    pub fn shard(&self) -> u32 {
        self.shard
    }
}

impl fmt::Display for RefreshTokenJti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}_{}_{}", self.generation, self.shard, self.random)
    }
}

impl FromStr for RefreshTokenJti {
    type Err = ShardAddressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let err = || ShardAddressError::new("refresh token jti", value);
        let rest = value.strip_prefix('v').ok_or_else(err)?;
        let mut parts = rest.splitn(3, '_');
        let (Some(generation), Some(shard), Some(random)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(err());
        };
        if random.is_empty() {
            return Err(err());
        }
        Ok(Self {
            generation: generation.parse().map_err(|_| err())?,
            shard: shard.parse().map_err(|_| err())?,
            random: random.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_index_is_deterministic_and_in_range() {
        for count in [1, 2, 7, 16, 1000] {
            let a = shard_index("user-1:app", count);
            assert_eq!(a, shard_index("user-1:app", count));
            assert!(a < count);
        }
    }

    #[test]
    fn test_shard_index_zero_count() {
        assert_eq!(shard_index("anything", 0), 0);
    }

    #[test]
    fn test_shard_index_spreads_keys() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            seen.insert(shard_index(&routing_key(&format!("user-{i}"), "app"), 8));
        }
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn test_remap_is_total_and_idempotent() {
        for original in [0, 1, 5, 15, 31, 1023, u32::MAX] {
            for count in [1, 2, 3, 8, 16, 1000] {
                let once = remap_shard_index(original, count);
                assert!(once < count);
                assert_eq!(remap_shard_index(once, count), once);
            }
        }
        assert_eq!(remap_shard_index(9, 0), 0);
    }

    #[test]
    fn test_remap_keeps_in_range_indices() {
        assert_eq!(remap_shard_index(3, 16), 3);
        assert_eq!(remap_shard_index(12, 8), 4);
    }

    #[test]
    fn test_authorization_code_format() {
        let code = AuthorizationCodeValue::generate(12);
        let text = code.to_string();
        assert!(text.starts_with("12_"));
        // 32 bytes base64url without padding
        assert_eq!(text.len(), "12_".len() + 43);

        let parsed: AuthorizationCodeValue = text.parse().unwrap();
        assert_eq!(parsed, code);
        assert_eq!(parsed.shard(), 12);
    }

    #[test]
    fn test_authorization_code_rejects_malformed() {
        assert!("nounderscore".parse::<AuthorizationCodeValue>().is_err());
        assert!("x_secret".parse::<AuthorizationCodeValue>().is_err());
        assert!("3_".parse::<AuthorizationCodeValue>().is_err());
    }

    #[test]
    fn test_refresh_jti_format() {
        let jti = RefreshTokenJti::generate(2, 5);
        let text = jti.to_string();
        assert!(text.starts_with("v2_5_"));

        let parsed: RefreshTokenJti = text.parse().unwrap();
        assert_eq!(parsed.generation(), 2);
        assert_eq!(parsed.shard(), 5);

        let next = parsed.regenerate();
        assert_eq!((next.generation(), next.shard()), (2, 5));
        assert_ne!(next, parsed);
    }

    #[test]
    fn test_refresh_jti_random_part_may_contain_underscore() {
        let parsed: RefreshTokenJti = "v1_0_ab_cd".parse().unwrap();
        assert_eq!(parsed.to_string(), "v1_0_ab_cd");
    }

    #[test]
    fn test_refresh_jti_rejects_malformed() {
        for bad in ["1_2_x", "v1_2", "vx_2_y", "v1_y_z", "v1_2_"] {
            assert!(bad.parse::<RefreshTokenJti>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_error_truncates_value() {
        let err = "nounderscore-and-a-long-secret"
            .parse::<AuthorizationCodeValue>()
            .unwrap_err();
        assert!(!err.to_string().contains("long-secret"));
    }
}
