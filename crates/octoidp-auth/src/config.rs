//! Token engine configuration.
//!
//! Every section deserializes with defaults so a configuration file only has
//! to mention what it overrides. Durations use humantime syntax.
//!
//! # Example (TOML)
//!
//! ```toml
//! [auth]
//! issuer = "https://idp.example.com"
//!
//! [auth.tokens]
//! access_token_lifetime = "15m"
//! refresh_token_lifetime = "30d"
//!
//! [auth.sharding]
//! default_code_shards = 32
//! config_cache_ttl = "10s"
//!
//! [auth.admin]
//! secret = "change-me"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::token::{Jwks, SigningAlgorithm};

/// Root configuration of the token engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Issuer identifier placed in the `iss` claim of every token.
    pub issuer: String,

    /// Public URL of the token endpoint.
    ///
    /// Used as the expected DPoP `htu` and as an accepted client-assertion
    /// audience. Defaults to `<issuer>/token`.
    pub token_endpoint: Option<String>,

    /// Token and code lifetimes.
    pub tokens: TokenLifetimes,

    /// Shard topology and actor tuning.
    pub sharding: ShardingConfig,

    /// Key cache configuration.
    pub keys: KeyCacheConfig,

    /// DPoP proof validation.
    pub dpop: DpopConfig,

    /// Client assertion validation.
    pub client_assertion: ClientAssertionSettings,

    /// Claims enrichment.
    pub enrichment: EnrichmentConfig,

    /// Security audit queue.
    pub audit: AuditConfig,

    /// Administrative endpoints.
    pub admin: AdminConfig,

    /// JWT bearer grant (RFC 7523).
    pub jwt_bearer: JwtBearerConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:8080".to_string(),
            token_endpoint: None,
            tokens: TokenLifetimes::default(),
            sharding: ShardingConfig::default(),
            keys: KeyCacheConfig::default(),
            dpop: DpopConfig::default(),
            client_assertion: ClientAssertionSettings::default(),
            enrichment: EnrichmentConfig::default(),
            audit: AuditConfig::default(),
            admin: AdminConfig::default(),
            jwt_bearer: JwtBearerConfig::default(),
        }
    }
}

impl AuthConfig {
    /// Creates a configuration with defaults for the given issuer.
    #[must_use]
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            ..Self::default()
        }
    }

    /// Returns the token endpoint URL, derived from the issuer when unset.
    #[must_use]
    pub fn token_endpoint_url(&self) -> String {
        match &self.token_endpoint {
            Some(url) => url.clone(),
            None => format!("{}/token", self.issuer.trim_end_matches('/')),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid setting.
    pub fn validate(&self) -> Result<(), String> {
        if self.issuer.trim().is_empty() {
            return Err("auth.issuer must not be empty".to_string());
        }
        if self.sharding.default_code_shards == 0 {
            return Err("auth.sharding.default_code_shards must be > 0".to_string());
        }
        if self.sharding.refresh_shard_count == 0 {
            return Err("auth.sharding.refresh_shard_count must be > 0".to_string());
        }
        if self.sharding.actor_mailbox == 0 {
            return Err("auth.sharding.actor_mailbox must be > 0".to_string());
        }
        if self.admin.batch_size == 0 {
            return Err("auth.admin.batch_size must be > 0".to_string());
        }
        if self.audit.queue_capacity == 0 {
            return Err("auth.audit.queue_capacity must be > 0".to_string());
        }
        Ok(())
    }
}

/// Token and authorization code lifetimes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenLifetimes {
    /// Access token lifetime.
    #[serde(with = "humantime_serde")]
    pub access_token_lifetime: Duration,

    /// ID token lifetime.
    #[serde(with = "humantime_serde")]
    pub id_token_lifetime: Duration,

    /// Refresh token family lifetime (absolute, not sliding).
    #[serde(with = "humantime_serde")]
    pub refresh_token_lifetime: Duration,

    /// Authorization code lifetime.
    #[serde(with = "humantime_serde")]
    pub authorization_code_lifetime: Duration,
}

impl Default for TokenLifetimes {
    fn default() -> Self {
        Self {
            access_token_lifetime: Duration::from_secs(3600),
            id_token_lifetime: Duration::from_secs(3600),
            refresh_token_lifetime: Duration::from_secs(30 * 24 * 3600),
            authorization_code_lifetime: Duration::from_secs(60),
        }
    }
}

/// Shard topology defaults and actor tuning.
///
/// The shard counts here are fallbacks: the live values come from the
/// shard config store, then from the environment variables named below.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Authorization code shard count used when neither the store nor the
    /// environment provides one.
    pub default_code_shards: u32,

    /// Refresh token shard count used when the store has no config.
    pub refresh_shard_count: u32,

    /// Refresh token shard generation used when the store has no config.
    pub refresh_generation: u32,

    /// How long a fetched shard config snapshot is served before refetching.
    #[serde(with = "humantime_serde")]
    pub config_cache_ttl: Duration,

    /// Environment variable consulted for the code shard count.
    pub code_shards_env: String,

    /// Environment variable consulted for the refresh shard count.
    pub refresh_shards_env: String,

    /// Extra time consumed code metadata is kept after the code TTL.
    #[serde(with = "humantime_serde")]
    pub consumed_code_grace: Duration,

    /// Upper bound for a single actor call.
    #[serde(with = "humantime_serde")]
    pub actor_timeout: Duration,

    /// Interval between actor sweeps of expired entries.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Bounded mailbox size per actor.
    pub actor_mailbox: usize,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            default_code_shards: 16,
            refresh_shard_count: 8,
            refresh_generation: 1,
            config_cache_ttl: Duration::from_secs(10),
            code_shards_env: "OCTOIDP_CODE_SHARDS".to_string(),
            refresh_shards_env: "OCTOIDP_REFRESH_SHARDS".to_string(),
            consumed_code_grace: Duration::from_secs(300),
            actor_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            actor_mailbox: 256,
        }
    }
}

/// Key cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeyCacheConfig {
    /// How long the active signing key is cached.
    #[serde(with = "humantime_serde")]
    pub signing_key_ttl: Duration,

    /// How long the verification key set is cached.
    #[serde(with = "humantime_serde")]
    pub jwks_ttl: Duration,

    /// Algorithm used by the local Key Manager when generating keys.
    pub algorithm: SigningAlgorithm,

    /// Number of retired keys the local Key Manager keeps publishing.
    pub retained_keys: usize,

    /// Base URL of a remote Key Manager. The local one is used when unset.
    pub url: Option<String>,

    /// Bearer secret for the remote Key Manager.
    pub secret: Option<String>,

    /// Request timeout for the remote Key Manager.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self {
            signing_key_ttl: Duration::from_secs(600),
            jwks_ttl: Duration::from_secs(300),
            algorithm: SigningAlgorithm::ES384,
            retained_keys: 2,
            url: None,
            secret: None,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// DPoP proof validation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DpopConfig {
    /// Maximum age of a proof's `iat`.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,

    /// Tolerated clock skew for proofs issued in the future.
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
}

impl Default for DpopConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(60),
            clock_skew: Duration::from_secs(10),
        }
    }
}

/// Client assertion validation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientAssertionSettings {
    /// Maximum distance between now and an assertion's `exp`.
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Duration,
}

impl Default for ClientAssertionSettings {
    fn default() -> Self {
        Self {
            max_lifetime: Duration::from_secs(300),
        }
    }
}

/// Claims enrichment settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Upper bound on the enrichment call; exceeding it skips enrichment.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
        }
    }
}

/// Audit queue settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Bounded queue capacity. Events beyond it are dropped and counted.
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

/// Administrative endpoint settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer secret. The admin endpoints reject every request when unset.
    pub secret: Option<String>,

    /// Default number of shards touched concurrently per batch.
    pub batch_size: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            secret: None,
            batch_size: 16,
        }
    }
}

/// JWT bearer grant settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct JwtBearerConfig {
    /// Issuers whose assertions are accepted.
    pub trusted_issuers: Vec<TrustedIssuer>,
}

/// An issuer trusted to assert end-user identities.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrustedIssuer {
    /// Expected `iss` claim.
    pub issuer: String,

    /// Public keys used to verify the issuer's assertions.
    pub jwks: Jwks,

    /// Scopes the issuer may obtain. Empty means any scope.
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AuthConfig::default();
        assert_eq!(config.keys.signing_key_ttl, Duration::from_secs(600));
        assert_eq!(config.keys.jwks_ttl, Duration::from_secs(300));
        assert_eq!(config.sharding.config_cache_ttl, Duration::from_secs(10));
        assert!(config.admin.secret.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_token_endpoint_derived_from_issuer() {
        let config = AuthConfig::new("https://idp.example.com/");
        assert_eq!(
            config.token_endpoint_url(),
            "https://idp.example.com/token"
        );

        let config = AuthConfig {
            token_endpoint: Some("https://edge.example.com/oauth/token".to_string()),
            ..AuthConfig::new("https://idp.example.com")
        };
        assert_eq!(
            config.token_endpoint_url(),
            "https://edge.example.com/oauth/token"
        );
    }

    #[test]
    fn test_validate_rejects_zero_shards() {
        let mut config = AuthConfig::default();
        config.sharding.default_code_shards = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_humantime_durations() {
        let json = r#"{"max_age": "2m", "clock_skew": "5s"}"#;
        let dpop: DpopConfig = serde_json::from_str(json).unwrap();
        assert_eq!(dpop.max_age, Duration::from_secs(120));
        assert_eq!(dpop.clock_skew, Duration::from_secs(5));
    }
}
