//! DPoP sender-constrained tokens.
//!
//! - [`DpopValidator`] - proof validation and JTI replay protection
//! - [`jwk_thumbprint`] - RFC 7638 key thumbprints (`jkt`)

pub mod thumbprint;
pub mod validator;

pub use thumbprint::{ProofJwk, jwk_thumbprint};
pub use validator::{DPOP_JWT_TYPE, DpopProof, DpopValidator};

use crate::error::AuthError;

/// DPoP proof validation failures.
#[derive(Debug, thiserror::Error)]
pub enum DpopError {
    /// The proof is not a well-formed DPoP JWT.
    #[error("malformed proof: {0}")]
    Malformed(String),

    /// The embedded key is missing, private, or unusable.
    #[error("invalid proof key: {0}")]
    MalformedJwk(String),

    /// `none`, HMAC, or an unknown algorithm.
    #[error("unsupported proof algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Signature or claims did not verify.
    #[error("proof verification failed: {0}")]
    InvalidSignature(String),

    /// `htm` differs from the request method.
    #[error("htm '{actual}' does not match {expected}")]
    MethodMismatch {
        /// Request method.
        expected: String,
        /// Method in the proof.
        actual: String,
    },

    /// `htu` differs from the request URL.
    #[error("htu '{actual}' does not match {expected}")]
    UrlMismatch {
        /// Request URL.
        expected: String,
        /// URL in the proof.
        actual: String,
    },

    /// `iat` is older than the allowed proof age.
    #[error("proof is too old")]
    Expired,

    /// `iat` is further in the future than the allowed skew.
    #[error("proof is issued in the future")]
    IssuedInFuture,

    /// The proof's `jti` was already used by this client.
    #[error("proof jti {jti} was already used")]
    Replay {
        /// Replayed identifier.
        jti: String,
    },

    /// The JTI store failed.
    #[error(transparent)]
    Storage(#[from] AuthError),
}

impl DpopError {
    /// Returns `true` for a replayed proof.
    #[must_use]
    pub fn is_replay(&self) -> bool {
        matches!(self, Self::Replay { .. })
    }
}

impl From<DpopError> for AuthError {
    fn from(err: DpopError) -> Self {
        match err {
            DpopError::Storage(inner) => inner,
            // Replays get the same answer as every other replayed credential.
            DpopError::Replay { .. } => AuthError::invalid_grant("Invalid grant"),
            other => AuthError::invalid_dpop_proof(other.to_string()),
        }
    }
}
