//! Token engine error types.
//!
//! This module defines the error type shared by every component of the
//! token issuance and rotation engine, together with its mapping onto the
//! OAuth 2.0 error codes returned by the token endpoint.

use std::fmt;

/// Errors that can occur while issuing, rotating or validating tokens.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The request is missing a parameter, repeats one, or is otherwise malformed.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of why the request is invalid.
        message: String,
    },

    /// Client authentication failed.
    #[error("Invalid client: {message}")]
    InvalidClient {
        /// Description of why the client is invalid.
        message: String,
    },

    /// The grant (code, refresh token, assertion, device code) is invalid,
    /// expired, revoked, replayed or bound to a different context.
    #[error("Invalid grant: {message}")]
    InvalidGrant {
        /// Description of why the grant is invalid.
        message: String,
    },

    /// The authenticated client is not registered for this grant type.
    #[error("Unauthorized client: {message}")]
    UnauthorizedClient {
        /// Description of why the client may not use the grant.
        message: String,
    },

    /// The grant type is not supported by this server.
    #[error("Unsupported grant type: {grant_type}")]
    UnsupportedGrantType {
        /// The unsupported grant type.
        grant_type: String,
    },

    /// The requested scope is invalid or exceeds the granted scope.
    #[error("Invalid scope: {message}")]
    InvalidScope {
        /// Description of why the scope is invalid.
        message: String,
    },

    /// The DPoP proof is malformed, stale, replayed or fails verification.
    #[error("Invalid DPoP proof: {message}")]
    InvalidDpopProof {
        /// Description of why the proof was rejected.
        message: String,
    },

    /// The end user has not yet completed a device or CIBA authorization.
    #[error("Authorization pending")]
    AuthorizationPending,

    /// The client is polling faster than the advertised interval.
    #[error("Slow down")]
    SlowDown,

    /// The device code or CIBA request expired before it was approved.
    #[error("Expired token: {message}")]
    ExpiredToken {
        /// Description of what expired.
        message: String,
    },

    /// The end user denied the device or CIBA authorization.
    #[error("Access denied: {message}")]
    AccessDenied {
        /// Description of why access was denied.
        message: String,
    },

    /// A verification key could not be found even after refetching the JWKS.
    ///
    /// This is never retried: the key was removed by the Key Manager.
    #[error("Signing key revoked: {kid}")]
    KeyRevoked {
        /// The key ID that could not be resolved.
        kid: String,
    },

    /// The Key Manager could not be reached or returned an error.
    #[error("Key manager error: {message}")]
    KeyManager {
        /// Description of the failure.
        message: String,
    },

    /// A shard actor or backing store failed, timed out, or is unavailable.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// The engine configuration or key material is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidClient` error.
    #[must_use]
    pub fn invalid_client(message: impl Into<String>) -> Self {
        Self::InvalidClient {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidGrant` error.
    #[must_use]
    pub fn invalid_grant(message: impl Into<String>) -> Self {
        Self::InvalidGrant {
            message: message.into(),
        }
    }

    /// Creates a new `UnauthorizedClient` error.
    #[must_use]
    pub fn unauthorized_client(message: impl Into<String>) -> Self {
        Self::UnauthorizedClient {
            message: message.into(),
        }
    }

    /// Creates a new `UnsupportedGrantType` error.
    #[must_use]
    pub fn unsupported_grant_type(grant_type: impl Into<String>) -> Self {
        Self::UnsupportedGrantType {
            grant_type: grant_type.into(),
        }
    }

    /// Creates a new `InvalidScope` error.
    #[must_use]
    pub fn invalid_scope(message: impl Into<String>) -> Self {
        Self::InvalidScope {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidDpopProof` error.
    #[must_use]
    pub fn invalid_dpop_proof(message: impl Into<String>) -> Self {
        Self::InvalidDpopProof {
            message: message.into(),
        }
    }

    /// Creates a new `ExpiredToken` error.
    #[must_use]
    pub fn expired_token(message: impl Into<String>) -> Self {
        Self::ExpiredToken {
            message: message.into(),
        }
    }

    /// Creates a new `AccessDenied` error.
    #[must_use]
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied {
            message: message.into(),
        }
    }

    /// Creates a new `KeyRevoked` error.
    #[must_use]
    pub fn key_revoked(kid: impl Into<String>) -> Self {
        Self::KeyRevoked { kid: kid.into() }
    }

    /// Creates a new `KeyManager` error.
    #[must_use]
    pub fn key_manager(message: impl Into<String>) -> Self {
        Self::KeyManager {
            message: message.into(),
        }
    }

    /// Creates a new `Storage` error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this error was caused by the caller.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        !self.is_server_error()
    }

    /// Returns `true` if this error was caused by the server or its dependencies.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::KeyManager { .. }
                | Self::Storage { .. }
                | Self::Configuration { .. }
                | Self::Internal { .. }
        )
    }

    /// Returns the error category.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidRequest { .. }
            | Self::UnsupportedGrantType { .. }
            | Self::InvalidScope { .. } => ErrorCategory::Request,
            Self::InvalidClient { .. } | Self::UnauthorizedClient { .. } => {
                ErrorCategory::Client
            }
            Self::InvalidGrant { .. }
            | Self::InvalidDpopProof { .. }
            | Self::KeyRevoked { .. } => ErrorCategory::Grant,
            Self::AuthorizationPending
            | Self::SlowDown
            | Self::ExpiredToken { .. }
            | Self::AccessDenied { .. } => ErrorCategory::Polling,
            Self::KeyManager { .. } | Self::Storage { .. } => ErrorCategory::Infrastructure,
            Self::Configuration { .. } | Self::Internal { .. } => ErrorCategory::Server,
        }
    }

    /// Returns the OAuth 2.0 error code for this error.
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::InvalidClient { .. } => "invalid_client",
            Self::InvalidGrant { .. } | Self::KeyRevoked { .. } => "invalid_grant",
            Self::UnauthorizedClient { .. } => "unauthorized_client",
            Self::UnsupportedGrantType { .. } => "unsupported_grant_type",
            Self::InvalidScope { .. } => "invalid_scope",
            Self::InvalidDpopProof { .. } => "invalid_dpop_proof",
            Self::AuthorizationPending => "authorization_pending",
            Self::SlowDown => "slow_down",
            Self::ExpiredToken { .. } => "expired_token",
            Self::AccessDenied { .. } => "access_denied",
            Self::KeyManager { .. }
            | Self::Storage { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => "server_error",
        }
    }
}

/// Error categories for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or unsupported request.
    Request,
    /// Client authentication or authorization failure.
    Client,
    /// Rejected grant, including replay and theft.
    Grant,
    /// Device or CIBA polling state.
    Polling,
    /// Key Manager or shard actor failure.
    Infrastructure,
    /// Configuration or internal failure.
    Server,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Client => write!(f, "client"),
            Self::Grant => write!(f, "grant"),
            Self::Polling => write!(f, "polling"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Server => write!(f, "server"),
        }
    }
}
