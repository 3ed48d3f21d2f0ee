//! # octoidp-auth
//!
//! Token issuance and rotation engine of the OctoIdP authorization server.
//!
//! This crate provides:
//! - The `/token` endpoint for five grant types
//! - Sharded, single-use authorization codes with replay revocation
//! - Refresh token rotation with theft detection
//! - DPoP (RFC 9449) proof validation and token binding
//! - A cached view of the Key Manager's signing keys
//! - Non-blocking security event auditing
//!
//! ## Modules
//!
//! - [`config`] - Engine configuration
//! - [`grant`] - Token request orchestration and grant flows
//! - [`shard`] - Authorization code and refresh token shard actors
//! - [`keys`] - Key Manager client and key cache
//! - [`token`] - JWT claims, signing keys and minting
//! - [`dpop`] - DPoP proof validation
//! - [`oauth`] - Token endpoint wire types, PKCE and client authentication
//! - [`storage`] - Storage traits and in-memory implementations
//! - [`audit`] - Security event queue
//! - [`http`] - Axum handlers

pub mod audit;
pub mod config;
pub mod dpop;
pub mod error;
pub mod grant;
pub mod http;
pub mod keys;
pub mod oauth;
pub mod shard;
pub mod storage;
pub mod token;
pub mod types;

pub use config::AuthConfig;
pub use error::{AuthError, ErrorCategory};
pub use grant::{GrantDependencies, GrantOrchestrator, TokenEndpointRequest};
pub use http::{AdminState, TokenState, routes};
pub use types::{Client, GrantType, Scope};

/// Type alias for authentication/authorization results.
pub type AuthResult<T> = Result<T, AuthError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use octoidp_auth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::AuthResult;
    pub use crate::audit::{AuditQueue, AuditSink, SecurityEvent, SecurityEventKind};
    pub use crate::config::AuthConfig;
    pub use crate::error::{AuthError, ErrorCategory};
    pub use crate::grant::{GrantDependencies, GrantOrchestrator, TokenEndpointRequest};
    pub use crate::http::{AdminState, TokenState, routes};
    pub use crate::keys::{KeyCache, KeyManager};
    pub use crate::oauth::{TokenRequest, TokenResponse, TokenType};
    pub use crate::shard::{
        AuthorizationCodeStore, RefreshTokenFamilyStore, ShardConfigCache, ShardConfigStore,
        ShardedCodeStore, ShardedRefreshStore,
    };
    pub use crate::storage::{ClientDirectory, JtiStorage, RevokedTokenStorage};
    pub use crate::types::{Client, GrantType, Scope};
}
