//! Authorization code records.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::oauth::PkceChallengeMethod;

/// Input for minting a new authorization code.
///
/// Produced by the authorization endpoint once the end user has
/// authenticated and consented.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAuthorizationCode {
    /// Client the code is issued to.
    pub client_id: String,

    /// Authenticated end user.
    pub subject: String,

    /// Redirect URI used in the authorization request.
    pub redirect_uri: String,

    /// Granted scope.
    pub scope: String,

    /// OpenID Connect nonce.
    #[serde(default)]
    pub nonce: Option<String>,

    /// Client state.
    #[serde(default)]
    pub state: Option<String>,

    /// PKCE challenge.
    #[serde(default)]
    pub code_challenge: Option<String>,

    /// PKCE challenge method.
    #[serde(default)]
    pub code_challenge_method: Option<PkceChallengeMethod>,

    /// Thumbprint of the DPoP key the code is bound to (`dpop_jkt`).
    #[serde(default)]
    pub dpop_jkt: Option<String>,

    /// OpenID Connect `claims` request.
    #[serde(default)]
    pub claims: Option<serde_json::Value>,

    /// End-user authentication time (Unix timestamp).
    #[serde(default)]
    pub auth_time: Option<i64>,

    /// Authentication context class reference.
    #[serde(default)]
    pub acr: Option<String>,
}

/// An authorization code held by its shard actor.
#[derive(Debug, Clone)]
pub struct AuthorizationCode {
    /// Opaque code value (`{shard}_{secret}`).
    pub code: String,

    /// Grant data captured at the authorization endpoint.
    pub grant: NewAuthorizationCode,

    /// When the code was minted.
    pub created_at: OffsetDateTime,

    /// When the code stops being redeemable.
    pub expires_at: OffsetDateTime,
}

impl AuthorizationCode {
    /// Returns `true` if the code can no longer be redeemed.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}
