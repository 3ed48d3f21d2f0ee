//! Pending end-user authorizations polled by device and CIBA clients.
//!
//! The device authorization endpoint (RFC 8628) and the backchannel
//! authentication endpoint (CIBA) create these records; the user approves or
//! denies them out of band. The token endpoint only polls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::AuthResult;

/// A completed end-user approval, handed out exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovedGrant {
    /// Authenticated end user.
    pub subject: String,

    /// Approved scope.
    pub scope: String,

    /// End-user authentication time (Unix timestamp).
    #[serde(default)]
    pub auth_time: Option<i64>,

    /// Authentication context class reference.
    #[serde(default)]
    pub acr: Option<String>,

    /// Thumbprint of the DPoP key the request was bound to.
    #[serde(default)]
    pub dpop_jkt: Option<String>,
}

/// Result of polling a pending authorization.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The user approved; the record is now consumed.
    Approved(ApprovedGrant),
    /// The user has not acted yet.
    Pending,
    /// The client polled faster than the allowed interval.
    SlowDown,
    /// The user denied the request.
    Denied,
    /// The request expired.
    Expired,
    /// Unknown identifier, already consumed, or issued to another client.
    NotFound,
}

/// Device authorization records (RFC 8628).
#[async_trait]
pub trait DeviceCodeStorage: Send + Sync {
    /// Polls a device code on behalf of `client_id`.
    ///
    /// Must atomically hand out an approval at most once and record the poll
    /// time for `slow_down` detection.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn poll_device_code(&self, device_code: &str, client_id: &str)
    -> AuthResult<PollOutcome>;
}

/// Backchannel authentication requests (CIBA poll mode).
#[async_trait]
pub trait CibaRequestStorage: Send + Sync {
    /// Polls an `auth_req_id` on behalf of `client_id`.
    ///
    /// Same atomicity requirements as [`DeviceCodeStorage::poll_device_code`].
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn poll_ciba_request(&self, auth_req_id: &str, client_id: &str)
    -> AuthResult<PollOutcome>;
}
