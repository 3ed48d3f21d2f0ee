//! In-memory collaborator implementations.
//!
//! Every per-key operation goes through `DashMap`'s entry API, which holds the
//! shard lock for the duration of the read-modify-write. That gives the
//! single-writer-per-key behaviour the traits require within one process.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::AuthResult;
use crate::storage::{
    ApprovedGrant, CibaRequestStorage, ClaimsEnricher, ClientDirectory, DeviceCodeStorage,
    JtiStorage, PollOutcome, RevokedTokenStorage,
};
use crate::types::Client;

// =============================================================================
// Clients
// =============================================================================

/// Client directory backed by a map, seeded from configuration.
#[derive(Debug, Default)]
pub struct InMemoryClientDirectory {
    clients: DashMap<String, Client>,
}

impl InMemoryClientDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a directory holding the given clients.
    #[must_use]
    pub fn with_clients(clients: impl IntoIterator<Item = Client>) -> Self {
        let directory = Self::new();
        for client in clients {
            directory.insert(client);
        }
        directory
    }

    /// Adds or replaces a client.
    pub fn insert(&self, client: Client) {
        self.clients.insert(client.client_id.clone(), client);
    }
}

#[async_trait]
impl ClientDirectory for InMemoryClientDirectory {
    async fn get_client(&self, client_id: &str) -> AuthResult<Option<Client>> {
        Ok(self.clients.get(client_id).map(|c| c.value().clone()))
    }
}

// =============================================================================
// JTI markers
// =============================================================================

/// One-time JTI markers.
#[derive(Debug, Default)]
pub struct InMemoryJtiStorage {
    used: DashMap<String, OffsetDateTime>,
}

impl InMemoryJtiStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JtiStorage for InMemoryJtiStorage {
    async fn mark_used(&self, key: &str, expires_at: OffsetDateTime) -> AuthResult<bool> {
        let now = OffsetDateTime::now_utc();
        match self.used.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    return Ok(false);
                }
                // Expired marker: the key is reusable.
                entry.insert(expires_at);
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(expires_at);
                Ok(true)
            }
        }
    }

    async fn is_used(&self, key: &str) -> AuthResult<bool> {
        let now = OffsetDateTime::now_utc();
        Ok(self.used.get(key).is_some_and(|exp| *exp > now))
    }

    async fn cleanup_expired(&self) -> AuthResult<u64> {
        let now = OffsetDateTime::now_utc();
        let before = self.used.len();
        self.used.retain(|_, exp| *exp > now);
        Ok(before.saturating_sub(self.used.len()) as u64)
    }
}

// =============================================================================
// Revoked access tokens
// =============================================================================

/// Access token deny-list.
#[derive(Debug, Default)]
pub struct InMemoryRevokedTokenStorage {
    revoked: DashMap<String, OffsetDateTime>,
}

impl InMemoryRevokedTokenStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RevokedTokenStorage for InMemoryRevokedTokenStorage {
    async fn revoke(&self, jti: &str, expires_at: OffsetDateTime) -> AuthResult<()> {
        self.revoked.insert(jti.to_string(), expires_at);
        Ok(())
    }

    async fn is_revoked(&self, jti: &str) -> AuthResult<bool> {
        Ok(self.revoked.contains_key(jti))
    }

    async fn cleanup_expired(&self) -> AuthResult<u64> {
        let now = OffsetDateTime::now_utc();
        let before = self.revoked.len();
        self.revoked.retain(|_, exp| *exp > now);
        Ok(before.saturating_sub(self.revoked.len()) as u64)
    }
}

// =============================================================================
// Device and CIBA approvals
// =============================================================================

/// RFC 8628 §3.5: each `slow_down` raises the interval by five seconds.
const SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum PendingStatus {
    Pending,
    Approved(ApprovedGrant),
    Denied,
}

#[derive(Debug, Clone)]
struct PendingRecord {
    client_id: String,
    status: PendingStatus,
    expires_at: OffsetDateTime,
    interval: Duration,
    last_polled_at: Option<OffsetDateTime>,
}

/// Pending device and CIBA authorizations.
#[derive(Debug, Default)]
pub struct InMemoryPendingAuthorizations {
    device: DashMap<String, PendingRecord>,
    ciba: DashMap<String, PendingRecord>,
}

impl InMemoryPendingAuthorizations {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device code awaiting user approval.
    pub fn create_device_code(
        &self,
        device_code: impl Into<String>,
        client_id: impl Into<String>,
        lifetime: Duration,
        interval: Duration,
    ) {
        self.device
            .insert(device_code.into(), Self::record(client_id, lifetime, interval));
    }

    /// Registers a CIBA request awaiting user approval.
    pub fn create_ciba_request(
        &self,
        auth_req_id: impl Into<String>,
        client_id: impl Into<String>,
        lifetime: Duration,
        interval: Duration,
    ) {
        self.ciba
            .insert(auth_req_id.into(), Self::record(client_id, lifetime, interval));
    }

    /// Records the user's approval of a device code. Returns `false` if unknown.
    pub fn approve_device_code(&self, device_code: &str, grant: ApprovedGrant) -> bool {
        Self::set_status(&self.device, device_code, PendingStatus::Approved(grant))
    }

    /// Records the user's denial of a device code. Returns `false` if unknown.
    pub fn deny_device_code(&self, device_code: &str) -> bool {
        Self::set_status(&self.device, device_code, PendingStatus::Denied)
    }

    /// Records the user's approval of a CIBA request. Returns `false` if unknown.
    pub fn approve_ciba_request(&self, auth_req_id: &str, grant: ApprovedGrant) -> bool {
        Self::set_status(&self.ciba, auth_req_id, PendingStatus::Approved(grant))
    }

    /// Records the user's denial of a CIBA request. Returns `false` if unknown.
    pub fn deny_ciba_request(&self, auth_req_id: &str) -> bool {
        Self::set_status(&self.ciba, auth_req_id, PendingStatus::Denied)
    }

    fn record(client_id: impl Into<String>, lifetime: Duration, interval: Duration) -> PendingRecord {
        PendingRecord {
            client_id: client_id.into(),
            status: PendingStatus::Pending,
            expires_at: OffsetDateTime::now_utc() + lifetime,
            interval,
            last_polled_at: None,
        }
    }

    fn set_status(map: &DashMap<String, PendingRecord>, id: &str, status: PendingStatus) -> bool {
        match map.get_mut(id) {
            Some(mut record) => {
                record.status = status;
                true
            }
            None => false,
        }
    }

    fn poll(map: &DashMap<String, PendingRecord>, id: &str, client_id: &str) -> PollOutcome {
        let now = OffsetDateTime::now_utc();
        let Entry::Occupied(mut entry) = map.entry(id.to_string()) else {
            return PollOutcome::NotFound;
        };

        if entry.get().client_id != client_id {
            return PollOutcome::NotFound;
        }
        if entry.get().expires_at <= now {
            entry.remove();
            return PollOutcome::Expired;
        }

        let record = entry.get_mut();
        if let Some(last) = record.last_polled_at
            && now - last < record.interval
        {
            record.interval += SLOW_DOWN_INCREMENT;
            record.last_polled_at = Some(now);
            return PollOutcome::SlowDown;
        }
        record.last_polled_at = Some(now);

        match &record.status {
            PendingStatus::Pending => PollOutcome::Pending,
            PendingStatus::Denied => {
                entry.remove();
                PollOutcome::Denied
            }
            PendingStatus::Approved(_) => match entry.remove().status {
                PendingStatus::Approved(grant) => PollOutcome::Approved(grant),
                _ => PollOutcome::NotFound,
            },
        }
    }
}

#[async_trait]
impl DeviceCodeStorage for InMemoryPendingAuthorizations {
    async fn poll_device_code(
        &self,
        device_code: &str,
        client_id: &str,
    ) -> AuthResult<PollOutcome> {
        Ok(Self::poll(&self.device, device_code, client_id))
    }
}

#[async_trait]
impl CibaRequestStorage for InMemoryPendingAuthorizations {
    async fn poll_ciba_request(
        &self,
        auth_req_id: &str,
        client_id: &str,
    ) -> AuthResult<PollOutcome> {
        Ok(Self::poll(&self.ciba, auth_req_id, client_id))
    }
}

// =============================================================================
// Claims enrichment
// =============================================================================

/// Enricher serving fixed claims per subject.
#[derive(Debug, Default)]
pub struct StaticClaimsEnricher {
    claims: DashMap<String, Map<String, Value>>,
}

impl StaticClaimsEnricher {
    /// Creates an enricher with no claims.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the claims returned for a subject.
    pub fn set_claims(&self, subject: impl Into<String>, claims: Map<String, Value>) {
        self.claims.insert(subject.into(), claims);
    }
}

#[async_trait]
impl ClaimsEnricher for StaticClaimsEnricher {
    async fn enrich(
        &self,
        subject: &str,
        _client_id: &str,
        _scope: &str,
    ) -> AuthResult<Map<String, Value>> {
        Ok(self
            .claims
            .get(subject)
            .map(|c| c.value().clone())
            .unwrap_or_default())
    }
}
