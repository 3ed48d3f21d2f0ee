//! Collaborator interfaces consumed by the token engine.
//!
//! - [`ClientDirectory`] - client lookups
//! - [`JtiStorage`] - one-time JTI markers (DPoP, assertions)
//! - [`RevokedTokenStorage`] - access token deny-list
//! - [`DeviceCodeStorage`] / [`CibaRequestStorage`] - pending approvals
//! - [`ClaimsEnricher`] - best-effort extra claims
//!
//! [`memory`] holds `DashMap`-backed implementations used by single-node
//! deployments and tests.

pub mod client;
pub mod enrichment;
pub mod jti;
pub mod memory;
pub mod pending;
pub mod revoked_token;

pub use client::ClientDirectory;
pub use enrichment::ClaimsEnricher;
pub use jti::JtiStorage;
pub use memory::{
    InMemoryClientDirectory, InMemoryJtiStorage, InMemoryPendingAuthorizations,
    InMemoryRevokedTokenStorage, StaticClaimsEnricher,
};
pub use pending::{ApprovedGrant, CibaRequestStorage, DeviceCodeStorage, PollOutcome};
pub use revoked_token::RevokedTokenStorage;
