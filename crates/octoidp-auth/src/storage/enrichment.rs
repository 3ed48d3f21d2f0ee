//! Optional claims enrichment (roles, entitlements).

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::AuthResult;

/// Supplies extra claims for issued access and ID tokens.
///
/// Enrichment is best-effort: the orchestrator bounds the call with a
/// timeout and issues tokens without the extra claims when it fails.
#[async_trait]
pub trait ClaimsEnricher: Send + Sync {
    /// Returns claims to merge into the tokens for this subject and client.
    ///
    /// # Errors
    ///
    /// Returns an error if the enrichment source is unavailable.
    async fn enrich(
        &self,
        subject: &str,
        client_id: &str,
        scope: &str,
    ) -> AuthResult<Map<String, Value>>;
}
