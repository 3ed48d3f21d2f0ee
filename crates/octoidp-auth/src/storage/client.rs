//! Client directory.

use async_trait::async_trait;

use crate::AuthResult;
use crate::types::Client;

/// Read access to registered OAuth clients.
///
/// Client CRUD lives elsewhere; the token engine only needs lookups.
#[async_trait]
pub trait ClientDirectory: Send + Sync {
    /// Looks up a client by its `client_id`.
    ///
    /// Returns `None` if the client is not registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be reached.
    async fn get_client(&self, client_id: &str) -> AuthResult<Option<Client>>;
}
