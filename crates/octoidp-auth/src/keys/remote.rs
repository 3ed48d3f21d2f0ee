//! HTTP client for a remote Key Manager.
//!
//! The remote service exposes three routes under its base URL:
//!
//! | Route             | Method | Body                   |
//! |-------------------|--------|------------------------|
//! | `/keys/active`    | GET    | [`SigningKeyMaterial`] |
//! | `/keys/rotate`    | POST   | [`SigningKeyMaterial`] |
//! | `/keys/jwks`      | GET    | [`Jwks`]               |
//!
//! Every request carries `Authorization: Bearer <secret>` when a secret is
//! configured.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use url::Url;

use crate::AuthResult;
use crate::error::AuthError;
use crate::keys::KeyManager;
use crate::token::{Jwks, SigningKeyMaterial};

/// [`KeyManager`] backed by a remote HTTP service.
pub struct HttpKeyManager {
    http_client: reqwest::Client,
    base_url: Url,
    secret: Option<String>,
}

impl HttpKeyManager {
    /// Creates a client for the Key Manager at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the URL is invalid or the HTTP client
    /// cannot be built.
    pub fn new(base_url: &str, secret: Option<String>, timeout: Duration) -> AuthResult<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| AuthError::configuration(format!("Invalid Key Manager URL: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url,
            secret,
        })
    }

    fn endpoint(&self, path: &str) -> AuthResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| AuthError::configuration(format!("Invalid Key Manager path: {e}")))
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> AuthResult<T> {
        let request = match &self.secret {
            Some(secret) => request.bearer_auth(secret),
            None => request,
        };

        let response = request
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Key Manager request failed");
                AuthError::key_manager(format!("Key Manager unreachable: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::key_manager(format!(
                "Key Manager returned HTTP {}",
                status.as_u16()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AuthError::key_manager(format!("Malformed Key Manager response: {e}")))
    }
}

#[async_trait]
impl KeyManager for HttpKeyManager {
    async fn active_signing_key(&self) -> AuthResult<SigningKeyMaterial> {
        let url = self.endpoint("keys/active")?;
        self.send(self.http_client.get(url)).await
    }

    async fn rotate_key(&self) -> AuthResult<SigningKeyMaterial> {
        let url = self.endpoint("keys/rotate")?;
        self.send(self.http_client.post(url)).await
    }

    async fn jwks(&self) -> AuthResult<Jwks> {
        let url = self.endpoint("keys/jwks")?;
        self.send(self.http_client.get(url)).await
    }
}
