//! Client authentication for the token endpoint.
//!
//! # Authentication Methods
//!
//! - `none` - Public clients (client_id only)
//! - `client_secret_basic` - HTTP Basic Auth with client_id:client_secret
//! - `client_secret_post` - client_id and client_secret in request body
//! - `client_secret_jwt` - HMAC client assertion keyed with the secret
//! - `private_key_jwt` - Client assertion signed with a registered key
//!
//! Exactly one credential class may be presented per request. A request that
//! combines, say, Basic credentials with a body secret or an assertion is
//! rejected rather than authenticated by whichever method looks strongest.
//! The class must also match the method the client registered.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::AuthResult;
use crate::error::AuthError;
use crate::oauth::client_assertion::{
    ClientAssertionValidator, JWT_BEARER_ASSERTION_TYPE, extract_client_id_unverified,
};
use crate::oauth::token::TokenRequest;
use crate::storage::ClientDirectory;
use crate::types::Client;

/// Token endpoint authentication methods (OIDC Core §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    /// No client authentication (public clients).
    None,

    /// Client secret via HTTP Basic Auth.
    ClientSecretBasic,

    /// Client secret in request body.
    ClientSecretPost,

    /// HMAC client assertion keyed with the client secret.
    ClientSecretJwt,

    /// Client assertion JWT signed with a private key.
    PrivateKeyJwt,
}

impl TokenEndpointAuthMethod {
    /// Returns the string representation of the auth method.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ClientSecretBasic => "client_secret_basic",
            Self::ClientSecretPost => "client_secret_post",
            Self::ClientSecretJwt => "client_secret_jwt",
            Self::PrivateKeyJwt => "private_key_jwt",
        }
    }
}

impl fmt::Display for TokenEndpointAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The single credential class presented with a token request.
#[derive(Clone, PartialEq, Eq)]
pub enum ClientCredentials {
    /// `Authorization: Basic` header.
    Basic {
        /// Client ID.
        client_id: String,
        /// Client secret.
        client_secret: String,
    },
    /// `client_id` + `client_secret` body parameters.
    Post {
        /// Client ID.
        client_id: String,
        /// Client secret.
        client_secret: String,
    },
    /// `client_assertion` body parameter.
    Assertion {
        /// Optional `client_id` body parameter; must match the assertion.
        client_id: Option<String>,
        /// The assertion JWT.
        assertion: String,
    },
    /// `client_id` only.
    Public {
        /// Client ID.
        client_id: String,
    },
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, client_id) = match self {
            Self::Basic { client_id, .. } => ("Basic", Some(client_id)),
            Self::Post { client_id, .. } => ("Post", Some(client_id)),
            Self::Assertion { client_id, .. } => ("Assertion", client_id.as_ref()),
            Self::Public { client_id } => ("Public", Some(client_id)),
        };
        f.debug_struct(name)
            .field("client_id", &client_id)
            .finish_non_exhaustive()
    }
}

impl ClientCredentials {
    /// Determines the credential class from the `Authorization` header value
    /// and the request body.
    ///
    /// # Errors
    ///
    /// - `invalid_request` if more than one class is present, the Basic
    ///   header is malformed, or the assertion type is unsupported
    /// - `invalid_client` if no client identification is present at all
    pub fn extract(authorization: Option<&str>, request: &TokenRequest) -> AuthResult<Self> {
        let basic = authorization.map(parse_basic_auth).transpose()?;
        let has_body_secret = request.client_secret.is_some();
        let has_assertion =
            request.client_assertion.is_some() || request.client_assertion_type.is_some();

        let classes = usize::from(basic.is_some())
            + usize::from(has_body_secret)
            + usize::from(has_assertion);
        if classes > 1 {
            return Err(AuthError::invalid_request(
                "Multiple client authentication methods used",
            ));
        }

        if let Some((client_id, client_secret)) = basic {
            if let Some(body_id) = &request.client_id
                && body_id != &client_id
            {
                return Err(AuthError::invalid_request(
                    "client_id does not match the Authorization header",
                ));
            }
            return Ok(Self::Basic {
                client_id,
                client_secret,
            });
        }

        if has_body_secret {
            let client_id = TokenRequest::require(&request.client_id, "client_id")?;
            let client_secret = TokenRequest::require(&request.client_secret, "client_secret")?;
            return Ok(Self::Post {
                client_id: client_id.to_string(),
                client_secret: client_secret.to_string(),
            });
        }

        if has_assertion {
            let assertion_type =
                TokenRequest::require(&request.client_assertion_type, "client_assertion_type")?;
            if assertion_type != JWT_BEARER_ASSERTION_TYPE {
                return Err(AuthError::invalid_request(format!(
                    "Unsupported client_assertion_type: {assertion_type}"
                )));
            }
            let assertion = TokenRequest::require(&request.client_assertion, "client_assertion")?;
            return Ok(Self::Assertion {
                client_id: request.client_id.clone(),
                assertion: assertion.to_string(),
            });
        }

        match &request.client_id {
            Some(client_id) => Ok(Self::Public {
                client_id: client_id.clone(),
            }),
            None => Err(AuthError::invalid_client("No client credentials provided")),
        }
    }

    /// Returns `true` for the `Authorization: Basic` class.
    #[must_use]
    pub fn is_basic(&self) -> bool {
        matches!(self, Self::Basic { .. })
    }
}

/// Parses an `Authorization: Basic` header value.
///
/// Both parts are form-urlencoded before base64 encoding (RFC 6749 §2.3.1).
fn parse_basic_auth(header: &str) -> AuthResult<(String, String)> {
    let (scheme, credentials) = header
        .split_once(' ')
        .ok_or_else(|| AuthError::invalid_request("Malformed Authorization header"))?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AuthError::invalid_request(
            "Authorization header must use the Basic scheme",
        ));
    }

    let decoded = STANDARD
        .decode(credentials.trim())
        .map_err(|_| AuthError::invalid_request("Invalid base64 in Authorization header"))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| AuthError::invalid_request("Invalid UTF-8 in Authorization header"))?;
    let (client_id, client_secret) = decoded
        .split_once(':')
        .ok_or_else(|| AuthError::invalid_request("Credentials must be 'id:secret'"))?;

    Ok((form_decode(client_id), form_decode(client_secret)))
}

fn form_decode(value: &str) -> String {
    if value.contains('&') {
        return value.to_string();
    }
    url::form_urlencoded::parse(format!("v={value}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

/// A successfully authenticated client.
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    /// The authenticated client.
    pub client: Client,

    /// The method used.
    pub auth_method: TokenEndpointAuthMethod,
}

/// Authenticates token endpoint clients against the client directory.
pub struct ClientAuthenticator {
    clients: Arc<dyn ClientDirectory>,
    assertions: ClientAssertionValidator,
}

impl ClientAuthenticator {
    /// Creates an authenticator.
    pub fn new(clients: Arc<dyn ClientDirectory>, assertions: ClientAssertionValidator) -> Self {
        Self {
            clients,
            assertions,
        }
    }

    /// Authenticates the presented credentials.
    ///
    /// # Errors
    ///
    /// Returns `invalid_client` when the client is unknown or inactive, the
    /// credential class differs from the registered method, or verification
    /// fails. Directory failures propagate as server errors.
    pub async fn authenticate(
        &self,
        credentials: &ClientCredentials,
    ) -> AuthResult<AuthenticatedClient> {
        let (client_id, presented) = match credentials {
            ClientCredentials::Basic { client_id, .. } => {
                (client_id.clone(), TokenEndpointAuthMethod::ClientSecretBasic)
            }
            ClientCredentials::Post { client_id, .. } => {
                (client_id.clone(), TokenEndpointAuthMethod::ClientSecretPost)
            }
            ClientCredentials::Assertion {
                client_id,
                assertion,
            } => {
                let asserted = extract_client_id_unverified(assertion)?;
                if let Some(client_id) = client_id
                    && client_id != &asserted
                {
                    return Err(AuthError::invalid_client(
                        "client_id does not match the client assertion",
                    ));
                }
                // Narrowed to the registered assertion method below.
                (asserted, TokenEndpointAuthMethod::PrivateKeyJwt)
            }
            ClientCredentials::Public { client_id } => {
                (client_id.clone(), TokenEndpointAuthMethod::None)
            }
        };

        let client = self
            .clients
            .get_client(&client_id)
            .await?
            .ok_or_else(|| AuthError::invalid_client("Unknown client"))?;

        if !client.active {
            return Err(AuthError::invalid_client("Client is inactive"));
        }

        let registered = client.token_endpoint_auth_method;
        let class_matches = match credentials {
            ClientCredentials::Assertion { .. } => matches!(
                registered,
                TokenEndpointAuthMethod::ClientSecretJwt | TokenEndpointAuthMethod::PrivateKeyJwt
            ),
            _ => registered == presented,
        };
        if !class_matches {
            tracing::debug!(
                client_id = %client.client_id,
                registered = %registered,
                "Client used an authentication method it is not registered for"
            );
            return Err(AuthError::invalid_client(format!(
                "Client must authenticate with {registered}"
            )));
        }

        match credentials {
            ClientCredentials::Basic { client_secret, .. }
            | ClientCredentials::Post { client_secret, .. } => {
                if !client.verify_secret(client_secret) {
                    return Err(AuthError::invalid_client("Invalid client secret"));
                }
            }
            ClientCredentials::Assertion { assertion, .. } => {
                self.assertions.validate(assertion, &client).await?;
            }
            ClientCredentials::Public { .. } => {}
        }

        Ok(AuthenticatedClient {
            client,
            auth_method: registered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryClientDirectory, InMemoryJtiStorage};
    use crate::types::GrantType;
    use std::time::Duration;

    fn request() -> TokenRequest {
        TokenRequest {
            grant_type: "authorization_code".to_string(),
            ..Default::default()
        }
    }

    fn basic(id: &str, secret: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{id}:{secret}")))
    }

    fn client(id: &str, method: TokenEndpointAuthMethod) -> Client {
        Client {
            client_id: id.to_string(),
            client_secret: (method != TokenEndpointAuthMethod::None)
                .then(|| "s3cret".to_string()),
            token_endpoint_auth_method: method,
            grant_types: vec![GrantType::AuthorizationCode],
            redirect_uris: vec![],
            scopes: vec![],
            jwks: None,
            dpop_bound_access_tokens: false,
            access_token_lifetime: None,
            refresh_token_lifetime: None,
            active: true,
        }
    }

    fn authenticator() -> ClientAuthenticator {
        let directory = InMemoryClientDirectory::with_clients([
            client("basic-app", TokenEndpointAuthMethod::ClientSecretBasic),
            client("post-app", TokenEndpointAuthMethod::ClientSecretPost),
            client("spa", TokenEndpointAuthMethod::None),
        ]);
        let assertions = ClientAssertionValidator::new(
            "https://idp.example.com/token",
            "https://idp.example.com",
            Duration::from_secs(300),
            Arc::new(InMemoryJtiStorage::new()),
        );
        ClientAuthenticator::new(Arc::new(directory), assertions)
    }

    #[test]
    fn test_extract_basic() {
        let creds = ClientCredentials::extract(Some(&basic("app", "pw")), &request()).unwrap();
        assert_eq!(
            creds,
            ClientCredentials::Basic {
                client_id: "app".to_string(),
                client_secret: "pw".to_string()
            }
        );
        assert!(creds.is_basic());
    }

    #[test]
    fn test_extract_basic_form_decodes() {
        let creds =
            ClientCredentials::extract(Some(&basic("my%3Aapp", "p%40ss")), &request()).unwrap();
        assert_eq!(
            creds,
            ClientCredentials::Basic {
                client_id: "my:app".to_string(),
                client_secret: "p@ss".to_string()
            }
        );
    }

    #[test]
    fn test_extract_conflicting_credentials() {
        let mut req = request();
        req.client_id = Some("app".to_string());
        req.client_secret = Some("pw".to_string());

        let err = ClientCredentials::extract(Some(&basic("app", "pw")), &req).unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest { .. }));

        req.client_assertion_type = Some(JWT_BEARER_ASSERTION_TYPE.to_string());
        req.client_assertion = Some("a.b.c".to_string());
        let err = ClientCredentials::extract(None, &req).unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest { .. }));
    }

    #[test]
    fn test_extract_basic_with_mismatched_body_client_id() {
        let mut req = request();
        req.client_id = Some("other".to_string());
        let err = ClientCredentials::extract(Some(&basic("app", "pw")), &req).unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest { .. }));
    }

    #[test]
    fn test_extract_public_and_missing() {
        let mut req = request();
        req.client_id = Some("spa".to_string());
        assert_eq!(
            ClientCredentials::extract(None, &req).unwrap(),
            ClientCredentials::Public {
                client_id: "spa".to_string()
            }
        );

        let err = ClientCredentials::extract(None, &request()).unwrap_err();
        assert!(matches!(err, AuthError::InvalidClient { .. }));
    }

    #[test]
    fn test_extract_rejects_other_schemes() {
        let err = ClientCredentials::extract(Some("Bearer abc"), &request()).unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_authenticate_basic() {
        let auth = authenticator();
        let creds = ClientCredentials::Basic {
            client_id: "basic-app".to_string(),
            client_secret: "s3cret".to_string(),
        };
        let authenticated = auth.authenticate(&creds).await.unwrap();
        assert_eq!(authenticated.auth_method, TokenEndpointAuthMethod::ClientSecretBasic);

        let wrong = ClientCredentials::Basic {
            client_id: "basic-app".to_string(),
            client_secret: "nope".to_string(),
        };
        assert!(matches!(
            auth.authenticate(&wrong).await.unwrap_err(),
            AuthError::InvalidClient { .. }
        ));
    }

    #[tokio::test]
    async fn test_authenticate_method_must_match_registration() {
        let auth = authenticator();
        // Registered for client_secret_post, presented via Basic.
        let creds = ClientCredentials::Basic {
            client_id: "post-app".to_string(),
            client_secret: "s3cret".to_string(),
        };
        assert!(auth.authenticate(&creds).await.is_err());

        // Confidential client cannot downgrade to public.
        let creds = ClientCredentials::Public {
            client_id: "basic-app".to_string(),
        };
        assert!(auth.authenticate(&creds).await.is_err());
    }

    #[tokio::test]
    async fn test_authenticate_public_and_unknown() {
        let auth = authenticator();
        let creds = ClientCredentials::Public {
            client_id: "spa".to_string(),
        };
        assert_eq!(
            auth.authenticate(&creds).await.unwrap().auth_method,
            TokenEndpointAuthMethod::None
        );

        let creds = ClientCredentials::Public {
            client_id: "ghost".to_string(),
        };
        assert!(matches!(
            auth.authenticate(&creds).await.unwrap_err(),
            AuthError::InvalidClient { .. }
        ));
    }

    #[test]
    fn test_auth_method_serde() {
        let json = serde_json::to_string(&TokenEndpointAuthMethod::PrivateKeyJwt).unwrap();
        assert_eq!(json, "\"private_key_jwt\"");
        assert_eq!(TokenEndpointAuthMethod::ClientSecretJwt.to_string(), "client_secret_jwt");
    }
}
