//! OAuth 2.0 token endpoint building blocks.
//!
//! - [`token`] - request parsing, response and error bodies
//! - [`client_auth`] - credential extraction and client authentication
//! - [`client_assertion`] - `client_secret_jwt` / `private_key_jwt` assertions
//! - [`pkce`] - PKCE challenge/verifier (S256)
//!
//! # Example
//!
//! ```
//! use octoidp_auth::oauth::{PkceChallenge, PkceVerifier};
//!
//! let verifier = PkceVerifier::generate();
//! let challenge = PkceChallenge::from_verifier(&verifier);
//! assert!(challenge.verify(&verifier).is_ok());
//! ```

pub mod client_assertion;
pub mod client_auth;
pub mod pkce;
pub mod token;

pub use client_assertion::{
    ClientAssertionClaims, ClientAssertionValidator, JWT_BEARER_ASSERTION_TYPE, StringOrArray,
};
pub use client_auth::{
    AuthenticatedClient, ClientAuthenticator, ClientCredentials, TokenEndpointAuthMethod,
};
pub use pkce::{
    PkceChallenge, PkceChallengeMethod, PkceError, PkceVerifier, verify_code_verifier,
};
pub use token::{TokenError, TokenErrorCode, TokenRequest, TokenResponse, TokenType};
