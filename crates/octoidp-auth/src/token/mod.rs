//! Token formats and minting.
//!
//! - [`jwt`] - signing keys, key sets and claims types
//! - [`minter`] - access, ID and refresh token minting

pub mod jwt;
pub mod minter;

pub use jwt::{
    AccessTokenClaims, Confirmation, IdTokenClaims, Jwk, Jwks, JwtError, RefreshTokenClaims,
    SigningAlgorithm, SigningKeyMaterial, SigningKeyPair, left_half_hash,
};
pub use minter::{
    IdTokenRequest, MintRequest, MintedTokens, RESERVED_CLAIMS, RefreshTokenRequest, TokenMinter,
    sanitize_claims,
};
