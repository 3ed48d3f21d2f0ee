//! Domain types shared across the engine.
//!
//! - [`Client`] - registered OAuth client
//! - [`GrantType`] - grant types accepted at the token endpoint
//! - [`Scope`] - space-delimited scope sets
//! - [`AuthorizationCode`] - codes held by the code shard actors

pub mod client;
pub mod code;
pub mod scope;

pub use client::{Client, GrantType};
pub use code::{AuthorizationCode, NewAuthorizationCode};
pub use scope::Scope;
