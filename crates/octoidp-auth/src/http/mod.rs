//! Axum handlers.
//!
//! - [`token`] - `POST /token`
//! - [`admin`] - shard status, warmup and reload under `/admin/shards`

pub mod admin;
pub mod token;

use axum::{
    Router,
    routing::{get, post},
};

pub use admin::{
    AdminAuth, AdminRejection, AdminState, ShardOperationResponse, ShardStatus, WarmupRequest,
    reload_handler, shard_status_handler, warmup_handler,
};
pub use token::{TokenState, token_handler};

/// Builds the token and admin routes.
pub fn routes(token: TokenState, admin: AdminState) -> Router {
    let token_routes = Router::new()
        .route("/token", post(token_handler))
        .with_state(token);
    let admin_routes = Router::new()
        .route("/admin/shards", get(shard_status_handler))
        .route("/admin/shards/warmup", post(warmup_handler))
        .route("/admin/shards/reload", post(reload_handler))
        .with_state(admin);
    token_routes.merge(admin_routes)
}
