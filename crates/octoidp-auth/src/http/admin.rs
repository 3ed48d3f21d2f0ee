//! Administrative shard endpoints.
//!
//! All routes require `Authorization: Bearer <auth.admin.secret>`. When no
//! secret is configured the routes answer 404.
//!
//! - `GET /admin/shards` - topology snapshot, live actors, key cache stats
//! - `POST /admin/shards/warmup` - touch every code shard and the refresh
//!   shards of the listed clients
//! - `POST /admin/shards/reload` - refetch the topology and sweep every live
//!   actor

use std::sync::Arc;

use axum::{
    Json,
    extract::{FromRef, FromRequestParts, State},
    http::{HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::audit::AuditQueue;
use crate::error::AuthError;
use crate::keys::{KeyCache, KeyCacheStats};
use crate::shard::{
    BatchReport, CodeShardHandle, RefreshShardAddress, RefreshShardHandle, ShardConfigCache,
    ShardSnapshot, ShardedCodeStore, ShardedRefreshStore, run_batched,
};

/// State of the admin routes.
#[derive(Clone)]
pub struct AdminState {
    secret_digest: Option<[u8; 32]>,
    batch_size: usize,
    shard_config: Arc<ShardConfigCache>,
    codes: Arc<ShardedCodeStore>,
    refresh_families: Arc<ShardedRefreshStore>,
    keys: Arc<KeyCache>,
    audit: AuditQueue,
}

impl AdminState {
    /// Creates the admin state. `secret: None` disables the routes.
    pub fn new(
        secret: Option<&str>,
        batch_size: usize,
        shard_config: Arc<ShardConfigCache>,
        codes: Arc<ShardedCodeStore>,
        refresh_families: Arc<ShardedRefreshStore>,
        keys: Arc<KeyCache>,
        audit: AuditQueue,
    ) -> Self {
        Self {
            secret_digest: secret.map(|s| Sha256::digest(s.as_bytes()).into()),
            batch_size,
            shard_config,
            codes,
            refresh_families,
            keys,
            audit,
        }
    }
}

// =============================================================================
// Admin Auth Extractor
// =============================================================================

/// Proof that the request carried the admin bearer secret.
#[derive(Debug, Clone, Copy)]
pub struct AdminAuth;

/// Why an admin request was refused.
#[derive(Debug)]
pub enum AdminRejection {
    /// No admin secret is configured.
    Disabled,
    /// Missing or wrong bearer secret.
    Unauthorized,
}

impl IntoResponse for AdminRejection {
    fn into_response(self) -> Response {
        match self {
            Self::Disabled => StatusCode::NOT_FOUND.into_response(),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"))],
            )
                .into_response(),
        }
    }
}

impl<S> FromRequestParts<S> for AdminAuth
where
    S: Send + Sync,
    AdminState: FromRef<S>,
{
    type Rejection = AdminRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let admin = AdminState::from_ref(state);
        let Some(expected) = admin.secret_digest else {
            return Err(AdminRejection::Disabled);
        };

        let presented = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(AdminRejection::Unauthorized)?;

        let actual: [u8; 32] = Sha256::digest(presented.trim().as_bytes()).into();
        let diff = expected
            .iter()
            .zip(actual.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            tracing::warn!("Admin request with wrong secret");
            return Err(AdminRejection::Unauthorized);
        }
        Ok(AdminAuth)
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// `GET /admin/shards` response.
#[derive(Debug, Serialize)]
pub struct ShardStatus {
    /// Current topology snapshot.
    pub config: ShardSnapshot,
    /// Milliseconds since the snapshot was fetched.
    pub config_age_ms: Option<u128>,
    /// Code shard indexes with a running actor.
    pub live_code_shards: Vec<u32>,
    /// Refresh shard actors running in this process.
    pub live_refresh_shards: Vec<RefreshShardAddress>,
    /// Key cache statistics.
    pub keys: KeyCacheStats,
    /// Audit events dropped because the queue was full.
    pub audit_dropped: u64,
}

/// `POST /admin/shards/warmup` body.
#[derive(Debug, Default, Deserialize)]
pub struct WarmupRequest {
    /// Clients whose refresh shards should be started.
    #[serde(default)]
    pub client_ids: Vec<String>,
}

/// Result of a batched admin operation.
#[derive(Debug, Serialize)]
pub struct ShardOperationResponse {
    /// Topology the operation ran against.
    pub config: ShardSnapshot,
    /// Per-batch timing and failures.
    pub report: BatchReport,
}

#[derive(Clone)]
enum ShardTarget {
    Code(CodeShardHandle),
    Refresh(RefreshShardHandle),
}

impl ShardTarget {
    fn label(&self) -> String {
        match self {
            Self::Code(h) => format!("code:{}", h.shard()),
            Self::Refresh(h) => {
                let a = h.address();
                format!("refresh:{}:v{}:{}", a.client_id, a.generation, a.shard_index)
            }
        }
    }

    async fn ping(self) -> Result<(), AuthError> {
        match self {
            Self::Code(h) => h.ping().await.map(drop),
            Self::Refresh(h) => h.ping().await.map(drop),
        }
    }

    async fn sweep(self) -> Result<(), AuthError> {
        let label = self.label();
        let removed = match &self {
            Self::Code(h) => h.sweep().await?,
            Self::Refresh(h) => h.sweep().await?,
        };
        tracing::debug!(shard = %label, removed, "Shard swept");
        Ok(())
    }
}

/// `GET /admin/shards`.
pub async fn shard_status_handler(
    _admin: AdminAuth,
    State(state): State<AdminState>,
) -> Json<ShardStatus> {
    let snapshot = state.shard_config.snapshot().await;
    let mut live_refresh_shards: Vec<RefreshShardAddress> = state
        .refresh_families
        .live_actors()
        .iter()
        .map(|h| h.address().clone())
        .collect();
    live_refresh_shards.sort_by(|a, b| {
        (&a.client_id, a.generation, a.shard_index).cmp(&(&b.client_id, b.generation, b.shard_index))
    });

    Json(ShardStatus {
        config_age_ms: snapshot.age_ms(),
        config: snapshot.as_ref().clone(),
        live_code_shards: state.codes.live_shards(),
        live_refresh_shards,
        keys: state.keys.stats(),
        audit_dropped: state.audit.dropped(),
    })
}

/// `POST /admin/shards/warmup`.
pub async fn warmup_handler(
    _admin: AdminAuth,
    State(state): State<AdminState>,
    body: Option<Json<WarmupRequest>>,
) -> Json<ShardOperationResponse> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let snapshot = state.shard_config.snapshot().await;

    let mut targets: Vec<ShardTarget> = (0..snapshot.code_shards)
        .map(|shard| ShardTarget::Code(state.codes.actor(shard)))
        .collect();
    for client_id in &request.client_ids {
        for address in state.refresh_families.current_addresses(client_id).await {
            targets.push(ShardTarget::Refresh(state.refresh_families.actor(address)));
        }
    }

    let items = targets.into_iter().map(|t| (t.label(), t)).collect();
    let report = run_batched(items, state.batch_size, ShardTarget::ping).await;
    tracing::info!(
        total = report.total,
        failed = report.failed,
        batches = report.batches.len(),
        "Shard warmup finished"
    );

    Json(ShardOperationResponse {
        config: snapshot.as_ref().clone(),
        report,
    })
}

/// `POST /admin/shards/reload`.
pub async fn reload_handler(
    _admin: AdminAuth,
    State(state): State<AdminState>,
) -> Json<ShardOperationResponse> {
    let snapshot = state.shard_config.force_refresh().await;

    let targets = state
        .codes
        .live_actors()
        .into_iter()
        .map(ShardTarget::Code)
        .chain(
            state
                .refresh_families
                .live_actors()
                .into_iter()
                .map(ShardTarget::Refresh),
        );
    let items = targets.map(|t| (t.label(), t)).collect();
    let report = run_batched(items, state.batch_size, ShardTarget::sweep).await;
    tracing::info!(
        code_shards = snapshot.code_shards,
        refresh_generation = snapshot.refresh.generation,
        total = report.total,
        failed = report.failed,
        "Shard config reloaded"
    );

    Json(ShardOperationResponse {
        config: snapshot.as_ref().clone(),
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditSink, TracingAuditSink};
    use crate::config::{AuthConfig, ShardingConfig};
    use crate::keys::LocalKeyManager;
    use crate::shard::{CodeShardSettings, InMemoryShardConfigStore, RefreshShardSettings};
    use crate::token::SigningAlgorithm;
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::Request,
        routing::{get, post},
    };
    use tower::ServiceExt;

    fn state(secret: Option<&str>) -> (AdminState, Arc<InMemoryShardConfigStore>) {
        let config = AuthConfig::new("https://idp.example.com");
        let store = Arc::new(InMemoryShardConfigStore::new());
        let shard_config = Arc::new(ShardConfigCache::new(
            store.clone(),
            ShardingConfig {
                default_code_shards: 3,
                refresh_shard_count: 2,
                ..config.sharding.clone()
            },
        ));
        let codes = Arc::new(ShardedCodeStore::new(
            shard_config.clone(),
            CodeShardSettings::from_config(&config),
        ));
        let families = Arc::new(ShardedRefreshStore::new(
            shard_config.clone(),
            RefreshShardSettings::from_config(&config),
        ));
        let manager = LocalKeyManager::new(SigningAlgorithm::ES384, 1).unwrap();
        let keys = Arc::new(KeyCache::from_config(Arc::new(manager), &config.keys));
        let sink: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
        let (audit, _worker) = AuditQueue::spawn(8, sink);
        let state = AdminState::new(secret, 2, shard_config, codes, families, keys, audit);
        (state, store)
    }

    fn app(state: AdminState) -> Router {
        Router::new()
            .route("/admin/shards", get(shard_status_handler))
            .route("/admin/shards/warmup", post(warmup_handler))
            .route("/admin/shards/reload", post(reload_handler))
            .with_state(state)
    }

    fn request(method: &str, uri: &str, bearer: Option<&str>, body: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_disabled_without_secret() {
        let (state, _) = state(None);
        let response = app(state)
            .oneshot(request("GET", "/admin/shards", Some("anything"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_unauthorized() {
        let (state, _) = state(Some("admin-secret"));
        let response = app(state.clone())
            .oneshot(request("GET", "/admin/shards", Some("guess"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");

        let response = app(state)
            .oneshot(request("GET", "/admin/shards", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_warmup_starts_code_and_refresh_shards() {
        let (state, _) = state(Some("admin-secret"));
        let body = Some(r#"{"client_ids":["app"]}"#);
        let response = app(state.clone())
            .oneshot(request("POST", "/admin/shards/warmup", Some("admin-secret"), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = json(response).await;
        assert_eq!(report["report"]["total"], 5);
        assert_eq!(report["report"]["failed"], 0);
        assert_eq!(report["report"]["batches"].as_array().unwrap().len(), 3);

        let response = app(state)
            .oneshot(request("GET", "/admin/shards", Some("admin-secret"), None))
            .await
            .unwrap();
        let status = json(response).await;
        assert_eq!(status["live_code_shards"], serde_json::json!([0, 1, 2]));
        assert_eq!(status["live_refresh_shards"].as_array().unwrap().len(), 2);
        assert_eq!(status["config"]["code_shards"], 3);
    }

    #[tokio::test]
    async fn test_reload_picks_up_new_topology() {
        let (state, store) = state(Some("admin-secret"));
        let response = app(state.clone())
            .oneshot(request("POST", "/admin/shards/warmup", Some("admin-secret"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        store.set_shard_count(Some(8));
        let response = app(state)
            .oneshot(request("POST", "/admin/shards/reload", Some("admin-secret"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reload = json(response).await;
        assert_eq!(reload["config"]["code_shards"], 8);
        assert_eq!(reload["config"]["code_source"], "store");
        assert_eq!(reload["report"]["total"], 3);
    }
}
