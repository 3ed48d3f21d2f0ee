use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use octoidp_auth::{
    AuthResult,
    audit::{AuditQueue, AuditSink, TracingAuditSink},
    dpop::DpopValidator,
    grant::{GrantDependencies, GrantOrchestrator},
    http::{AdminState, TokenState, routes},
    keys::{KeyCache, key_manager_from_config},
    oauth::{ClientAssertionValidator, ClientAuthenticator},
    shard::{
        CodeShardSettings, InMemoryShardConfigStore, RefreshShardSettings, ShardConfigCache,
        ShardConfigStore, ShardedCodeStore, ShardedRefreshStore,
    },
    storage::{
        ClaimsEnricher, InMemoryClientDirectory, InMemoryJtiStorage,
        InMemoryPendingAuthorizations, InMemoryRevokedTokenStorage, JtiStorage,
        RevokedTokenStorage,
    },
    token::TokenMinter,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::AppConfig;

/// How long shutdown waits for queued audit events to be written.
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The wired token engine and the in-process stores behind it.
pub struct TokenEngine {
    pub shard_config: Arc<ShardConfigCache>,
    pub shard_config_store: Arc<InMemoryShardConfigStore>,
    pub codes: Arc<ShardedCodeStore>,
    pub refresh_families: Arc<ShardedRefreshStore>,
    pub keys: Arc<KeyCache>,
    pub clients: Arc<InMemoryClientDirectory>,
    pub jtis: Arc<InMemoryJtiStorage>,
    pub revoked_tokens: Arc<InMemoryRevokedTokenStorage>,
    pub pending: Arc<InMemoryPendingAuthorizations>,
    pub orchestrator: Arc<GrantOrchestrator>,
    pub audit: AuditQueue,
    audit_worker: JoinHandle<()>,
}

impl TokenEngine {
    /// Wires every collaborator from configuration.
    ///
    /// Must be called inside a tokio runtime: the audit worker is spawned here.
    pub fn build(
        cfg: &AppConfig,
        enricher: Option<Arc<dyn ClaimsEnricher>>,
    ) -> AuthResult<Self> {
        let auth = &cfg.auth;

        let shard_config_store = Arc::new(InMemoryShardConfigStore::new());
        let store: Arc<dyn ShardConfigStore> = shard_config_store.clone();
        let shard_config = Arc::new(ShardConfigCache::new(store, auth.sharding.clone()));
        let codes = Arc::new(ShardedCodeStore::new(
            shard_config.clone(),
            CodeShardSettings::from_config(auth),
        ));
        let refresh_families = Arc::new(ShardedRefreshStore::new(
            shard_config.clone(),
            RefreshShardSettings::from_config(auth),
        ));

        let keys = Arc::new(KeyCache::from_config(
            key_manager_from_config(&auth.keys)?,
            &auth.keys,
        ));

        let clients = Arc::new(InMemoryClientDirectory::with_clients(cfg.clients.clone()));
        let jtis = Arc::new(InMemoryJtiStorage::new());
        let revoked_tokens = Arc::new(InMemoryRevokedTokenStorage::new());
        let pending = Arc::new(InMemoryPendingAuthorizations::new());

        let sink: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
        let (audit, audit_worker) = AuditQueue::spawn(auth.audit.queue_capacity, sink);

        let assertions = ClientAssertionValidator::new(
            auth.token_endpoint_url(),
            auth.issuer.clone(),
            auth.client_assertion.max_lifetime,
            jtis.clone(),
        );
        let orchestrator = Arc::new(GrantOrchestrator::new(
            auth,
            GrantDependencies {
                clients: ClientAuthenticator::new(clients.clone(), assertions),
                dpop: DpopValidator::from_config(jtis.clone(), &auth.dpop),
                codes: codes.clone(),
                refresh_families: refresh_families.clone(),
                minter: TokenMinter::new(auth.issuer.clone(), keys.clone()),
                revoked_tokens: revoked_tokens.clone(),
                device_codes: pending.clone(),
                ciba_requests: pending.clone(),
                assertion_jtis: jtis.clone(),
                enricher,
                audit: audit.clone(),
            },
        ));

        tracing::info!(
            issuer = %auth.issuer,
            token_endpoint = %auth.token_endpoint_url(),
            clients = cfg.clients.len(),
            admin_enabled = auth.admin.secret.is_some(),
            "Token engine initialized"
        );

        Ok(Self {
            shard_config,
            shard_config_store,
            codes,
            refresh_families,
            keys,
            clients,
            jtis,
            revoked_tokens,
            pending,
            orchestrator,
            audit,
            audit_worker,
        })
    }

    fn admin_state(&self, cfg: &AppConfig) -> AdminState {
        AdminState::new(
            cfg.auth.admin.secret.as_deref(),
            cfg.auth.admin.batch_size,
            self.shard_config.clone(),
            self.codes.clone(),
            self.refresh_families.clone(),
            self.keys.clone(),
            self.audit.clone(),
        )
    }

    /// Periodically drops expired JTI and deny-list entries.
    fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let jtis = self.jtis.clone();
        let revoked = self.revoked_tokens.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match jtis.cleanup_expired().await {
                    Ok(removed) if removed > 0 => {
                        tracing::debug!(removed, "Expired JTIs removed");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "JTI cleanup failed"),
                }
                match revoked.cleanup_expired().await {
                    Ok(removed) if removed > 0 => {
                        tracing::debug!(removed, "Expired revocations removed");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Revocation cleanup failed"),
                }
            }
        })
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Answers 408 once a request runs longer than `timeout`.
fn request_timeout_layer(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout)
}

pub fn build_app(cfg: &AppConfig, engine: &TokenEngine) -> Router {
    let token = TokenState::new(engine.orchestrator.clone());
    Router::new()
        .route("/healthz", get(healthz))
        .merge(routes(token, engine.admin_state(cfg)))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri().path(),
                        http.status_code = Empty,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(request_timeout_layer(cfg.server.request_timeout))
        .layer(axum::extract::DefaultBodyLimit::max(cfg.server.body_limit_bytes))
}

pub struct OctoidpServer {
    addr: SocketAddr,
    app: Router,
    audit_worker: JoinHandle<()>,
    maintenance: JoinHandle<()>,
}

#[derive(Default)]
pub struct ServerBuilder {
    config: AppConfig,
    addr: Option<SocketAddr>,
    enricher: Option<Arc<dyn ClaimsEnricher>>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn ClaimsEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn build(self) -> AuthResult<OctoidpServer> {
        let engine = TokenEngine::build(&self.config, self.enricher)?;
        let app = build_app(&self.config, &engine);
        let maintenance = engine.spawn_maintenance(self.config.auth.sharding.sweep_interval);
        let TokenEngine { audit_worker, .. } = engine;

        Ok(OctoidpServer {
            addr: self.addr.unwrap_or_else(|| self.config.addr()),
            app,
            audit_worker,
            maintenance,
        })
    }
}

impl OctoidpServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.maintenance.abort();
        // The router held the last audit queue handles; the worker drains and stops.
        if tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, self.audit_worker)
            .await
            .is_err()
        {
            tracing::warn!("Audit worker did not drain before shutdown");
        }
        tracing::info!("server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
