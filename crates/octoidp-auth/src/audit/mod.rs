//! Security event audit queue.
//!
//! Token handlers push events with [`AuditQueue::record`], which never blocks
//! and never fails the request: when the bounded queue is full the event is
//! dropped and counted. A single worker task drains the queue into an
//! [`AuditSink`]; sink errors are logged and isolated from the request path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::AuthResult;

/// Kinds of security events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    /// An already-consumed authorization code was presented again.
    CodeReplay,
    /// A rotated-past refresh token was presented; the family was revoked.
    RefreshTokenTheft,
    /// A DPoP proof JTI was reused.
    DpopReplay,
    /// A token was signed by a key that is no longer published.
    RevokedKey,
    /// Tokens were issued.
    TokenIssued,
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    /// What happened.
    pub kind: SecurityEventKind,
    /// When it was observed.
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    /// Client involved.
    pub client_id: Option<String>,
    /// Subject involved.
    pub subject: Option<String>,
    /// Correlation detail (JTIs, fingerprints, family IDs).
    pub detail: serde_json::Map<String, serde_json::Value>,
}

impl SecurityEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(kind: SecurityEventKind) -> Self {
        Self {
            kind,
            at: OffsetDateTime::now_utc(),
            client_id: None,
            subject: None,
            detail: serde_json::Map::new(),
        }
    }

    /// Sets the client.
    #[must_use]
    pub fn client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Sets the subject.
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Adds a correlation field.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }
}

/// Destination of audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persists one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be written. The queue logs
    /// it and moves on.
    async fn write(&self, event: &SecurityEvent) -> AuthResult<()>;
}

/// Sink writing events to the `octoidp::audit` tracing target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&self, event: &SecurityEvent) -> AuthResult<()> {
        let detail = serde_json::Value::Object(event.detail.clone());
        tracing::info!(
            target: "octoidp::audit",
            kind = ?event.kind,
            client_id = event.client_id.as_deref().unwrap_or("-"),
            subject = event.subject.as_deref().unwrap_or("-"),
            detail = %detail,
            "security event"
        );
        Ok(())
    }
}

/// Bounded, non-blocking audit queue.
#[derive(Clone)]
pub struct AuditQueue {
    tx: mpsc::Sender<SecurityEvent>,
    dropped: Arc<AtomicU64>,
}

impl AuditQueue {
    /// Creates a queue of `capacity` events and spawns its worker.
    ///
    /// The worker stops once every queue handle is dropped and the queue is
    /// drained.
    pub fn spawn(capacity: usize, sink: Arc<dyn AuditSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<SecurityEvent>(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.write(&event).await {
                    tracing::error!(kind = ?event.kind, error = %e, "Audit sink failed");
                }
            }
            tracing::debug!("Audit worker stopped");
        });
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            worker,
        )
    }

    /// Enqueues an event without waiting.
    pub fn record(&self, event: SecurityEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            let kind = match &e {
                mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => {
                    ev.kind
                }
            };
            tracing::warn!(kind = ?kind, dropped, "Audit queue full, event dropped");
        }
    }

    /// Events dropped since start.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
