//! Sharded token state.
//!
//! - [`router`] - shard index hashing, remapping, code and JTI formats
//! - [`config`] - shard topology store and its TTL cache
//! - [`namespace`] - lazy actor registry
//! - [`code`] - authorization code shard actors
//! - [`refresh`] - refresh token rotation shard actors
//! - [`warmup`] - bounded batch fan-out for admin operations
//!
//! Every shard is a single tokio task that applies its commands serially.
//! That task is the concurrency boundary: consume and rotate are atomic
//! because nothing else touches the shard's map.

pub mod code;
pub mod config;
pub mod namespace;
pub mod refresh;
pub mod router;
pub mod warmup;

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::AuthResult;
use crate::error::AuthError;

pub use code::{
    AttachOutcome, AuthorizationCodeStore, CodeShardHandle, CodeShardSettings, CodeShardState,
    ConsumeOutcome, ConsumeRejection, ConsumeRequest, ConsumedCode, ShardedCodeStore,
    code_fingerprint,
};
pub use config::{
    ConfigSource, InMemoryShardConfigStore, RefreshTokenShardConfig, ShardConfigCache,
    ShardConfigStore, ShardSnapshot,
};
pub use namespace::{ActorHandle, ShardNamespace};
pub use refresh::{
    NewFamily, RefreshShardAddress, RefreshShardHandle, RefreshShardSettings, RefreshShardState,
    RefreshTokenFamilyStore, RegisteredFamily, RotateOutcome, RotateRejection, RotateRequest,
    ShardedRefreshStore,
};
pub use router::{
    AuthorizationCodeValue, RefreshTokenJti, ShardAddressError, remap_shard_index, routing_key,
    shard_index,
};
pub use warmup::{BatchReport, BatchTiming, ItemFailure, run_batched};

/// Sends one command to an actor and waits for its reply.
///
/// The whole exchange is bounded by `timeout` and never retried. A timeout
/// is ambiguous (the actor may have applied the command) and surfaces as a
/// storage error like any other failure.
pub(crate) async fn call_actor<C, R>(
    tx: &mpsc::Sender<C>,
    timeout: Duration,
    label: &str,
    command: impl FnOnce(oneshot::Sender<R>) -> C,
) -> AuthResult<R> {
    let (reply, rx) = oneshot::channel();
    let exchange = async {
        tx.send(command(reply))
            .await
            .map_err(|_| AuthError::storage(format!("{label} is not running")))?;
        rx.await
            .map_err(|_| AuthError::storage(format!("{label} dropped the request")))
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| AuthError::storage(format!("{label} timed out")))?
}
