//! KVPS adapter: the Redis-like key-value + pub/sub backend the directory
//! and router are built on. `Kvps` is the seam — a real Redis connection in
//! production, an in-memory fake in tests, and a standalone no-op when the
//! backend can't be reached at startup.

mod fake;
mod redis_kvps;
mod standalone;

pub use fake::{FakeBus, FakeKvps};
pub use redis_kvps::RedisKvps;
pub use standalone::StandaloneKvps;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone)]
pub struct KvpsMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, thiserror::Error)]
pub enum KvpsError {
    #[error("kvps connection failed: {0}")]
    Connect(String),

    #[error("kvps command failed: {0}")]
    Command(String),

    #[error("kvps subscriber actor is gone")]
    ActorGone,

    #[error("kvps command timed out")]
    Timeout,
}

/// Upper bound any single KVPS command is allowed to take before a caller
/// gives up on it. Keeps a stalled backend from hanging an ingress task
/// indefinitely — see [`RedisKvps`]'s command implementations.
pub const COMMAND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Channel kind the directory and router key their storage by.
pub type MessageReceiver = mpsc::UnboundedReceiver<KvpsMessage>;

/// The key-value + pub/sub contract the rest of the crate is built against.
///
/// Every method is independently fallible; callers (the node manager, the
/// router) treat a `KvpsError` as "the backend is unreachable right now" and
/// degrade to standalone behavior rather than propagating it to clients.
/// `RedisKvps` bounds every command to [`COMMAND_TIMEOUT`] so a stalled
/// connection surfaces as a `KvpsError::Timeout` instead of hanging the
/// calling ingress task.
#[async_trait]
pub trait Kvps: Send + Sync {
    /// Set a key with no expiry.
    async fn set(&self, key: &str, value: &str) -> Result<(), KvpsError>;

    /// Set a key that expires after `ttl_secs` seconds.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvpsError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvpsError>;

    async fn delete(&self, key: &str) -> Result<(), KvpsError>;

    /// List keys matching a `redis`-style glob pattern (e.g. `"nodes:*"`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvpsError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvpsError>;

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvpsError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvpsError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvpsError>;

    /// Subscribe to a channel. Idempotent — subscribing twice is a no-op.
    /// Delivered messages arrive on the receiver handed back at construction.
    async fn subscribe(&self, channel: &str) -> Result<(), KvpsError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), KvpsError>;

    /// True for the standalone fallback, where every call above is a no-op
    /// that always succeeds. The node manager uses this to report cluster
    /// mode honestly in `getClusterInfo`.
    fn is_standalone(&self) -> bool;
}
