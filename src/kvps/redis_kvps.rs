use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, RedisResult};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Kvps, KvpsError, KvpsMessage, MessageReceiver, COMMAND_TIMEOUT};

/// Bounds a single command future to `COMMAND_TIMEOUT` so a stalled
/// connection can't hang the caller indefinitely.
async fn bounded<T>(fut: impl std::future::Future<Output = RedisResult<T>>) -> Result<T, KvpsError> {
    tokio::time::timeout(COMMAND_TIMEOUT, fut)
        .await
        .map_err(|_| KvpsError::Timeout)?
        .map_err(|e| KvpsError::Command(e.to_string()))
}

enum SubCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Redis-backed `Kvps`. Commands go over a `ConnectionManager` (auto
/// reconnecting); subscribe/unsubscribe are forwarded to a dedicated actor
/// task that owns the `PubSub` connection, since `redis`'s pub/sub API needs
/// `&mut self` to read messages and to (un)subscribe.
pub struct RedisKvps {
    conn: ConnectionManager,
    cmd_tx: mpsc::UnboundedSender<SubCommand>,
}

impl RedisKvps {
    /// Connect to `url` and spawn the pub/sub actor. Returns the adapter and
    /// the receiver the caller should drain for incoming `KvpsMessage`s.
    pub async fn connect(url: &str) -> Result<(Self, MessageReceiver), KvpsError> {
        let client = redis::Client::open(url).map_err(|e| KvpsError::Connect(e.to_string()))?;

        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| KvpsError::Connect(e.to_string()))?;

        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| KvpsError::Connect(e.to_string()))?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_subscriber_actor(pubsub, cmd_rx, msg_tx));

        Ok((Self { conn, cmd_tx }, msg_rx))
    }
}

async fn run_subscriber_actor(
    mut pubsub: PubSub,
    mut cmd_rx: mpsc::UnboundedReceiver<SubCommand>,
    msg_tx: mpsc::UnboundedSender<KvpsMessage>,
) {
    loop {
        let mut stream = pubsub.on_message();
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else {
                    drop(stream);
                    break;
                };
                let channel = msg.get_channel_name().to_string();
                let payload: String = msg.get_payload().unwrap_or_default();
                drop(stream);
                if msg_tx.send(KvpsMessage { channel, payload }).is_err() {
                    break;
                }
            }
            cmd = cmd_rx.recv() => {
                drop(stream);
                match cmd {
                    Some(SubCommand::Subscribe(channel)) => {
                        if let Err(e) = pubsub.subscribe(&channel).await {
                            warn!(channel, error = %e, "kvps subscribe failed");
                        } else {
                            debug!(channel, "kvps subscribed");
                        }
                    }
                    Some(SubCommand::Unsubscribe(channel)) => {
                        if let Err(e) = pubsub.unsubscribe(&channel).await {
                            warn!(channel, error = %e, "kvps unsubscribe failed");
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

#[async_trait]
impl Kvps for RedisKvps {
    async fn set(&self, key: &str, value: &str) -> Result<(), KvpsError> {
        let mut conn = self.conn.clone();
        bounded(conn.set::<_, _, ()>(key, value)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvpsError> {
        let mut conn = self.conn.clone();
        bounded(conn.set_ex::<_, _, ()>(key, value, ttl_secs)).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvpsError> {
        let mut conn = self.conn.clone();
        bounded(conn.get(key)).await
    }

    async fn delete(&self, key: &str) -> Result<(), KvpsError> {
        let mut conn = self.conn.clone();
        bounded(conn.del::<_, ()>(key)).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvpsError> {
        let mut conn = self.conn.clone();
        bounded(conn.keys(pattern)).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvpsError> {
        let mut conn = self.conn.clone();
        bounded(conn.sadd::<_, _, ()>(key, member)).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvpsError> {
        let mut conn = self.conn.clone();
        bounded(conn.srem::<_, _, ()>(key, member)).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvpsError> {
        let mut conn = self.conn.clone();
        bounded(conn.smembers(key)).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvpsError> {
        let mut conn = self.conn.clone();
        bounded(conn.publish::<_, _, ()>(channel, message)).await
    }

    async fn subscribe(&self, channel: &str) -> Result<(), KvpsError> {
        self.cmd_tx
            .send(SubCommand::Subscribe(channel.to_string()))
            .map_err(|_| KvpsError::ActorGone)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), KvpsError> {
        self.cmd_tx
            .send(SubCommand::Unsubscribe(channel.to_string()))
            .map_err(|_| KvpsError::ActorGone)
    }

    fn is_standalone(&self) -> bool {
        false
    }
}
