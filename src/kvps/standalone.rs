use async_trait::async_trait;

use super::{Kvps, KvpsError};

/// Fail-soft fallback when the configured backend couldn't be reached at
/// startup. Every operation succeeds and does nothing; routing degrades to
/// whatever `registry`/`router` can do with local-only fan-out.
pub struct StandaloneKvps;

#[async_trait]
impl Kvps for StandaloneKvps {
    async fn set(&self, _key: &str, _value: &str) -> Result<(), KvpsError> {
        Ok(())
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl_secs: u64) -> Result<(), KvpsError> {
        Ok(())
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, KvpsError> {
        Ok(None)
    }

    async fn delete(&self, _key: &str) -> Result<(), KvpsError> {
        Ok(())
    }

    async fn keys(&self, _pattern: &str) -> Result<Vec<String>, KvpsError> {
        Ok(Vec::new())
    }

    async fn sadd(&self, _key: &str, _member: &str) -> Result<(), KvpsError> {
        Ok(())
    }

    async fn srem(&self, _key: &str, _member: &str) -> Result<(), KvpsError> {
        Ok(())
    }

    async fn smembers(&self, _key: &str) -> Result<Vec<String>, KvpsError> {
        Ok(Vec::new())
    }

    async fn publish(&self, _channel: &str, _message: &str) -> Result<(), KvpsError> {
        Ok(())
    }

    async fn subscribe(&self, _channel: &str) -> Result<(), KvpsError> {
        Ok(())
    }

    async fn unsubscribe(&self, _channel: &str) -> Result<(), KvpsError> {
        Ok(())
    }

    fn is_standalone(&self) -> bool {
        true
    }
}
