//! In-memory `Kvps` used by integration tests to simulate multiple gateway
//! nodes sharing one backend without a live Redis server. Several
//! `FakeKvps` handles opened against the same `FakeBus` behave like several
//! Redis clients against the same server: sets, keys and pub/sub are all
//! shared state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Kvps, KvpsError, KvpsMessage, MessageReceiver};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct BusInner {
    kv: HashMap<String, Entry>,
    sets: HashMap<String, HashSet<String>>,
    subscribers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<KvpsMessage>)>>,
}

/// Shared backing store for a group of `FakeKvps` handles.
#[derive(Clone, Default)]
pub struct FakeBus(Arc<Mutex<BusInner>>);

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A `Kvps` handle onto a `FakeBus`.
pub struct FakeKvps {
    id: u64,
    bus: FakeBus,
    msg_tx: mpsc::UnboundedSender<KvpsMessage>,
}

impl FakeKvps {
    /// Open a handle onto `bus`, returning the receiver for messages
    /// delivered to channels this handle subscribes to.
    pub fn connect(bus: &FakeBus) -> (Self, MessageReceiver) {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        (
            Self {
                id,
                bus: bus.clone(),
                msg_tx,
            },
            msg_rx,
        )
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star, mut star_ti) = (None, 0usize);

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[async_trait]
impl Kvps for FakeKvps {
    async fn set(&self, key: &str, value: &str) -> Result<(), KvpsError> {
        let mut bus = self.bus.0.lock().unwrap();
        bus.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvpsError> {
        let mut bus = self.bus.0.lock().unwrap();
        bus.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvpsError> {
        let mut bus = self.bus.0.lock().unwrap();
        if let Some(entry) = bus.kv.get(key) {
            if entry.expires_at.map(|t| t < Instant::now()).unwrap_or(false) {
                bus.kv.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<(), KvpsError> {
        let mut bus = self.bus.0.lock().unwrap();
        bus.kv.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvpsError> {
        let mut bus = self.bus.0.lock().unwrap();
        let now = Instant::now();
        bus.kv
            .retain(|_, entry| entry.expires_at.map(|t| t >= now).unwrap_or(true));
        Ok(bus
            .kv
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvpsError> {
        let mut bus = self.bus.0.lock().unwrap();
        bus.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvpsError> {
        let mut bus = self.bus.0.lock().unwrap();
        if let Some(set) = bus.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                bus.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvpsError> {
        let bus = self.bus.0.lock().unwrap();
        Ok(bus
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvpsError> {
        let bus = self.bus.0.lock().unwrap();
        if let Some(subs) = bus.subscribers.get(channel) {
            for (_, tx) in subs {
                let _ = tx.send(KvpsMessage {
                    channel: channel.to_string(),
                    payload: message.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), KvpsError> {
        let mut bus = self.bus.0.lock().unwrap();
        let subs = bus.subscribers.entry(channel.to_string()).or_default();
        if !subs.iter().any(|(id, _)| *id == self.id) {
            subs.push((self.id, self.msg_tx.clone()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), KvpsError> {
        let mut bus = self.bus.0.lock().unwrap();
        if let Some(subs) = bus.subscribers.get_mut(channel) {
            subs.retain(|(id, _)| *id != self.id);
        }
        Ok(())
    }

    fn is_standalone(&self) -> bool {
        false
    }
}
