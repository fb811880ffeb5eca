//! TTL-bounded session affinity map.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Where the affinity key comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinitySource {
    Disabled,
    SessionId,
    UserId,
    ClientIp,
    Header(String),
}

pub struct AffinityMap {
    entries: DashMap<String, (String, Instant)>,
    ttl: Duration,
}

impl AffinityMap {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// The instance previously bound to this key, if the binding is fresh.
    pub fn get(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        let (instance_id, stored_at) = entry.value();
        if stored_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(instance_id.clone())
    }

    pub fn bind(&self, key: &str, instance_id: &str) {
        self.entries
            .insert(key.to_string(), (instance_id.to_string(), Instant::now()));
    }

    pub fn forget_instance(&self, instance_id: &str) {
        self.entries
            .retain(|_, (bound, _)| bound.as_str() != instance_id);
    }

    /// Drop expired entries; called from a background loop.
    pub fn sweep(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, (_, stored_at)| stored_at.elapsed() <= ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
