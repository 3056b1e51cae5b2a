//! Media-group deduplication.
//!
//! A multi-attachment send arrives as one event per attachment. The first
//! event to claim `(source chat, group id)` handles the whole group; the
//! rest are dropped. Claims expire after a TTL so the map stays bounded.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::platform::ChatId;

pub struct MediaGroupGate {
    ttl: Duration,
    claims: Mutex<HashMap<(ChatId, String), Instant>>,
}

impl MediaGroupGate {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            claims: Mutex::new(HashMap::new()),
        }
    }

    /// True exactly once per `(chat, group_id)` within the TTL.
    pub fn claim_first(&self, chat: ChatId, group_id: &str) -> bool {
        let now = Instant::now();
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        claims.retain(|_, claimed| now.duration_since(*claimed) < self.ttl);

        match claims.entry((chat, group_id.to_string())) {
            Entry::Occupied(_) => {
                debug!(chat, group_id, "Media group already claimed");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    /// Drop expired claims. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        let before = claims.len();
        claims.retain(|_, claimed| now.duration_since(*claimed) < self.ttl);
        before - claims.len()
    }

    pub fn len(&self) -> usize {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
