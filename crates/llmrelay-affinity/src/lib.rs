//! §4.E Trace Affinity: a bounded TTL map from `(kind, user/conversation
//! id)` to the channel index that last served that conversation
//! successfully. Written only on a fully successful dispatch; read by
//! the scheduler as its second-highest-priority signal after promotion.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use llmrelay_common::Kind;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy)]
struct Entry {
    channel_index: usize,
    last_used_at: OffsetDateTime,
}

/// Distinct kinds never share affinity: every key is prefixed with the
/// kind, so a `(messages, "u1")` entry can't leak into `chat`'s lookups
/// even if the same conversation id is reused across surfaces.
fn affinity_key(kind: Kind, user_or_conversation_id: &str) -> String {
    format!("{kind}:{user_or_conversation_id}")
}

pub struct AffinityCache {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
}

impl AffinityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Only call after a dispatch that wrote a successful response to
    /// the client; cancelled or failed requests must never call this.
    pub fn set_preferred_channel(&self, kind: Kind, user_or_conversation_id: &str, channel_index: usize) {
        if user_or_conversation_id.is_empty() {
            return;
        }
        let key = affinity_key(kind, user_or_conversation_id);
        self.entries.write().unwrap().insert(
            key,
            Entry {
                channel_index,
                last_used_at: OffsetDateTime::now_utc(),
            },
        );
    }

    /// Returns the preferred channel index if present and not expired.
    /// A successful lookup renews the TTL (access renews it, same as a
    /// cache hit bumping an LRU entry).
    pub fn get_preferred_channel(&self, kind: Kind, user_or_conversation_id: &str) -> Option<usize> {
        if user_or_conversation_id.is_empty() {
            return None;
        }
        let key = affinity_key(kind, user_or_conversation_id);
        let ttl = time::Duration::try_from(self.ttl).unwrap_or(time::Duration::ZERO);
        let mut entries = self.entries.write().unwrap();
        let entry = entries.get_mut(&key)?;
        if OffsetDateTime::now_utc() - entry.last_used_at >= ttl {
            entries.remove(&key);
            return None;
        }
        entry.last_used_at = OffsetDateTime::now_utc();
        Some(entry.channel_index)
    }

    /// Drops every entry expired as of now. Intended to be called from a
    /// background sweeper; not required for correctness since
    /// `get_preferred_channel` self-evicts on read.
    pub fn sweep(&self) {
        let ttl = time::Duration::try_from(self.ttl).unwrap_or(time::Duration::ZERO);
        let now = OffsetDateTime::now_utc();
        self.entries
            .write()
            .unwrap()
            .retain(|_, entry| now - entry.last_used_at < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_returns_the_same_channel() {
        let cache = AffinityCache::new(Duration::from_secs(300));
        cache.set_preferred_channel(Kind::Messages, "conv-1", 2);
        assert_eq!(cache.get_preferred_channel(Kind::Messages, "conv-1"), Some(2));
    }

    #[test]
    fn distinct_kinds_do_not_share_affinity() {
        let cache = AffinityCache::new(Duration::from_secs(300));
        cache.set_preferred_channel(Kind::Messages, "conv-1", 2);
        assert_eq!(cache.get_preferred_channel(Kind::Chat, "conv-1"), None);
    }

    #[test]
    fn expired_entry_is_not_returned() {
        let cache = AffinityCache::new(Duration::from_millis(1));
        cache.set_preferred_channel(Kind::Chat, "conv-1", 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get_preferred_channel(Kind::Chat, "conv-1"), None);
    }

    #[test]
    fn empty_id_is_never_stored_or_returned() {
        let cache = AffinityCache::new(Duration::from_secs(300));
        cache.set_preferred_channel(Kind::Chat, "", 0);
        assert_eq!(cache.get_preferred_channel(Kind::Chat, ""), None);
    }
}
