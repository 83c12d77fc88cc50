use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use llmrelay_common::Kind;
use time::OffsetDateTime;

#[derive(Debug, Clone)]
struct CooldownEntry {
    failures: u32,
    marked_at: OffsetDateTime,
}

/// Short-lived "this key just failed, skip it" marks, orthogonal to the
/// metrics store's circuit breaker: this is advisory and recovers in
/// well under a minute in the common case, while the circuit breaker
/// tracks a sustained failure rate over the sliding window.
pub struct CooldownCache {
    entries: RwLock<HashMap<(Kind, String), CooldownEntry>>,
    base_recovery: StdDuration,
    max_failure_count: u32,
}

impl CooldownCache {
    pub fn new(base_recovery: StdDuration, max_failure_count: u32) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            base_recovery,
            max_failure_count,
        }
    }

    pub fn mark_key_as_failed(&self, kind: Kind, key: &str) {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .entry((kind, key.to_string()))
            .or_insert(CooldownEntry {
                failures: 0,
                marked_at: OffsetDateTime::now_utc(),
            });
        entry.failures += 1;
        entry.marked_at = OffsetDateTime::now_utc();
    }

    pub fn is_key_failed(&self, kind: Kind, key: &str) -> bool {
        let entries = self.entries.read().unwrap();
        let Some(entry) = entries.get(&(kind, key.to_string())) else {
            return false;
        };
        let recovery = self.recovery_time(entry.failures);
        OffsetDateTime::now_utc() - entry.marked_at < recovery
    }

    /// Recovery time doubles once the failure counter exceeds
    /// `max_failure_count`, so a persistently bad key gets pushed
    /// further back each time instead of being retried every minute.
    fn recovery_time(&self, failures: u32) -> time::Duration {
        let base = time::Duration::try_from(self.base_recovery).unwrap_or(time::Duration::ZERO);
        if failures > self.max_failure_count {
            base * 2
        } else {
            base
        }
    }

    fn sweep(&self) {
        let mut entries = self.entries.write().unwrap();
        let now = OffsetDateTime::now_utc();
        entries.retain(|_, entry| now - entry.marked_at < self.recovery_time(entry.failures));
    }

    /// Spawns the once-a-minute sweeper. Requires a Tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_secs(60));
            loop {
                ticker.tick().await;
                this.sweep();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_key_is_not_failed() {
        let cache = CooldownCache::new(StdDuration::from_secs(60), 3);
        assert!(!cache.is_key_failed(Kind::Chat, "k1"));
    }

    #[test]
    fn marked_key_is_failed_until_recovery() {
        let cache = CooldownCache::new(StdDuration::from_secs(60), 3);
        cache.mark_key_as_failed(Kind::Chat, "k1");
        assert!(cache.is_key_failed(Kind::Chat, "k1"));
    }

    #[test]
    fn distinct_kinds_do_not_share_cooldown() {
        let cache = CooldownCache::new(StdDuration::from_secs(60), 3);
        cache.mark_key_as_failed(Kind::Chat, "k1");
        assert!(!cache.is_key_failed(Kind::Messages, "k1"));
    }

    #[test]
    fn recovery_time_doubles_past_threshold() {
        let cache = CooldownCache::new(StdDuration::from_secs(10), 2);
        for _ in 0..3 {
            cache.mark_key_as_failed(Kind::Chat, "k1");
        }
        let entries = cache.entries.read().unwrap();
        let entry = entries.get(&(Kind::Chat, "k1".to_string())).unwrap();
        assert_eq!(entry.failures, 3);
        assert_eq!(cache.recovery_time(entry.failures), time::Duration::seconds(20));
    }
}
