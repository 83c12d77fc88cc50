use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use time::OffsetDateTime;

use crate::error::{ConfigError, ConfigResult};
use crate::types::{ChannelStatus, UpdateOutcome, UpstreamConfig, UpstreamConfigPatch};

/// Invoked after every committed mutation so a caller (the binary) can
/// persist the whole config file. Config-file load/watch machinery itself
/// is an external concern; this is only the hook it attaches to.
pub trait ChangeSink: Send + Sync {
    fn on_change(&self, channels: &[UpstreamConfig]);
}

/// One kind's channel pool. All mutations are serialized through a single
/// writer lock; every exposed read is a deep clone, so callers can mutate
/// their copy freely without racing the live config.
pub struct ConfigManager {
    write_lock: Mutex<()>,
    snapshot: ArcSwap<Vec<UpstreamConfig>>,
    sink: Option<Arc<dyn ChangeSink>>,
}

impl ConfigManager {
    pub fn new(initial: Vec<UpstreamConfig>) -> Self {
        Self {
            write_lock: Mutex::new(()),
            snapshot: ArcSwap::from_pointee(initial),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Deep-cloned snapshot of every channel, in storage order.
    pub fn snapshot(&self) -> Vec<UpstreamConfig> {
        (**self.snapshot.load()).clone()
    }

    pub fn find(&self, name: &str) -> Option<UpstreamConfig> {
        self.snapshot().into_iter().find(|c| c.name == name)
    }

    fn commit(&self, _guard: &std::sync::MutexGuard<'_, ()>, channels: Vec<UpstreamConfig>) {
        self.snapshot.store(Arc::new(channels));
        if let Some(sink) = &self.sink {
            sink.on_change(&self.snapshot.load());
        }
    }

    pub fn add_channel(&self, mut channel: UpstreamConfig) -> ConfigResult<()> {
        let guard = self.write_lock.lock().unwrap();
        let mut channels = self.snapshot();
        if channels.iter().any(|c| c.name == channel.name) {
            return Err(ConfigError::DuplicateName(channel.name));
        }
        channel.api_keys = UpstreamConfig::dedup_keys(channel.api_keys);
        channel.base_urls = dedup_strings(channel.base_urls);
        channels.push(channel);
        self.commit(&guard, channels);
        Ok(())
    }

    pub fn remove_channel(&self, name: &str) -> ConfigResult<UpstreamConfig> {
        let guard = self.write_lock.lock().unwrap();
        let mut channels = self.snapshot();
        let idx = channels
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;
        let removed = channels.remove(idx);
        self.commit(&guard, channels);
        Ok(removed)
    }

    /// Partial patch; only `Some` fields in `patch` apply. Replacing
    /// `api_keys` diffs against the old set: removed keys move to
    /// `historical_api_keys`, provided keys already in history are
    /// lifted back to active. Single-key replacement signals the caller
    /// to reset that channel's circuit-breaker state.
    pub fn update_channel(
        &self,
        name: &str,
        patch: UpstreamConfigPatch,
    ) -> ConfigResult<UpdateOutcome> {
        let guard = self.write_lock.lock().unwrap();
        let mut channels = self.snapshot();
        let channel = channels
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;

        let mut outcome = UpdateOutcome::default();

        if let Some(v) = patch.service_type {
            channel.service_type = v;
        }
        if let Some(v) = patch.base_url {
            channel.base_url = v;
        }
        if let Some(v) = patch.base_urls {
            channel.base_urls = dedup_strings(v);
        }
        if let Some(new_keys) = patch.api_keys {
            let was_single_key = channel.api_keys.len() == 1;
            let new_keys = UpstreamConfig::dedup_keys(new_keys);
            let old_active: std::collections::HashSet<_> =
                channel.api_keys.iter().cloned().collect();
            let new_set: std::collections::HashSet<_> = new_keys.iter().cloned().collect();

            // Removed keys retire into history.
            for k in old_active.difference(&new_set) {
                if !channel.historical_api_keys.contains(k) {
                    channel.historical_api_keys.push(k.clone());
                }
            }
            // Keys reappearing from history are lifted back to active.
            channel
                .historical_api_keys
                .retain(|k| !new_set.contains(k));

            let replaced_single_key = was_single_key && new_keys.len() == 1 && new_keys != channel.api_keys;
            channel.api_keys = new_keys;

            if replaced_single_key {
                outcome.should_reset_metrics = true;
                if channel.status == ChannelStatus::Suspended {
                    channel.status = ChannelStatus::Active;
                }
            }
        }
        if let Some(v) = patch.model_mapping {
            channel.model_mapping = v;
        }
        if let Some(v) = patch.priority {
            channel.priority = v;
        }
        if let Some(v) = patch.low_quality {
            channel.low_quality = v;
        }
        if let Some(v) = patch.supported_models {
            channel.supported_models = v;
        }
        if let Some(v) = patch.insecure_skip_verify {
            channel.insecure_skip_verify = v;
        }
        if let Some(v) = patch.proxy {
            channel.proxy = v;
        }
        if let Some(v) = patch.custom_headers {
            channel.custom_headers = v;
        }
        if let Some(v) = patch.inject_dummy_thought_signature {
            channel.inject_dummy_thought_signature = v;
        }
        if let Some(v) = patch.strip_thought_signature {
            channel.strip_thought_signature = v;
        }

        self.commit(&guard, channels);
        Ok(outcome)
    }

    pub fn add_key(&self, name: &str, key: String) -> ConfigResult<()> {
        let guard = self.write_lock.lock().unwrap();
        let mut channels = self.snapshot();
        let channel = channels
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;
        channel.historical_api_keys.retain(|k| k != &key);
        if !channel.api_keys.contains(&key) {
            channel.api_keys.push(key);
        }
        self.commit(&guard, channels);
        Ok(())
    }

    /// Removes an active key, moving it to history.
    pub fn remove_key(&self, name: &str, key: &str) -> ConfigResult<()> {
        let guard = self.write_lock.lock().unwrap();
        let mut channels = self.snapshot();
        let channel = channels
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;
        let before = channel.api_keys.len();
        channel.api_keys.retain(|k| k != key);
        if channel.api_keys.len() == before {
            return Err(ConfigError::KeyNotFound(key.to_string(), name.to_string()));
        }
        if !channel.historical_api_keys.contains(&key.to_string()) {
            channel.historical_api_keys.push(key.to_string());
        }
        self.commit(&guard, channels);
        Ok(())
    }

    pub fn move_key_to_top(&self, name: &str, key: &str) -> ConfigResult<()> {
        self.reposition_key(name, key, true)
    }

    pub fn move_key_to_bottom(&self, name: &str, key: &str) -> ConfigResult<()> {
        self.reposition_key(name, key, false)
    }

    /// Moves `key` to the back of its channel's order. Used by the
    /// failover engine to deprioritize a quota-flagged key once a
    /// subsequent success has occurred on a different key.
    pub fn deprioritize_key(&self, name: &str, key: &str) -> ConfigResult<()> {
        self.move_key_to_bottom(name, key)
    }

    fn reposition_key(&self, name: &str, key: &str, to_top: bool) -> ConfigResult<()> {
        let guard = self.write_lock.lock().unwrap();
        let mut channels = self.snapshot();
        let channel = channels
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;
        let pos = channel
            .api_keys
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| ConfigError::KeyNotFound(key.to_string(), name.to_string()))?;
        let k = channel.api_keys.remove(pos);
        if to_top {
            channel.api_keys.insert(0, k);
        } else {
            channel.api_keys.push(k);
        }
        self.commit(&guard, channels);
        Ok(())
    }

    /// Rewrites priorities of the channels at `indices` to `1..N` in the
    /// order given. Rejects duplicate or out-of-range indices.
    pub fn reorder(&self, indices: &[usize]) -> ConfigResult<()> {
        let guard = self.write_lock.lock().unwrap();
        let mut channels = self.snapshot();

        let mut seen = std::collections::HashSet::new();
        if indices.iter().any(|i| *i >= channels.len() || !seen.insert(*i)) {
            return Err(ConfigError::InvalidReorder);
        }
        for (priority, &idx) in indices.iter().enumerate() {
            channels[idx].priority = (priority + 1) as u32;
        }
        self.commit(&guard, channels);
        Ok(())
    }

    /// Setting `Suspended` clears any live promotion on that channel.
    pub fn set_status(&self, name: &str, status: ChannelStatus) -> ConfigResult<()> {
        let guard = self.write_lock.lock().unwrap();
        let mut channels = self.snapshot();
        let channel = channels
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;
        channel.status = status;
        if status == ChannelStatus::Suspended {
            channel.promotion_until = None;
        }
        self.commit(&guard, channels);
        Ok(())
    }

    /// `duration > 0` sets `promotion_until = now + duration` and clears
    /// every other channel's promotion in this kind's pool; `duration`
    /// absent or non-positive clears this channel's promotion. At most
    /// one channel per kind may carry a live promotion.
    pub fn set_promotion(&self, name: &str, duration: Option<Duration>) -> ConfigResult<()> {
        let guard = self.write_lock.lock().unwrap();
        let mut channels = self.snapshot();
        if !channels.iter().any(|c| c.name == name) {
            return Err(ConfigError::NotFound(name.to_string()));
        }
        let until = duration
            .filter(|d| !d.is_zero())
            .map(|d| OffsetDateTime::now_utc() + d);
        for channel in channels.iter_mut() {
            channel.promotion_until = if channel.name == name { until } else { None };
        }
        self.commit(&guard, channels);
        Ok(())
    }
}

fn dedup_strings(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values.into_iter().filter(|v| seen.insert(v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceType;

    fn channel(name: &str, keys: &[&str]) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            service_type: ServiceType::OpenAi,
            base_url: "https://api.example.com".to_string(),
            base_urls: vec![],
            api_keys: keys.iter().map(|s| s.to_string()).collect(),
            historical_api_keys: vec![],
            model_mapping: Default::default(),
            priority: 0,
            status: ChannelStatus::Active,
            promotion_until: None,
            low_quality: false,
            supported_models: None,
            insecure_skip_verify: false,
            proxy: None,
            custom_headers: None,
            inject_dummy_thought_signature: false,
            strip_thought_signature: false,
        }
    }

    #[test]
    fn add_channel_rejects_duplicate_name() {
        let mgr = ConfigManager::new(vec![channel("a", &["k1"])]);
        let err = mgr.add_channel(channel("a", &["k2"])).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName(_)));
    }

    #[test]
    fn replacing_sole_key_resets_metrics_and_reactivates() {
        let mgr = ConfigManager::new(vec![channel("a", &["k1"])]);
        mgr.set_status("a", ChannelStatus::Suspended).unwrap();

        let outcome = mgr
            .update_channel(
                "a",
                UpstreamConfigPatch {
                    api_keys: Some(vec!["k2".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(outcome.should_reset_metrics);
        let snap = mgr.find("a").unwrap();
        assert_eq!(snap.status, ChannelStatus::Active);
        assert_eq!(snap.api_keys, vec!["k2".to_string()]);
        assert_eq!(snap.historical_api_keys, vec!["k1".to_string()]);
    }

    #[test]
    fn removed_key_moves_to_history_and_back() {
        let mgr = ConfigManager::new(vec![channel("a", &["k1", "k2"])]);
        mgr.remove_key("a", "k1").unwrap();
        assert_eq!(mgr.find("a").unwrap().historical_api_keys, vec!["k1".to_string()]);

        mgr.add_key("a", "k1".to_string()).unwrap();
        let snap = mgr.find("a").unwrap();
        assert!(snap.historical_api_keys.is_empty());
        assert_eq!(snap.api_keys, vec!["k2".to_string(), "k1".to_string()]);
    }

    #[test]
    fn only_one_channel_may_hold_promotion() {
        let mgr = ConfigManager::new(vec![channel("a", &["k1"]), channel("b", &["k1"])]);
        mgr.set_promotion("a", Some(Duration::from_secs(60))).unwrap();
        mgr.set_promotion("b", Some(Duration::from_secs(60))).unwrap();

        assert!(mgr.find("a").unwrap().promotion_until.is_none());
        assert!(mgr.find("b").unwrap().promotion_until.is_some());
    }

    #[test]
    fn reorder_rewrites_priority_as_1_based_rank() {
        let mgr = ConfigManager::new(vec![channel("a", &["k1"]), channel("b", &["k1"]), channel("c", &["k1"])]);
        mgr.reorder(&[2, 0, 1]).unwrap();
        let snap = mgr.snapshot();
        assert_eq!(snap[2].priority, 1);
        assert_eq!(snap[0].priority, 2);
        assert_eq!(snap[1].priority, 3);
    }

    #[test]
    fn reorder_rejects_duplicate_or_out_of_range() {
        let mgr = ConfigManager::new(vec![channel("a", &["k1"]), channel("b", &["k1"])]);
        assert!(matches!(mgr.reorder(&[0, 0]), Err(ConfigError::InvalidReorder)));
        assert!(matches!(mgr.reorder(&[0, 5]), Err(ConfigError::InvalidReorder)));
    }

    #[test]
    fn deprioritize_key_moves_it_to_the_back() {
        let mgr = ConfigManager::new(vec![channel("a", &["k1", "k2"])]);
        mgr.deprioritize_key("a", "k1").unwrap();
        assert_eq!(mgr.find("a").unwrap().api_keys, vec!["k2".to_string(), "k1".to_string()]);
    }
}
