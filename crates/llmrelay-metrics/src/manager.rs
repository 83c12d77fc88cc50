use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use llmrelay_common::Kind;
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::key::metrics_key;
use crate::store::{FinalizedRecord, MetricsStore, NoopMetricsStore, TokenUsage};

const HISTORY_RETENTION: Duration = Duration::hours(24);
const CIRCUIT_MIN_SAMPLE_WINDOW: Duration = Duration::minutes(15);
const INACTIVE_EVICT_AFTER: Duration = Duration::hours(48);
const ACTIVITY_BUCKET_SECONDS: i64 = 6;
const ACTIVITY_BUCKET_COUNT: i64 = 150;

#[derive(Debug, Clone)]
struct RequestRecord {
    model: String,
    ts: OffsetDateTime,
    success: bool,
    usage: TokenUsage,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WindowStats {
    pub request_count: u64,
    pub success_count: u64,
    pub fail_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl WindowStats {
    fn add(&mut self, other: WindowStats) {
        self.request_count += other.request_count;
        self.success_count += other.success_count;
        self.fail_count += other.fail_count;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ActivityBucket {
    pub bucket_start: OffsetDateTime,
    pub count: u64,
}

struct KeyEntry {
    base_url: String,
    key: String,
    request_count: u64,
    success_count: u64,
    fail_count: u64,
    consecutive_failures: u32,
    active_requests: i64,
    last_success_at: Option<OffsetDateTime>,
    last_failure_at: Option<OffsetDateTime>,
    circuit_broken_at: Option<OffsetDateTime>,
    window: VecDeque<bool>,
    history: Vec<RequestRecord>,
    pending_history_idx: HashMap<u64, usize>,
}

impl KeyEntry {
    fn new(base_url: String, key: String) -> Self {
        Self {
            base_url,
            key,
            request_count: 0,
            success_count: 0,
            fail_count: 0,
            consecutive_failures: 0,
            active_requests: 0,
            last_success_at: None,
            last_failure_at: None,
            circuit_broken_at: None,
            window: VecDeque::new(),
            history: Vec::new(),
            pending_history_idx: HashMap::new(),
        }
    }

    fn push_window(&mut self, ok: bool, window_size: usize) {
        self.window.push_back(ok);
        while self.window.len() > window_size {
            self.window.pop_front();
        }
    }

    fn window_failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn min_samples(window_size: usize) -> usize {
        (window_size / 2).max(3)
    }

    /// Evicts history rows older than 24h and fixes up `pending_history_idx`
    /// in the same pass, since the map shares indices with the slice.
    fn evict_old_records(&mut self, now: OffsetDateTime) {
        let cutoff = now - HISTORY_RETENTION;
        let mut removed = 0usize;
        while let Some(front) = self.history.first() {
            if front.ts >= cutoff {
                break;
            }
            self.history.remove(0);
            removed += 1;
        }
        if removed == 0 {
            return;
        }
        self.pending_history_idx = self
            .pending_history_idx
            .iter()
            .filter_map(|(id, idx)| {
                if *idx < removed {
                    None
                } else {
                    Some((*id, idx - removed))
                }
            })
            .collect();
    }
}

pub struct MetricsManager {
    kind: Kind,
    window_size: usize,
    failure_rate_threshold: f64,
    circuit_recovery: StdDuration,
    entries: RwLock<HashMap<String, KeyEntry>>,
    next_request_id: AtomicU64,
    store: Arc<dyn MetricsStore>,
}

impl MetricsManager {
    pub fn new(kind: Kind, window_size: usize, failure_rate_threshold: f64, circuit_recovery: StdDuration) -> Self {
        Self {
            kind,
            window_size,
            failure_rate_threshold,
            circuit_recovery,
            entries: RwLock::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            store: Arc::new(NoopMetricsStore),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn MetricsStore>) -> Self {
        self.store = store;
        self
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Appended at TCP-connect time with a provisional `success=true`
    /// entry. Request counters are *not* incremented here — only the
    /// finalize calls below increment them, so a failover retry that
    /// connects several times is never double-counted.
    pub fn record_request_connected(&self, base_url: &str, key: &str, model: &str) -> u64 {
        let mk = metrics_key(base_url, key);
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .entry(mk)
            .or_insert_with(|| KeyEntry::new(base_url.to_string(), key.to_string()));
        let now = OffsetDateTime::now_utc();
        entry.evict_old_records(now);
        let idx = entry.history.len();
        entry.history.push(RequestRecord {
            model: model.to_string(),
            ts: now,
            success: true,
            usage: TokenUsage::default(),
        });
        entry.pending_history_idx.insert(request_id, idx);
        request_id
    }

    pub fn record_request_finalize_success(&self, base_url: &str, key: &str, request_id: u64, usage: TokenUsage) {
        let mk = metrics_key(base_url, key);
        let mut entries = self.entries.write().unwrap();
        let Some(entry) = entries.get_mut(&mk) else { return };
        let now = OffsetDateTime::now_utc();

        let model = if let Some(idx) = entry.pending_history_idx.remove(&request_id) {
            if let Some(record) = entry.history.get_mut(idx) {
                record.success = true;
                record.usage = usage;
                record.model.clone()
            } else {
                String::new()
            }
        } else {
            String::new()
        };

        entry.request_count += 1;
        entry.success_count += 1;
        entry.consecutive_failures = 0;
        entry.last_success_at = Some(now);
        if entry.circuit_broken_at.take().is_some() {
            info!(base_url, key, "circuit breaker cleared by success");
        }
        entry.push_window(true, self.window_size);

        self.store.add_record(&FinalizedRecord {
            metrics_key: mk,
            base_url: base_url.to_string(),
            key: key.to_string(),
            model,
            ts: now,
            success: true,
            usage,
        });
    }

    pub fn record_request_finalize_failure(&self, base_url: &str, key: &str, request_id: u64) {
        let mk = metrics_key(base_url, key);
        let mut entries = self.entries.write().unwrap();
        let Some(entry) = entries.get_mut(&mk) else { return };
        let now = OffsetDateTime::now_utc();

        let model = if let Some(idx) = entry.pending_history_idx.remove(&request_id) {
            if let Some(record) = entry.history.get_mut(idx) {
                record.success = false;
                record.usage = TokenUsage::default();
                record.model.clone()
            } else {
                String::new()
            }
        } else {
            String::new()
        };

        entry.request_count += 1;
        entry.fail_count += 1;
        entry.consecutive_failures += 1;
        entry.last_failure_at = Some(now);
        entry.push_window(false, self.window_size);

        let min_samples = KeyEntry::min_samples(self.window_size);
        if entry.circuit_broken_at.is_none()
            && entry.window.len() >= min_samples
            && entry.window_failure_rate() >= self.failure_rate_threshold
        {
            entry.circuit_broken_at = Some(now);
            info!(base_url, key, "circuit breaker tripped");
        }

        self.store.add_record(&FinalizedRecord {
            metrics_key: mk,
            base_url: base_url.to_string(),
            key: key.to_string(),
            model,
            ts: now,
            success: false,
            usage: TokenUsage::default(),
        });
    }

    /// Counts toward volume only. Does not touch the sliding window,
    /// circuit breaker, or consecutive-failure counter, and removes the
    /// provisional history row instead of finalizing it.
    pub fn record_request_finalize_client_cancel(&self, base_url: &str, key: &str, request_id: u64) {
        let mk = metrics_key(base_url, key);
        let mut entries = self.entries.write().unwrap();
        let Some(entry) = entries.get_mut(&mk) else { return };

        entry.request_count += 1;

        if let Some(idx) = entry.pending_history_idx.remove(&request_id) {
            if idx < entry.history.len() {
                entry.history.remove(idx);
                for v in entry.pending_history_idx.values_mut() {
                    if *v > idx {
                        *v -= 1;
                    }
                }
            }
        }
    }

    pub fn record_request_start(&self, base_url: &str, key: &str) {
        let mk = metrics_key(base_url, key);
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .entry(mk)
            .or_insert_with(|| KeyEntry::new(base_url.to_string(), key.to_string()));
        entry.active_requests += 1;
    }

    pub fn record_request_end(&self, base_url: &str, key: &str) {
        let mk = metrics_key(base_url, key);
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get_mut(&mk) {
            entry.active_requests -= 1;
        }
    }

    /// True only if the window has enough samples to be meaningful and
    /// its failure rate has crossed the threshold. Prevents a brand new
    /// key from being flagged on its first failed request.
    pub fn should_suspend_key(&self, base_url: &str, key: &str) -> bool {
        let mk = metrics_key(base_url, key);
        let entries = self.entries.read().unwrap();
        let Some(entry) = entries.get(&mk) else { return false };
        entry.window.len() >= KeyEntry::min_samples(self.window_size)
            && entry.window_failure_rate() >= self.failure_rate_threshold
    }

    pub fn is_circuit_broken(&self, base_url: &str, key: &str) -> bool {
        let mk = metrics_key(base_url, key);
        let entries = self.entries.read().unwrap();
        entries
            .get(&mk)
            .map(|e| e.circuit_broken_at.is_some())
            .unwrap_or(false)
    }

    /// Aggregates sliding-window samples across the given (base_url,key)
    /// pairs, honoring the same minimum-samples guard as
    /// `should_suspend_key`. Used for channel-wide health checks.
    pub fn is_healthy_with_keys(&self, pairs: &[(String, String)]) -> bool {
        let entries = self.entries.read().unwrap();
        let mut total = 0usize;
        let mut failures = 0usize;
        for (base_url, key) in pairs {
            let mk = metrics_key(base_url, key);
            if let Some(entry) = entries.get(&mk) {
                total += entry.window.len();
                failures += entry.window.iter().filter(|ok| !**ok).count();
            }
        }
        if total < KeyEntry::min_samples(self.window_size) {
            return true;
        }
        (failures as f64 / total as f64) < self.failure_rate_threshold
    }

    /// Channel-aggregate failure rate across active and historical keys,
    /// used by the scheduler's degraded-fallback step. `None` when no
    /// samples exist yet.
    pub fn channel_failure_rate(&self, pairs: &[(String, String)]) -> Option<f64> {
        let entries = self.entries.read().unwrap();
        let mut total = 0usize;
        let mut failures = 0usize;
        for (base_url, key) in pairs {
            let mk = metrics_key(base_url, key);
            if let Some(entry) = entries.get(&mk) {
                total += entry.window.len();
                failures += entry.window.iter().filter(|ok| !**ok).count();
            }
        }
        if total == 0 {
            None
        } else {
            Some(failures as f64 / total as f64)
        }
    }

    pub fn window_stats(&self, base_url: &str, key: &str, window: Duration) -> WindowStats {
        let mk = metrics_key(base_url, key);
        let entries = self.entries.read().unwrap();
        let Some(entry) = entries.get(&mk) else {
            return WindowStats::default();
        };
        Self::stats_since(&entry.history, OffsetDateTime::now_utc() - window)
    }

    fn stats_since(history: &[RequestRecord], since: OffsetDateTime) -> WindowStats {
        let mut stats = WindowStats::default();
        for record in history.iter().filter(|r| r.ts >= since) {
            stats.request_count += 1;
            if record.success {
                stats.success_count += 1;
                stats.input_tokens += record.usage.input_tokens;
                stats.output_tokens += record.usage.output_tokens;
                stats.cache_creation_tokens += record.usage.cache_creation_tokens;
                stats.cache_read_tokens += record.usage.cache_read_tokens;
            } else {
                stats.fail_count += 1;
            }
        }
        stats
    }

    /// The four fixed query windows from the metrics store's operation
    /// contract.
    pub fn fixed_window_stats(&self, base_url: &str, key: &str) -> [(Duration, WindowStats); 4] {
        [
            (Duration::minutes(15), self.window_stats(base_url, key, Duration::minutes(15))),
            (Duration::hours(1), self.window_stats(base_url, key, Duration::hours(1))),
            (Duration::hours(6), self.window_stats(base_url, key, Duration::hours(6))),
            (Duration::hours(24), self.window_stats(base_url, key, Duration::hours(24))),
        ]
    }

    /// Sums a single logical key's stats across every base URL it has
    /// been dispatched against.
    pub fn multi_url_stats(&self, key: &str, base_urls: &[String], window: Duration) -> WindowStats {
        let mut total = WindowStats::default();
        for base_url in base_urls {
            total.add(self.window_stats(base_url, key, window));
        }
        total
    }

    /// Aggregates over every (base_url,key) pair the channel currently
    /// owns, active keys plus historical ones (history counts toward
    /// totals though not toward the health check above).
    pub fn channel_stats(&self, pairs: &[(String, String)], window: Duration) -> WindowStats {
        let mut total = WindowStats::default();
        for (base_url, key) in pairs {
            total.add(self.window_stats(base_url, key, window));
        }
        total
    }

    /// 150 buckets of 6 seconds (15 minutes), bucket-aligned to absolute
    /// clock boundaries so repeated queries agree on past buckets.
    pub fn recent_activity(&self, base_url: &str, key: &str) -> Vec<ActivityBucket> {
        let mk = metrics_key(base_url, key);
        let entries = self.entries.read().unwrap();
        let Some(entry) = entries.get(&mk) else { return Vec::new() };

        let now = OffsetDateTime::now_utc();
        let now_unix = now.unix_timestamp();
        let window_start_unix = now_unix - ACTIVITY_BUCKET_COUNT * ACTIVITY_BUCKET_SECONDS;
        let aligned_start = floor_to(window_start_unix, ACTIVITY_BUCKET_SECONDS);

        let mut buckets: Vec<ActivityBucket> = (0..ACTIVITY_BUCKET_COUNT)
            .map(|i| ActivityBucket {
                bucket_start: OffsetDateTime::from_unix_timestamp(
                    aligned_start + i * ACTIVITY_BUCKET_SECONDS,
                )
                .unwrap(),
                count: 0,
            })
            .collect();

        for record in &entry.history {
            let ts = record.ts.unix_timestamp();
            if ts < aligned_start {
                continue;
            }
            let bucket_idx = (floor_to(ts, ACTIVITY_BUCKET_SECONDS) - aligned_start) / ACTIVITY_BUCKET_SECONDS;
            if let Some(b) = usize::try_from(bucket_idx).ok().and_then(|i| buckets.get_mut(i)) {
                b.count += 1;
            }
        }
        buckets
    }

    /// Historical time series with a caller-chosen `(duration, interval)`,
    /// clamped per the boundary rules: `interval < 1m` clamps to `1m`,
    /// `duration > 24h` clamps to `24h`.
    pub fn history_series(
        &self,
        base_url: &str,
        key: &str,
        duration: Duration,
        interval: Duration,
    ) -> Vec<ActivityBucket> {
        let duration = duration.min(Duration::hours(24));
        let interval = interval.max(Duration::minutes(1));
        let interval_secs = interval.whole_seconds().max(60);

        let mk = metrics_key(base_url, key);
        let entries = self.entries.read().unwrap();
        let Some(entry) = entries.get(&mk) else { return Vec::new() };

        let now_unix = OffsetDateTime::now_utc().unix_timestamp();
        let span_secs = duration.whole_seconds().max(interval_secs);
        let bucket_count = (span_secs / interval_secs).max(1);
        let window_start = now_unix - bucket_count * interval_secs;
        let aligned_start = floor_to(window_start, interval_secs);

        let mut buckets: Vec<ActivityBucket> = (0..bucket_count)
            .map(|i| ActivityBucket {
                bucket_start: OffsetDateTime::from_unix_timestamp(aligned_start + i * interval_secs).unwrap(),
                count: 0,
            })
            .collect();

        for record in &entry.history {
            let ts = record.ts.unix_timestamp();
            if ts < aligned_start {
                continue;
            }
            let idx = (floor_to(ts, interval_secs) - aligned_start) / interval_secs;
            if let Some(b) = usize::try_from(idx).ok().and_then(|i| buckets.get_mut(i)) {
                b.count += 1;
            }
        }
        buckets
    }

    /// Removes exactly the metrics entries for these pairs. Pairs still
    /// referenced by another surviving channel are left untouched by
    /// construction — the caller only passes a departing channel's
    /// *exclusive* pairs.
    pub fn delete_channel_metrics(&self, pairs: &[(String, String)]) {
        let keys: Vec<String> = pairs
            .iter()
            .map(|(base_url, key)| metrics_key(base_url, key))
            .collect();
        {
            let mut entries = self.entries.write().unwrap();
            for mk in &keys {
                entries.remove(mk);
            }
        }
        const BATCH: usize = 500;
        for chunk in keys.chunks(BATCH) {
            self.store.delete_by_metrics_keys(chunk);
        }
    }

    /// Reloads records younger than 24h from persistence. Counters and
    /// `last_success_at`/`last_failure_at` are recomputed from the
    /// reloaded rows, but the sliding window is rebuilt only from rows
    /// younger than 15 minutes, so an outage from hours ago can't trap a
    /// channel in "unhealthy" forever across a restart.
    pub fn reload_from_store(&self) {
        let since = OffsetDateTime::now_utc() - HISTORY_RETENTION;
        let records = self.store.load_since(since);
        let mut entries = self.entries.write().unwrap();
        for record in records {
            let entry = entries
                .entry(record.metrics_key.clone())
                .or_insert_with(|| KeyEntry::new(record.base_url.clone(), record.key.clone()));
            entry.request_count += 1;
            if record.success {
                entry.success_count += 1;
                if entry.last_success_at.map(|t| t < record.ts).unwrap_or(true) {
                    entry.last_success_at = Some(record.ts);
                }
            } else {
                entry.fail_count += 1;
                if entry.last_failure_at.map(|t| t < record.ts).unwrap_or(true) {
                    entry.last_failure_at = Some(record.ts);
                }
            }
            if OffsetDateTime::now_utc() - record.ts < CIRCUIT_MIN_SAMPLE_WINDOW {
                entry.push_window(record.success, self.window_size);
            }
            entry.history.push(RequestRecord {
                model: record.model,
                ts: record.ts,
                success: record.success,
                usage: record.usage,
            });
        }
    }

    /// Minute tick: clears expired circuit breakers. Hour tick: drops
    /// keys that have had no activity in 48h.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let minute_self = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_secs(60));
            loop {
                ticker.tick().await;
                minute_self.sweep_circuit_breakers();
            }
        });

        let hour_self = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_secs(3600));
            loop {
                ticker.tick().await;
                hour_self.sweep_inactive_keys();
            }
        });
    }

    fn sweep_circuit_breakers(&self) {
        let recovery = Duration::try_from(self.circuit_recovery).unwrap_or(Duration::ZERO);
        let now = OffsetDateTime::now_utc();
        let mut entries = self.entries.write().unwrap();
        for entry in entries.values_mut() {
            entry.evict_old_records(now);
            if let Some(broken_at) = entry.circuit_broken_at {
                if now - broken_at > recovery {
                    entry.circuit_broken_at = None;
                }
            }
        }
    }

    fn sweep_inactive_keys(&self) {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.entries.write().unwrap();
        entries.retain(|_, entry| {
            let last_activity = match (entry.last_success_at, entry.last_failure_at) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            };
            match last_activity {
                Some(t) => now - t < INACTIVE_EVICT_AFTER,
                None => true,
            }
        });
    }
}

fn floor_to(value: i64, step: i64) -> i64 {
    value.div_euclid(step) * step
}
