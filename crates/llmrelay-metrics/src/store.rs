use time::OffsetDateTime;

/// Token usage extracted (or estimated) from an upstream 2xx response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    /// Set when the adapter had to estimate rather than read usage
    /// straight off the upstream payload, so billing analyses can
    /// exclude guessed figures.
    pub estimated: bool,
}

/// One finalized request, as handed to an optional persistence backend.
/// This is the only shape the metrics store knows about; how (or
/// whether) it is durably stored is entirely up to the implementation.
#[derive(Debug, Clone)]
pub struct FinalizedRecord {
    pub metrics_key: String,
    pub base_url: String,
    pub key: String,
    pub model: String,
    pub ts: OffsetDateTime,
    pub success: bool,
    pub usage: TokenUsage,
}

/// A record reloaded from persistence at boot time.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub metrics_key: String,
    pub base_url: String,
    pub key: String,
    pub model: String,
    pub ts: OffsetDateTime,
    pub success: bool,
    pub usage: TokenUsage,
}

/// Optional persistence for metrics history. The in-memory store is
/// fully functional without one; a `MetricsStore` only extends its
/// lifetime past process restarts. Runtime request handling never
/// blocks on this trait — finalized records are handed off, and boot
/// reload is the only synchronous read path.
pub trait MetricsStore: Send + Sync {
    fn add_record(&self, record: &FinalizedRecord);

    /// Deletes rows for exactly these metrics keys. Call sites are
    /// expected to batch large key sets to avoid parameter-limit bugs
    /// in SQL-backed implementations.
    fn delete_by_metrics_keys(&self, keys: &[String]);

    /// Records younger than `since`, used to rebuild in-memory state at
    /// boot. Implementations with no persistence simply return empty.
    fn load_since(&self, since: OffsetDateTime) -> Vec<StoredRecord>;
}

pub struct NoopMetricsStore;

impl MetricsStore for NoopMetricsStore {
    fn add_record(&self, _record: &FinalizedRecord) {}
    fn delete_by_metrics_keys(&self, _keys: &[String]) {}
    fn load_since(&self, _since: OffsetDateTime) -> Vec<StoredRecord> {
        Vec::new()
    }
}
