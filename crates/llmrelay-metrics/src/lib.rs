mod cooldown;
mod jsonl_store;
mod key;
mod manager;
mod store;

pub use cooldown::CooldownCache;
pub use jsonl_store::JsonlMetricsStore;
pub use key::metrics_key;
pub use manager::{ActivityBucket, MetricsManager, WindowStats};
pub use store::{FinalizedRecord, MetricsStore, NoopMetricsStore, StoredRecord, TokenUsage};
