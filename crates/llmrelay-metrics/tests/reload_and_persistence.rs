use std::sync::Arc;
use std::time::Duration;

use llmrelay_common::Kind;
use llmrelay_metrics::{JsonlMetricsStore, MetricsManager, TokenUsage};

fn store_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("llmrelay-metrics-it-{name}-{}.jsonl", std::process::id()))
}

/// A manager backed by a real `JsonlMetricsStore` persists finalized
/// records, and a freshly constructed manager pointed at the same file
/// recovers request/success/failure counts after a simulated restart.
#[tokio::test]
async fn reload_from_store_restores_counters_after_restart() {
    let path = store_path("reload");
    let store: Arc<dyn llmrelay_metrics::MetricsStore> = Arc::new(JsonlMetricsStore::new(&path));

    let first = MetricsManager::new(Kind::Chat, 20, 0.5, Duration::from_secs(300)).with_store(store.clone());
    let id1 = first.record_request_connected("https://api.example.com", "k1", "gpt-4");
    first.record_request_finalize_success("https://api.example.com", "k1", id1, TokenUsage { input_tokens: 5, output_tokens: 2, ..Default::default() });
    let id2 = first.record_request_connected("https://api.example.com", "k1", "gpt-4");
    first.record_request_finalize_failure("https://api.example.com", "k1", id2);

    // Simulate a restart: a brand new manager, same backing file.
    let second = MetricsManager::new(Kind::Chat, 20, 0.5, Duration::from_secs(300)).with_store(store);
    second.reload_from_store();

    let stats = second.window_stats("https://api.example.com", "k1", Duration::from_secs(3600));
    assert_eq!(stats.request_count, 2);
    assert_eq!(stats.success_count, 1);
    assert_eq!(stats.fail_count, 1);
    assert_eq!(stats.input_tokens, 5);

    let _ = std::fs::remove_file(&path);
}

/// Records older than the 24h retention window are never reloaded, even
/// though they were durably persisted.
#[tokio::test]
async fn reload_ignores_records_past_the_retention_window() {
    let path = store_path("retention");
    let store: Arc<dyn llmrelay_metrics::MetricsStore> = Arc::new(JsonlMetricsStore::new(&path));

    // Write a record directly through the store, backdated past retention.
    store.add_record(&llmrelay_metrics::FinalizedRecord {
        metrics_key: llmrelay_metrics::metrics_key("https://stale.example.com", "k1"),
        base_url: "https://stale.example.com".to_string(),
        key: "k1".to_string(),
        model: "gpt-4".to_string(),
        ts: time::OffsetDateTime::now_utc() - time::Duration::hours(25),
        success: true,
        usage: TokenUsage::default(),
    });

    let manager = MetricsManager::new(Kind::Chat, 20, 0.5, Duration::from_secs(300)).with_store(store);
    manager.reload_from_store();

    let stats = manager.window_stats("https://stale.example.com", "k1", Duration::from_secs(3600));
    assert_eq!(stats.request_count, 0, "a record past 24h retention must not reappear after reload");

    let _ = std::fs::remove_file(&path);
}
