//! §4.D URL Manager: per-channel latency/failure scoring of a channel's
//! base URLs, returning an ordered probing list (healthy first, then by
//! latency) without ever blocking on network I/O itself — scores are
//! only ever updated by the failover engine after a real attempt.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use llmrelay_common::Kind;

/// A URL is demoted below its healthy peers once it accumulates this many
/// consecutive failures; a single success clears the counter.
const DEMOTE_AFTER_CONSECUTIVE_FAILURES: u32 = 2;

#[derive(Debug, Clone, Copy, Default)]
struct UrlScore {
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    /// Exponentially-weighted moving average latency in milliseconds,
    /// `None` until the first measured success.
    latency_ewma_ms: Option<f64>,
}

impl UrlScore {
    fn is_healthy(&self) -> bool {
        self.consecutive_failures < DEMOTE_AFTER_CONSECUTIVE_FAILURES
    }

    fn record_success(&mut self, latency: Option<Duration>) {
        self.successes += 1;
        self.consecutive_failures = 0;
        if let Some(latency) = latency {
            let ms = latency.as_secs_f64() * 1000.0;
            self.latency_ewma_ms = Some(match self.latency_ewma_ms {
                Some(prev) => prev * 0.7 + ms * 0.3,
                None => ms,
            });
        }
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.consecutive_failures += 1;
    }
}

/// One base URL annotated with its original position in the channel's
/// configured URL list, in the order the failover engine should probe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedUrl {
    pub url: String,
    pub original_index: usize,
}

pub struct UrlManager {
    entries: RwLock<HashMap<(Kind, usize), HashMap<String, UrlScore>>>,
}

impl Default for UrlManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlManager {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns `base_urls` reordered: healthy URLs first (lower latency
    /// first among them, unmeasured URLs after measured ones), demoted
    /// URLs last. Never touches the network; purely a sort over
    /// previously recorded outcomes.
    pub fn get_sorted_urls(&self, kind: Kind, channel_index: usize, base_urls: &[String]) -> Vec<RankedUrl> {
        let entries = self.entries.read().unwrap();
        let scores = entries.get(&(kind, channel_index));

        let mut ranked: Vec<(usize, &String, UrlScore)> = base_urls
            .iter()
            .enumerate()
            .map(|(i, url)| {
                let score = scores.and_then(|m| m.get(url)).copied().unwrap_or_default();
                (i, url, score)
            })
            .collect();

        ranked.sort_by(|a, b| {
            let (_, _, sa) = a;
            let (_, _, sb) = b;
            match (sa.is_healthy(), sb.is_healthy()) {
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                _ => match (sa.latency_ewma_ms, sb.latency_ewma_ms) {
                    (Some(la), Some(lb)) => la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                },
            }
        });

        ranked
            .into_iter()
            .map(|(original_index, url, _)| RankedUrl {
                url: url.clone(),
                original_index,
            })
            .collect()
    }

    pub fn mark_success(&self, kind: Kind, channel_index: usize, url: &str, latency: Option<Duration>) {
        let mut entries = self.entries.write().unwrap();
        let scores = entries.entry((kind, channel_index)).or_default();
        scores.entry(url.to_string()).or_default().record_success(latency);
    }

    pub fn mark_failure(&self, kind: Kind, channel_index: usize, url: &str) {
        let mut entries = self.entries.write().unwrap();
        let scores = entries.entry((kind, channel_index)).or_default();
        scores.entry(url.to_string()).or_default().record_failure();
    }

    /// Forgets all scoring for a channel, e.g. after it's been edited and
    /// its base URLs may no longer mean the same endpoints.
    pub fn invalidate_channel(&self, kind: Kind, channel_index: usize) {
        self.entries.write().unwrap().remove(&(kind, channel_index));
    }
}
