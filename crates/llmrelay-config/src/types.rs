use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// The upstream dialect a channel speaks. Distinct from the inbound
/// `Kind` (the surface a request arrived on) — a `messages` inbound
/// request may be served by a `gemini`-dialect channel via translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Claude,
    OpenAi,
    Gemini,
    Responses,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    Suspended,
    Disabled,
}

/// An addressable backend: one named upstream endpoint within a kind's
/// channel pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub service_type: ServiceType,
    pub base_url: String,
    #[serde(default)]
    pub base_urls: Vec<String>,
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Retired keys, kept only so metrics aggregation across key
    /// rotation stays stable. Disjoint from `api_keys`.
    #[serde(default)]
    pub historical_api_keys: Vec<String>,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// Lower is higher priority. `0` means "use array index as priority".
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_status")]
    pub status: ChannelStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub promotion_until: Option<OffsetDateTime>,
    #[serde(default)]
    pub low_quality: bool,
    #[serde(default)]
    pub supported_models: Option<Vec<String>>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub custom_headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub inject_dummy_thought_signature: bool,
    #[serde(default)]
    pub strip_thought_signature: bool,
}

fn default_status() -> ChannelStatus {
    ChannelStatus::Active
}

impl UpstreamConfig {
    /// All base URLs this channel may be dispatched against, primary first.
    pub fn all_base_urls(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(1 + self.base_urls.len());
        out.push(self.base_url.clone());
        for u in &self.base_urls {
            if u != &self.base_url {
                out.push(u.clone());
            }
        }
        out
    }

    /// Whether `model` is permitted on this channel, honoring a `*` glob
    /// suffix in `supported_models` entries. An absent whitelist permits
    /// everything.
    pub fn supports_model(&self, model: &str) -> bool {
        let Some(list) = &self.supported_models else {
            return true;
        };
        list.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => model.starts_with(prefix),
            None => pattern == model,
        })
    }

    pub fn dedup_keys(keys: Vec<String>) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        keys.into_iter().filter(|k| seen.insert(k.clone())).collect()
    }
}

/// Partial patch applied to an existing channel; only `Some` fields apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamConfigPatch {
    pub service_type: Option<ServiceType>,
    pub base_url: Option<String>,
    pub base_urls: Option<Vec<String>>,
    pub api_keys: Option<Vec<String>>,
    pub model_mapping: Option<HashMap<String, String>>,
    pub priority: Option<u32>,
    pub low_quality: Option<bool>,
    pub supported_models: Option<Option<Vec<String>>>,
    pub insecure_skip_verify: Option<bool>,
    pub proxy: Option<Option<String>>,
    pub custom_headers: Option<Option<HashMap<String, String>>>,
    pub inject_dummy_thought_signature: Option<bool>,
    pub strip_thought_signature: Option<bool>,
}

/// Outcome of `update_channel`, carrying the circuit-breaker reset signal
/// spec'd for single-key replacement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub should_reset_metrics: bool,
}
