use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use llmrelay_affinity::AffinityCache;
use llmrelay_common::{GlobalConfig, Kind};
use llmrelay_config::{ChangeSink, ConfigManager, UpstreamConfig};
use llmrelay_metrics::{CooldownCache, MetricsManager};
use llmrelay_urlmgr::UrlManager;

use crate::upstream_client::UpstreamClient;

const METRICS_WINDOW_SIZE: usize = 20;
const FAILURE_RATE_THRESHOLD: f64 = 0.5;
const CIRCUIT_RECOVERY: Duration = Duration::from_secs(300);
const COOLDOWN_BASE_RECOVERY: Duration = Duration::from_secs(60);
const COOLDOWN_MAX_FAILURES: u32 = 3;
const AFFINITY_TTL: Duration = Duration::from_secs(900);

/// Every kind's channel pool at startup, as parsed from the config file's
/// `upstream` / `responsesUpstream` / `geminiUpstream` / `chatUpstream`
/// arrays (§6).
#[derive(Debug, Default, Clone)]
pub struct InitialChannels {
    pub messages: Vec<UpstreamConfig>,
    pub responses: Vec<UpstreamConfig>,
    pub gemini: Vec<UpstreamConfig>,
    pub chat: Vec<UpstreamConfig>,
}

/// One kind's config manager plus its metrics manager. Distinct kinds
/// never share a channel pool or a metrics namespace.
pub struct KindRuntime {
    pub config: ConfigManager,
    pub metrics: Arc<MetricsManager>,
}

impl KindRuntime {
    fn new(kind: Kind, channels: Vec<UpstreamConfig>, sink: Option<Arc<dyn ChangeSink>>) -> Self {
        let metrics = Arc::new(MetricsManager::new(
            kind,
            METRICS_WINDOW_SIZE,
            FAILURE_RATE_THRESHOLD,
            CIRCUIT_RECOVERY,
        ));
        let mut config = ConfigManager::new(channels);
        if let Some(sink) = sink {
            config = config.with_sink(sink);
        }
        Self { config, metrics }
    }
}

/// The process-wide dependency struct: four per-kind runtimes plus the
/// shared URL manager, affinity cache, key cooldown cache, and upstream
/// client pool. Per §9: these are held explicitly here, not reached for
/// as implicit singletons, so independent instances can be constructed
/// per test.
pub struct AppState {
    pub global: ArcSwap<GlobalConfig>,
    pub messages: KindRuntime,
    pub responses: KindRuntime,
    pub gemini: KindRuntime,
    pub chat: KindRuntime,
    pub urls: UrlManager,
    pub affinity: AffinityCache,
    pub cooldown: Arc<CooldownCache>,
    pub http: UpstreamClient,
}

impl AppState {
    pub fn new(global: GlobalConfig, channels: InitialChannels) -> Arc<Self> {
        Self::with_sinks(global, channels, None)
    }

    /// `sink_for` is asked once per kind, since a single process-wide
    /// config file needs to know which of its four arrays a mutation
    /// touched (`ChangeSink::on_change` itself carries no kind).
    pub fn with_sinks(
        global: GlobalConfig,
        channels: InitialChannels,
        sink_for: Option<&dyn Fn(Kind) -> Arc<dyn ChangeSink>>,
    ) -> Arc<Self> {
        let state = Arc::new(Self {
            global: ArcSwap::from_pointee(global),
            messages: KindRuntime::new(Kind::Messages, channels.messages, sink_for.map(|f| f(Kind::Messages))),
            responses: KindRuntime::new(Kind::Responses, channels.responses, sink_for.map(|f| f(Kind::Responses))),
            gemini: KindRuntime::new(Kind::Gemini, channels.gemini, sink_for.map(|f| f(Kind::Gemini))),
            chat: KindRuntime::new(Kind::Chat, channels.chat, sink_for.map(|f| f(Kind::Chat))),
            urls: UrlManager::new(),
            affinity: AffinityCache::new(AFFINITY_TTL),
            cooldown: Arc::new(CooldownCache::new(COOLDOWN_BASE_RECOVERY, COOLDOWN_MAX_FAILURES)),
            http: UpstreamClient::new(),
        });

        state.messages.metrics.spawn_background_tasks();
        state.responses.metrics.spawn_background_tasks();
        state.gemini.metrics.spawn_background_tasks();
        state.chat.metrics.spawn_background_tasks();
        state.cooldown.spawn_sweeper();

        state
    }

    pub fn runtime(&self, kind: Kind) -> &KindRuntime {
        match kind {
            Kind::Messages => &self.messages,
            Kind::Responses => &self.responses,
            Kind::Gemini => &self.gemini,
            Kind::Chat => &self.chat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global() -> GlobalConfig {
        GlobalConfig {
            host: "0.0.0.0".to_string(),
            port: 8787,
            proxy_key: "secret".to_string(),
            proxy: None,
            fuzzy_mode_enabled: false,
            strip_billing_header: false,
        }
    }

    #[tokio::test]
    async fn runtime_picks_the_matching_kind() {
        let state = AppState::new(global(), InitialChannels::default());
        assert_eq!(state.runtime(Kind::Chat).metrics.kind(), Kind::Chat);
        assert_eq!(state.runtime(Kind::Messages).metrics.kind(), Kind::Messages);
    }
}
