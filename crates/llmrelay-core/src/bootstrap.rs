//! §6 / [AMBIENT] D configuration: a JSON file of `upstream` /
//! `responsesUpstream` / `geminiUpstream` / `chatUpstream` channel
//! arrays plus `fuzzyModeEnabled`/`stripBillingHeader`, loaded once at
//! startup and persisted atomically (temp file + rename) after every
//! mutation a `ConfigManager` commits.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use llmrelay_common::{GlobalConfigPatch, Kind};
use llmrelay_config::{ChangeSink, UpstreamConfig};
use serde::{Deserialize, Serialize};

use crate::runtime::InitialChannels;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
}

/// Legacy `currentUpstream`/`currentResponsesUpstream` keys are not
/// declared here; serde drops unrecognized fields by default, which is
/// exactly "accepted and ignored".
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    upstream: Vec<UpstreamConfig>,
    #[serde(default)]
    responses_upstream: Vec<UpstreamConfig>,
    #[serde(default)]
    gemini_upstream: Vec<UpstreamConfig>,
    #[serde(default)]
    chat_upstream: Vec<UpstreamConfig>,
    #[serde(default)]
    fuzzy_mode_enabled: bool,
    #[serde(default)]
    strip_billing_header: bool,
}

pub struct LoadedConfig {
    pub channels: InitialChannels,
    pub fuzzy_mode_enabled: bool,
    pub strip_billing_header: bool,
}

impl LoadedConfig {
    /// The lowest-precedence layer of the CLI > ENV > file merge;
    /// `host`/`port`/`proxy_key`/`proxy` are not carried by the config
    /// file and are left unset here.
    pub fn as_global_patch(&self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            fuzzy_mode_enabled: Some(self.fuzzy_mode_enabled),
            strip_billing_header: Some(self.strip_billing_header),
            ..Default::default()
        }
    }
}

/// Returns an empty config (no channels, flags off) if `path` doesn't
/// exist yet — a fresh install starts with zero channels in every pool.
pub fn load(path: &Path) -> Result<LoadedConfig, BootstrapError> {
    if !path.exists() {
        return Ok(LoadedConfig {
            channels: InitialChannels::default(),
            fuzzy_mode_enabled: false,
            strip_billing_header: false,
        });
    }
    let text = fs::read_to_string(path).map_err(|source| BootstrapError::Read { path: path.to_path_buf(), source })?;
    let file: ConfigFile =
        serde_json::from_str(&text).map_err(|source| BootstrapError::Parse { path: path.to_path_buf(), source })?;
    Ok(LoadedConfig {
        channels: InitialChannels {
            messages: file.upstream,
            responses: file.responses_upstream,
            gemini: file.gemini_upstream,
            chat: file.chat_upstream,
        },
        fuzzy_mode_enabled: file.fuzzy_mode_enabled,
        strip_billing_header: file.strip_billing_header,
    })
}

/// Owns the whole config file's in-memory shadow and rewrites it
/// atomically whenever any one kind's pool reports a change. Each kind
/// gets its own `ChangeSink` handle via `sink_for`, since
/// `ConfigManager` only ever hands a sink its own kind's channels.
pub struct FilePersistence {
    path: PathBuf,
    state: Mutex<ConfigFile>,
}

impl FilePersistence {
    pub fn new(path: PathBuf, loaded: &LoadedConfig) -> Arc<Self> {
        Arc::new(Self {
            path,
            state: Mutex::new(ConfigFile {
                upstream: loaded.channels.messages.clone(),
                responses_upstream: loaded.channels.responses.clone(),
                gemini_upstream: loaded.channels.gemini.clone(),
                chat_upstream: loaded.channels.chat.clone(),
                fuzzy_mode_enabled: loaded.fuzzy_mode_enabled,
                strip_billing_header: loaded.strip_billing_header,
            }),
        })
    }

    pub fn sink_for(self: &Arc<Self>, kind: Kind) -> Arc<dyn ChangeSink> {
        Arc::new(KindSink {
            persistence: Arc::clone(self),
            kind,
        })
    }

    /// Builds the closure `AppState::with_sinks` expects, binding it to
    /// this instance.
    pub fn sink_factory(self: &Arc<Self>) -> impl Fn(Kind) -> Arc<dyn ChangeSink> + 'static {
        let persistence = Arc::clone(self);
        move |kind| persistence.sink_for(kind)
    }

    fn write_locked(&self, state: &ConfigFile) {
        let Ok(text) = serde_json::to_string_pretty(state) else {
            return;
        };
        let temp = temp_path(&self.path);
        if fs::write(&temp, &text).is_err() {
            return;
        }
        if fs::rename(&temp, &self.path).is_err() {
            let _ = fs::remove_file(&temp);
        }
    }
}

struct KindSink {
    persistence: Arc<FilePersistence>,
    kind: Kind,
}

impl ChangeSink for KindSink {
    fn on_change(&self, channels: &[UpstreamConfig]) {
        let mut state = self.persistence.state.lock().unwrap();
        match self.kind {
            Kind::Messages => state.upstream = channels.to_vec(),
            Kind::Responses => state.responses_upstream = channels.to_vec(),
            Kind::Gemini => state.gemini_upstream = channels.to_vec(),
            Kind::Chat => state.chat_upstream = channels.to_vec(),
        }
        self.persistence.write_locked(&state);
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let pid = std::process::id();
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    let mut name = target.file_name().and_then(|n| n.to_str()).unwrap_or("llmrelay-config").to_string();
    name.push_str(&format!(".{pid}-{nanos}.tmp"));
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmrelay_config::ServiceType;

    fn channel(name: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            service_type: ServiceType::OpenAi,
            base_url: "https://api.example.com".to_string(),
            base_urls: vec![],
            api_keys: vec!["k1".to_string()],
            historical_api_keys: vec![],
            model_mapping: Default::default(),
            priority: 0,
            status: llmrelay_config::ChannelStatus::Active,
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
    fn missing_file_loads_as_empty() {
        let loaded = load(Path::new("/nonexistent/llmrelay-config.json")).unwrap();
        assert!(loaded.channels.messages.is_empty());
        assert!(!loaded.fuzzy_mode_enabled);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("llmrelay-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let loaded = LoadedConfig {
            channels: InitialChannels {
                messages: vec![channel("a")],
                ..Default::default()
            },
            fuzzy_mode_enabled: true,
            strip_billing_header: false,
        };
        let persistence = FilePersistence::new(path.clone(), &loaded);
        let sink = persistence.sink_for(Kind::Messages);
        sink.on_change(&[channel("a"), channel("b")]);

        let reloaded = load(&path).unwrap();
        assert_eq!(reloaded.channels.messages.len(), 2);
        assert!(reloaded.fuzzy_mode_enabled);

        let _ = fs::remove_dir_all(&dir);
    }
}
