use serde::{Deserialize, Serialize};

/// The four inbound API surfaces. Each has its own channel pool, metrics
/// store, affinity namespace, and URL manager sub-space — keys and URLs
/// are never shared semantically across kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Messages,
    Responses,
    Gemini,
    Chat,
}

impl Kind {
    pub const ALL: [Kind; 4] = [Kind::Messages, Kind::Responses, Kind::Gemini, Kind::Chat];

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Messages => "messages",
            Kind::Responses => "responses",
            Kind::Gemini => "gemini",
            Kind::Chat => "chat",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > config file, then the merged result is what
/// every request-handling path reads for the lifetime of the process
/// (config file *watching* is out of scope; only load-once is supported).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Inbound proxy access key clients must present (`x-api-key` or
    /// `Authorization: Bearer`). Stored as given; this process does not
    /// implement per-user accounts, only a single shared access key.
    pub proxy_key: String,
    /// Optional outbound proxy used for every upstream call, unless a
    /// channel overrides it with its own proxy URL.
    pub proxy: Option<String>,
    /// Widens failover eligibility to "any non-2xx response", per §4.G.
    pub fuzzy_mode_enabled: bool,
    /// Strip the provider billing/usage header before relaying upstream
    /// responses to the client. Accepted and persisted for config-file
    /// compatibility; upstream response headers are not yet forwarded
    /// to the client at all, so there is nothing for this to strip.
    pub strip_billing_header: bool,
}

/// Optional layer used for merging global config from CLI, env, and file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub proxy_key: Option<String>,
    pub proxy: Option<String>,
    pub fuzzy_mode_enabled: Option<bool>,
    pub strip_billing_header: Option<bool>,
}

impl GlobalConfigPatch {
    /// `other` wins field-by-field where it is `Some`. Used to layer
    /// CLI over ENV over config-file values, highest-precedence last.
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.proxy_key.is_some() {
            self.proxy_key = other.proxy_key;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.fuzzy_mode_enabled.is_some() {
            self.fuzzy_mode_enabled = other.fuzzy_mode_enabled;
        }
        if other.strip_billing_header.is_some() {
            self.strip_billing_header = other.strip_billing_header;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            proxy_key: self
                .proxy_key
                .ok_or(GlobalConfigError::MissingField("proxy_key"))?,
            proxy: self.proxy,
            fuzzy_mode_enabled: self.fuzzy_mode_enabled.unwrap_or(false),
            strip_billing_header: self.strip_billing_header.unwrap_or(false),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            proxy_key: Some(value.proxy_key),
            proxy: value.proxy,
            fuzzy_mode_enabled: Some(value.fuzzy_mode_enabled),
            strip_billing_header: Some(value.strip_billing_header),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_values() {
        let mut base = GlobalConfigPatch {
            host: Some("0.0.0.0".into()),
            port: Some(8787),
            ..Default::default()
        };
        base.overlay(GlobalConfigPatch {
            port: Some(9000),
            ..Default::default()
        });
        assert_eq!(base.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(base.port, Some(9000));
    }

    #[test]
    fn into_config_requires_proxy_key() {
        let err = GlobalConfigPatch::default().into_config().unwrap_err();
        assert!(matches!(err, GlobalConfigError::MissingField("proxy_key")));
    }

    #[test]
    fn into_config_fills_defaults() {
        let cfg = GlobalConfigPatch {
            proxy_key: Some("secret".into()),
            ..Default::default()
        }
        .into_config()
        .unwrap();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8787);
        assert!(!cfg.fuzzy_mode_enabled);
    }
}
