use clap::Parser;
use llmrelay_common::GlobalConfigPatch;

/// CLI layer of the configuration merge: CLI > ENV > config file. Every
/// flag also accepts its value from the matching environment variable
/// via clap's `env` feature; flags left unset here fall through to the
/// file-derived patch underneath.
#[derive(Parser, Debug)]
#[command(name = "llmrelay", about = "A failover-aware reverse proxy for LLM HTTP APIs")]
pub struct Cli {
    /// Path to the channel configuration file (§6 JSON format).
    #[arg(long, env = "LLMRELAY_CONFIG", default_value = "./llmrelay.config.json")]
    pub config: std::path::PathBuf,

    #[arg(long, env = "LLMRELAY_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "LLMRELAY_PORT")]
    pub port: Option<u16>,

    /// Inbound proxy access key clients must present.
    #[arg(long, env = "LLMRELAY_PROXY_KEY")]
    pub proxy_key: Option<String>,

    /// Outbound proxy used for upstream calls unless a channel overrides it.
    #[arg(long, env = "LLMRELAY_PROXY")]
    pub proxy: Option<String>,

    #[arg(long, env = "LLMRELAY_FUZZY_MODE")]
    pub fuzzy_mode: bool,

    #[arg(long, env = "LLMRELAY_STRIP_BILLING_HEADER")]
    pub strip_billing_header: bool,
}

impl Cli {
    pub fn as_global_patch(&self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: self.host.clone(),
            port: self.port,
            proxy_key: self.proxy_key.clone(),
            proxy: self.proxy.clone(),
            fuzzy_mode_enabled: self.fuzzy_mode.then_some(true),
            strip_billing_header: self.strip_billing_header.then_some(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_minimal_args() {
        let cli = Cli::parse_from(["llmrelay", "--proxy-key", "secret"]);
        assert_eq!(cli.proxy_key.as_deref(), Some("secret"));
        assert!(!cli.fuzzy_mode);
    }
}
