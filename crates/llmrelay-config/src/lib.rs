mod error;
mod manager;
mod types;

pub use error::{ConfigError, ConfigResult};
pub use manager::{ChangeSink, ConfigManager};
pub use types::{ChannelStatus, ServiceType, UpdateOutcome, UpstreamConfig, UpstreamConfigPatch};
