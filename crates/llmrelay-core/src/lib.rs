pub mod auth;
pub mod bootstrap;
pub mod cancel;
pub mod classify;
pub mod error;
pub mod failover;
pub mod handler;
pub mod runtime;
pub mod scheduler;
pub mod upstream_client;

pub use bootstrap::{BootstrapError, FilePersistence, LoadedConfig};
pub use cancel::CancelSignal;
pub use error::ProxyError;
pub use failover::{ChannelBody, ChannelResponse};
pub use handler::router;
pub use runtime::{AppState, InitialChannels, KindRuntime};
