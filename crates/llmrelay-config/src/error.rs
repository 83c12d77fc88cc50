#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("channel {0:?} already exists")]
    DuplicateName(String),
    #[error("channel {0:?} not found")]
    NotFound(String),
    #[error("key {0:?} not found on channel {1:?}")]
    KeyNotFound(String, String),
    #[error("reorder indices must be distinct and in range")]
    InvalidReorder,
    #[error("invalid channel status")]
    InvalidStatus,
    #[error("failed to persist config: {0}")]
    Persist(#[from] std::io::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
