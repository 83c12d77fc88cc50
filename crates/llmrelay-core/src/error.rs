/// The taxonomy from §7, reduced to what the HTTP layer needs to render
/// a response: everything upstream of this point has already decided
/// retry vs. surface; `ProxyError` is just "what goes back to the
/// client and at what status".
#[derive(Debug)]
pub enum ProxyError {
    /// Malformed JSON, missing model, etc. No upstream call was made.
    InvalidRequest(String),
    /// Proxy access key missing or wrong.
    Unauthorized,
    /// No channel kind configured at all, or the kind's pool is empty.
    NoChannelsConfigured,
    /// Scheduler exhausted every channel without any retryable body to
    /// relay verbatim.
    AllChannelsFailed,
}

impl ProxyError {
    pub fn status(&self) -> u16 {
        match self {
            ProxyError::InvalidRequest(_) => 400,
            ProxyError::Unauthorized => 401,
            ProxyError::NoChannelsConfigured => 503,
            ProxyError::AllChannelsFailed => 503,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ProxyError::InvalidRequest(msg) => msg.clone(),
            ProxyError::Unauthorized => "invalid or missing proxy access key".to_string(),
            ProxyError::NoChannelsConfigured => "no channels configured for this kind".to_string(),
            ProxyError::AllChannelsFailed => "all upstream channels failed".to_string(),
        }
    }
}
