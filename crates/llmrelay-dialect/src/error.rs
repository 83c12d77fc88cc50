#[derive(Debug, thiserror::Error)]
pub enum DialectError {
    /// The inbound body could not be turned into an upstream request at
    /// all (malformed JSON, missing model) — surfaced to the client as
    /// a 400 and never failed over.
    #[error("invalid request body: {0}")]
    InvalidRequest(String),
    /// Upstream returned 2xx with a body that fails structural
    /// validation before any client byte has been written — recoverable
    /// by the failover engine.
    #[error("empty response envelope")]
    EmptyResponseEnvelope,
    #[error("invalid response body: {0}")]
    InvalidResponseBody(String),
}
