use thiserror::Error;

/// Reasons an inbound payload cannot be turned into client state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed event payload: {0}")]
    Malformed(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid timestamp `{0}`")]
    InvalidTimestamp(String),
    #[error("message record carries no authoritative id")]
    MissingAuthoritativeId,
}
