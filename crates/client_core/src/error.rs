use thiserror::Error;

/// Rejections of caller-initiated operations. Local state is never touched
/// when one of these is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("no conversation is bound")]
    NotBound,
    #[error("message content is empty")]
    EmptyContent,
    #[error("message {0} has no authoritative id yet")]
    UnconfirmedTarget(String),
    #[error("current user is not a participant of {0}")]
    NotParticipant(String),
    #[error("unknown group: {0}")]
    UnknownGroup(String),
    #[error("group name is required")]
    MissingGroupName,
    #[error("a group needs at least one member besides its creator")]
    NoGroupMembers,
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),
}
