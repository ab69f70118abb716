//! User-facing error taxonomy.
//!
//! Handlers return `anyhow::Result`; when the underlying error is one of these
//! types the bot reports it back into the thread instead of only logging it.

use thiserror::Error;

/// Session-level failures: missing configuration or subprocess problems.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no workspace is mapped to this thread or channel")]
    NotFound { thread: String },
    #[error("claude is still working on this thread")]
    Busy { thread: String },
    #[error("failed to start claude: {message}")]
    Spawn { thread: String, message: String },
}

/// Rejected question interactions. None of these change state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("this question has expired; please ask again")]
    Expired,
    #[error("this question was already answered")]
    AlreadyAnswered,
    #[error("select at least one option before submitting")]
    EmptySelection,
    #[error("invalid interaction: {0}")]
    InvalidAction(String),
}

/// The message to show the user for `err`, if it belongs to the user-facing taxonomy.
pub fn user_message(err: &anyhow::Error) -> Option<String> {
    if let Some(e) = err.downcast_ref::<SessionError>() {
        return Some(e.to_string());
    }
    err.downcast_ref::<ProtocolError>().map(ToString::to_string)
}
