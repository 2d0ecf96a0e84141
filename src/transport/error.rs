//! Transport-level errors

use thiserror::Error;

/// Errors raised by [`Transport`](super::Transport) implementations.
///
/// All of them are fatal to any session running over the transport: a
/// command may have reached the tag before the failure, so the command
/// counter can no longer be trusted.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// The reader (or the tag in its field) went away
    #[error("reader disconnected: {0}")]
    Disconnected(String),

    /// No response within the transport's per-command timeout
    #[error("command timed out")]
    Timeout,

    /// Reader-specific I/O failure
    #[error("reader I/O error: {0}")]
    Io(String),
}
