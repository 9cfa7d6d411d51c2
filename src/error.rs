//! Error kinds surfaced by the download core.
use crate::state::TaskState;
use thiserror::Error;

/// Errors returned by the state machine commands and carried by transport events.
///
/// Payloads are plain strings so the error can be stored on the task and
/// shown to an observer after the fact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    /// The URL did not parse to an absolute http(s) URL, or no usable
    /// destination name could be derived.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Network or protocol failure without resumable data.
    #[error("transport error: {0}")]
    Transport(String),

    /// Pause produced no token, or resume was attempted without one.
    #[error("no resume data available")]
    NoResumeData,

    /// The task stopped in `Paused` and still holds a resume token.
    #[error("download paused; it can be resumed")]
    Paused,

    /// The stored token is corrupted or no longer matches the partial file.
    #[error("invalid resume token: {0}")]
    InvalidResumeToken(String),

    /// Moving the finished artifact into the destination store failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The command is not valid in the task's current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: TaskState,
    },
}

impl DownloadError {
    pub fn transport(message: impl ToString) -> Self {
        Self::Transport(message.to_string())
    }

    pub fn persistence(message: impl ToString) -> Self {
        Self::Persistence(message.to_string())
    }

    pub fn invalid_token(message: impl ToString) -> Self {
        Self::InvalidResumeToken(message.to_string())
    }

    /// `NoResumeData` and `InvalidResumeToken` both leave a task paused but
    /// unresumable.
    pub const fn is_unresumable(&self) -> bool {
        matches!(self, Self::NoResumeData | Self::InvalidResumeToken(_))
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
