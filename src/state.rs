//! Task data model.
//!
//! A [`DownloadTask`] pairs an immutable [`DownloadRequest`] with the task's
//! current [`TaskState`] and, while paused, the opaque [`ResumeToken`] the
//! transport handed back on cancellation.
use crate::error::DownloadError;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

/// Lifecycle of a single download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl TaskState {
    /// `Completed` and `Failed` end a task instance.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What to fetch and under which name to store it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    source_url: Url,
    destination_name: String,
}

impl DownloadRequest {
    /// Validates `url` and settles the destination name.
    ///
    /// When `destination_name` is `None` the name is the last path segment
    /// of the URL, percent-decoded and sanitized.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidRequest`] if the URL is not an
    /// absolute `http`/`https` URL or the explicit name sanitizes to nothing.
    pub fn new(url: &str, destination_name: Option<&str>) -> Result<Self, DownloadError> {
        let source_url = Url::parse(url)
            .map_err(|e| DownloadError::InvalidRequest(format!("{url}: {e}")))?;

        if !matches!(source_url.scheme(), "http" | "https") {
            return Err(DownloadError::InvalidRequest(format!(
                "unsupported scheme '{}'",
                source_url.scheme()
            )));
        }

        let destination_name = match destination_name {
            Some(name) => {
                let clean = sanitize_filename::sanitize(name);
                if clean.is_empty() {
                    return Err(DownloadError::InvalidRequest(format!(
                        "unusable destination name '{name}'"
                    )));
                }
                clean
            }
            None => utils::get_filename_from_url(source_url.as_str()),
        };

        Ok(Self {
            source_url,
            destination_name,
        })
    }

    pub fn source_url(&self) -> &Url {
        &self.source_url
    }

    pub fn destination_name(&self) -> &str {
        &self.destination_name
    }
}

/// Opaque checkpoint produced by the transport when a transfer stops early.
///
/// Only the transport and [`crate::codec`] look inside.
#[derive(Clone, PartialEq, Eq)]
pub struct ResumeToken(Vec<u8>);

impl ResumeToken {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for ResumeToken {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumeToken({} bytes)", self.0.len())
    }
}

/// The finished file inside the destination store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub name: String,
    pub path: PathBuf,
}

/// The single task tracked by a [`crate::Downloader`].
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub request: DownloadRequest,
    pub state: TaskState,
    pub resume_token: Option<ResumeToken>,
    /// Set once the task reaches `Completed`.
    pub artifact: Option<StoredArtifact>,
    /// The error that moved the task to `Failed`, or the last
    /// non-fatal resume failure.
    pub error: Option<DownloadError>,
}

impl DownloadTask {
    pub const fn new(request: DownloadRequest) -> Self {
        Self {
            request,
            state: TaskState::Idle,
            resume_token: None,
            artifact: None,
            error: None,
        }
    }
}

/// Writes a resume token to disk so a later process can pick the transfer up.
///
/// # Errors
///
/// This function will return an error if the file cannot be created or written to.
pub async fn save_token(token: &ResumeToken, path: &Path) -> std::io::Result<()> {
    tokio::fs::write(path, token.as_bytes()).await
}

/// Reads a token written by [`save_token`]. Returns `Ok(None)` if there is no file.
pub async fn load_token(path: &Path) -> std::io::Result<Option<ResumeToken>> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(None),
        Ok(bytes) => Ok(Some(ResumeToken::from(bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
