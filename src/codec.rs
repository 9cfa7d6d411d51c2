//! Resume token codec.
//!
//! The token is a versioned JSON envelope around [`ResumeState`]. Nothing
//! outside this module and the HTTP transport reads it; the state machine
//! only stores and hands back the bytes.
use crate::error::DownloadError;
use crate::state::ResumeToken;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

const TOKEN_VERSION: u32 = 1;

/// Everything needed to continue an interrupted range transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    /// The URL of the original request.
    pub url: Url,
    /// Staging file holding the bytes received so far.
    pub partial_path: PathBuf,
    /// Number of bytes in `partial_path` that are known good.
    pub offset: u64,
    /// Full length of the resource, if the server reported it.
    pub total: Option<u64>,
    /// `ETag` or `Last-Modified` value to send as `If-Range`.
    pub validator: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    state: ResumeState,
}

/// Serializes a partial transfer into an opaque token.
///
/// # Errors
///
/// Returns [`DownloadError::InvalidResumeToken`] if the state cannot be serialized.
pub fn encode(state: &ResumeState) -> Result<ResumeToken, DownloadError> {
    let envelope = Envelope {
        version: TOKEN_VERSION,
        state: state.clone(),
    };
    serde_json::to_vec(&envelope)
        .map(ResumeToken::from)
        .map_err(DownloadError::invalid_token)
}

/// Recovers the partial transfer state from a token.
///
/// # Errors
///
/// Returns [`DownloadError::InvalidResumeToken`] for malformed bytes, a
/// token written by another format version, or an offset past the end of
/// the resource.
pub fn decode(token: &ResumeToken) -> Result<ResumeState, DownloadError> {
    let envelope: Envelope =
        serde_json::from_slice(token.as_bytes()).map_err(DownloadError::invalid_token)?;

    if envelope.version != TOKEN_VERSION {
        return Err(DownloadError::invalid_token(format!(
            "unsupported token version {}",
            envelope.version
        )));
    }

    let state = envelope.state;
    if let Some(total) = state.total
        && state.offset > total
    {
        return Err(DownloadError::invalid_token(format!(
            "offset {} is past the end of a {total} byte resource",
            state.offset
        )));
    }

    Ok(state)
}
