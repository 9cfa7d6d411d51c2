//! HTTP transport.
//!
//! Streams a resource into a staging file with buffered writes. Resumed
//! transfers send `Range: bytes=<offset>-` plus `If-Range` so a changed
//! resource comes back whole instead of being spliced onto stale bytes.
use crate::codec::{self, ResumeState};
use crate::config::Settings;
use crate::error::DownloadError;
use crate::progress::ProgressThrottle;
use crate::state::ResumeToken;
use crate::transport::{EventSink, StreamHandle, StreamSource, Transport, TransportEvent};
use crate::utils;
use reqwest::StatusCode;
use reqwest::header::{IF_RANGE, RANGE};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use url::Url;

/// [`Transport`] over plain HTTP(S) using byte-range resumption.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    staging_dir: PathBuf,
    progress_interval: Duration,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            staging_dir: staging_dir.into(),
            progress_interval: Duration::from_millis(100),
        }
    }

    #[must_use]
    pub const fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Build the client and staging directory described by `settings`.
    pub fn from_settings(settings: &Settings) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.as_str())
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()?;

        Ok(Self::new(client, settings.staging_dir())
            .with_progress_interval(Duration::from_millis(settings.progress_interval_ms)))
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }
}

impl Transport for HttpTransport {
    fn open(&self, source: StreamSource, sink: EventSink) -> Result<StreamHandle, DownloadError> {
        // Only the token is checked here; touching the staging directory
        // happens on the stream task.
        let start = match source {
            StreamSource::Fresh(url) => Start::Fresh(url),
            StreamSource::Resume(token) => Start::Resume(codec::decode(&token)?),
        };

        let handle = StreamHandle::default();
        tokio::spawn(run_stream(
            self.client.clone(),
            self.staging_dir.clone(),
            start,
            sink,
            handle.token(),
            self.progress_interval,
        ));
        Ok(handle)
    }

    fn discard(&self, token: &ResumeToken) {
        if let Ok(state) = codec::decode(token) {
            tokio::spawn(async move { remove_partial(&state.partial_path).await });
        }
    }
}

enum Start {
    Fresh(Url),
    Resume(ResumeState),
}

impl Start {
    async fn prepare(self, staging_dir: PathBuf) -> Result<Transfer, DownloadError> {
        match self {
            Self::Fresh(url) => {
                tokio::fs::create_dir_all(&staging_dir).await.map_err(|e| {
                    DownloadError::transport(format!(
                        "cannot create staging dir {}: {e}",
                        staging_dir.display()
                    ))
                })?;

                let path = tokio::task::spawn_blocking(move || {
                    tempfile::Builder::new()
                        .prefix("rfetch-")
                        .suffix(".part")
                        .tempfile_in(&staging_dir)?
                        .into_temp_path()
                        .keep()
                        .map_err(|e| e.error)
                })
                .await
                .map_err(DownloadError::transport)?
                .map_err(|e| DownloadError::transport(format!("cannot create staging file: {e}")))?;

                Ok(Transfer {
                    url,
                    path,
                    offset: 0,
                    total: None,
                    validator: None,
                    resumable: false,
                })
            }
            Self::Resume(state) => {
                let on_disk = tokio::fs::metadata(&state.partial_path)
                    .await
                    .map_err(|e| {
                        DownloadError::invalid_token(format!(
                            "partial file {}: {e}",
                            state.partial_path.display()
                        ))
                    })?
                    .len();

                if on_disk < state.offset {
                    remove_partial(&state.partial_path).await;
                    return Err(DownloadError::invalid_token(format!(
                        "partial file holds {on_disk} bytes but the token expects {}",
                        state.offset
                    )));
                }

                Ok(Transfer {
                    url: state.url,
                    path: state.partial_path,
                    offset: state.offset,
                    total: state.total,
                    validator: state.validator,
                    resumable: true,
                })
            }
        }
    }
}

/// Mutable bookkeeping for one stream.
struct Transfer {
    url: Url,
    path: PathBuf,
    /// Bytes of the resource currently in the staging file.
    offset: u64,
    total: Option<u64>,
    validator: Option<String>,
    /// The server has shown it honours byte ranges for this resource.
    resumable: bool,
}

impl Transfer {
    fn checkpoint(&self) -> Option<ResumeToken> {
        if !self.resumable {
            return None;
        }
        let state = ResumeState {
            url: self.url.clone(),
            partial_path: self.path.clone(),
            offset: self.offset,
            total: self.total,
            validator: self.validator.clone(),
        };
        codec::encode(&state)
            .inspect_err(|e| tracing::warn!(error = %e, "Failed to encode resume token"))
            .ok()
    }
}

enum StreamEnd {
    Finished,
    Cancelled,
    /// Network-level failure; the bytes on disk are still good.
    Interrupted(DownloadError),
}

async fn run_stream(
    client: reqwest::Client,
    staging_dir: PathBuf,
    start: Start,
    sink: EventSink,
    cancel: CancellationToken,
    progress_interval: Duration,
) {
    let mut transfer = match start.prepare(staging_dir).await {
        Ok(transfer) => transfer,
        Err(error) => {
            tracing::warn!(error = %error, "Could not set up transfer");
            sink.send(TransportEvent::Error {
                error,
                resume_token: None,
            });
            return;
        }
    };

    tracing::info!(
        url = %transfer.url,
        offset = transfer.offset,
        staging = %transfer.path.display(),
        "Opening stream"
    );

    let end = transfer_body(&client, &mut transfer, &sink, &cancel, progress_interval).await;

    let event = match end {
        Ok(StreamEnd::Finished) => {
            tracing::info!(url = %transfer.url, bytes = transfer.offset, "Transfer finished");
            TransportEvent::Complete {
                artifact: transfer.path.clone(),
                original_url: transfer.url.clone(),
            }
        }
        Ok(StreamEnd::Cancelled) => {
            let resume_token = transfer.checkpoint();
            if resume_token.is_none() {
                remove_partial(&transfer.path).await;
            }
            tracing::info!(
                url = %transfer.url,
                offset = transfer.offset,
                resumable = resume_token.is_some(),
                "Transfer cancelled"
            );
            TransportEvent::Cancelled { resume_token }
        }
        Ok(StreamEnd::Interrupted(error)) => {
            let resume_token = if transfer.offset > 0 {
                transfer.checkpoint()
            } else {
                None
            };
            if resume_token.is_none() {
                remove_partial(&transfer.path).await;
            }
            tracing::warn!(
                url = %transfer.url,
                offset = transfer.offset,
                resumable = resume_token.is_some(),
                error = %error,
                "Transfer interrupted"
            );
            TransportEvent::Error {
                error,
                resume_token,
            }
        }
        Err(error) => {
            remove_partial(&transfer.path).await;
            tracing::warn!(url = %transfer.url, error = %error, "Transfer failed");
            TransportEvent::Error {
                error,
                resume_token: None,
            }
        }
    };

    sink.send(event);
}

/// Runs the request and copies the body to disk.
///
/// `Err` is a failure that cannot be resumed; `Ok(Interrupted)` may be.
async fn transfer_body(
    client: &reqwest::Client,
    t: &mut Transfer,
    sink: &EventSink,
    cancel: &CancellationToken,
    progress_interval: Duration,
) -> Result<StreamEnd, DownloadError> {
    let mut request = client.get(t.url.clone());
    if t.offset > 0 {
        request = request.header(RANGE, format!("bytes={}-", t.offset));
        if let Some(validator) = &t.validator {
            request = request.header(IF_RANGE, validator.as_str());
        }
    }

    let sent = tokio::select! {
        biased;

        () = cancel.cancelled() => return Ok(StreamEnd::Cancelled),

        result = request.send() => result,
    };

    let mut response = match sent {
        Ok(response) => response,
        Err(e) => return Ok(StreamEnd::Interrupted(e.into())),
    };

    let status = response.status();
    tracing::debug!(url = %t.url, status = status.as_u16(), offset = t.offset, "Response received");

    let append = match status {
        StatusCode::PARTIAL_CONTENT if t.offset > 0 => {
            t.resumable = true;
            t.total = utils::content_range_total(response.headers())
                .or_else(|| response.content_length().map(|len| len + t.offset));
            true
        }
        StatusCode::RANGE_NOT_SATISFIABLE if t.offset > 0 && t.total == Some(t.offset) => {
            // The previous stream already had every byte.
            sink.progress(0, t.offset, t.total);
            return Ok(StreamEnd::Finished);
        }
        s if s.is_success() => {
            if t.offset > 0 {
                tracing::info!(url = %t.url, "Server ignored the range request, restarting from byte 0");
            }
            t.offset = 0;
            t.resumable = s == StatusCode::PARTIAL_CONTENT
                || utils::accepts_byte_ranges(response.headers());
            t.total = response.content_length();
            t.validator = utils::range_validator(response.headers());
            false
        }
        s if s.is_server_error() => {
            return Ok(StreamEnd::Interrupted(DownloadError::transport(format!(
                "server returned {s}"
            ))));
        }
        s => {
            return Err(DownloadError::transport(format!(
                "request failed with status {s}"
            )));
        }
    };

    let path = t.path.clone();
    let staging_err = |e: std::io::Error| {
        DownloadError::transport(format!("staging file {}: {e}", path.display()))
    };

    let file = if append {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&t.path)
            .await
            .map_err(staging_err)?;
        file.set_len(t.offset).await.map_err(staging_err)?;
        file.seek(SeekFrom::Start(t.offset))
            .await
            .map_err(staging_err)?;
        file
    } else {
        tokio::fs::File::create(&t.path).await.map_err(staging_err)?
    };

    let mut writer = BufWriter::new(file);
    let mut throttle = ProgressThrottle::new(progress_interval);

    sink.progress(0, t.offset, t.total);

    loop {
        let next = tokio::select! {
            biased;

            () = cancel.cancelled() => None,

            chunk = response.chunk() => Some(chunk),
        };

        match next {
            None => {
                // Ensure everything counted in `offset` is on disk before checkpointing
                writer.flush().await.map_err(staging_err)?;
                return Ok(StreamEnd::Cancelled);
            }
            Some(Ok(Some(bytes))) => {
                writer.write_all(&bytes).await.map_err(staging_err)?;
                let len = bytes.len() as u64;
                t.offset += len;
                if let Some(batch) = throttle.record(len) {
                    sink.progress(batch, t.offset, t.total);
                }
            }
            Some(Ok(None)) => break,
            Some(Err(e)) => {
                writer.flush().await.map_err(staging_err)?;
                return Ok(StreamEnd::Interrupted(e.into()));
            }
        }
    }

    writer.flush().await.map_err(staging_err)?;
    writer.get_ref().sync_all().await.map_err(staging_err)?;
    sink.progress(throttle.flush(), t.offset, t.total);

    if let Some(total) = t.total
        && t.offset < total
    {
        return Ok(StreamEnd::Interrupted(DownloadError::transport(format!(
            "connection closed after {} of {total} bytes",
            t.offset
        ))));
    }

    Ok(StreamEnd::Finished)
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::debug!(path = %path.display(), error = %e, "Could not remove partial file");
    }
}
