//! Transport client contract.
//!
//! A transport opens one stream per call to [`Transport::open`]. The stream
//! runs on its own task and reports back through an [`EventSink`]: any
//! number of `Progress` events followed by exactly one terminal event.
use crate::error::DownloadError;
use crate::state::ResumeToken;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Where a stream starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSource {
    /// A new transfer of the whole resource.
    Fresh(Url),
    /// Continue a transfer from a token produced by an earlier stream.
    Resume(ResumeToken),
}

/// Events emitted by a running stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Progress {
        /// Bytes written since the previous progress event.
        bytes_written: u64,
        /// Bytes on disk for this transfer, including resumed bytes.
        total_written: u64,
        total_expected: Option<u64>,
    },
    /// The whole resource is in the staging file at `artifact`.
    Complete { artifact: PathBuf, original_url: Url },
    /// The transfer stopped on its own. A token means it can be continued.
    Error {
        error: DownloadError,
        resume_token: Option<ResumeToken>,
    },
    /// The transfer stopped because [`StreamHandle::cancel`] was called.
    Cancelled { resume_token: Option<ResumeToken> },
}

impl TransportEvent {
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

/// Sending side of a stream's event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver an event. Events for a stream nobody listens to are dropped.
    pub fn send(&self, event: TransportEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Dropping transport event for a detached stream");
        }
    }

    pub fn progress(&self, bytes_written: u64, total_written: u64, total_expected: Option<u64>) {
        self.send(TransportEvent::Progress {
            bytes_written,
            total_written,
            total_expected,
        });
    }
}

/// Control handle for a running stream.
#[derive(Debug, Clone, Default)]
pub struct StreamHandle {
    cancel: CancellationToken,
}

impl StreamHandle {
    /// Ask the stream to stop. The outcome arrives later as
    /// [`TransportEvent::Cancelled`], unless the stream had already finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// A way of moving bytes from a URL into a local staging file.
pub trait Transport: Send + Sync + 'static {
    /// Start a stream in the background and return its control handle.
    ///
    /// # Errors
    ///
    /// Fails synchronously with [`DownloadError::InvalidResumeToken`] when a
    /// resume token cannot be used, or [`DownloadError::Transport`] when the
    /// stream cannot be set up at all.
    fn open(&self, source: StreamSource, sink: EventSink) -> Result<StreamHandle, DownloadError>;

    /// Release whatever a token refers to once it will never be resumed.
    fn discard(&self, _token: &ResumeToken) {}
}
