//! Download task state machine.
//!
//! [`Downloader`] owns at most one [`DownloadTask`]. Commands (`start`,
//! `pause`, `resume`, ...) and transport events are applied under one
//! async mutex, so only one transition happens at a time.
//!
//! # Concurrency Model
//!
//! - Each stream gets a pump task that forwards its [`TransportEvent`]s to
//!   the state machine, tagged with the stream's lease.
//! - Events whose lease no longer matches the active stream are dropped.
//! - Observer notifications leave through [`Notifier`] and never block.
use crate::error::DownloadError;
use crate::observer::{Notifier, Observer};
use crate::state::{DownloadRequest, DownloadTask, ResumeToken, StoredArtifact, TaskState};
use crate::store::DestinationStore;
use crate::transport::{EventSink, StreamHandle, StreamSource, Transport, TransportEvent};
use crate::utils;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc, oneshot, watch};

/// Identifies one opened stream.
///
/// Used to drop events from a stream that has already been settled or
/// replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LeaseId(u64);

struct ActiveStream {
    lease: LeaseId,
    handle: StreamHandle,
}

#[derive(Default)]
struct Inner {
    task: Option<DownloadTask>,
    /// Present exactly while the task is `Running`.
    active: Option<ActiveStream>,
    pause_waiters: Vec<oneshot::Sender<Result<(), DownloadError>>>,
}

impl Inner {
    fn state(&self) -> TaskState {
        self.task.as_ref().map_or(TaskState::Idle, |t| t.state)
    }

    fn has_token(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|t| t.resume_token.is_some())
    }

    /// A new task may replace the current one unless it is running or
    /// still resumable.
    fn is_replaceable(&self) -> bool {
        match self.state() {
            TaskState::Idle | TaskState::Completed | TaskState::Failed => true,
            TaskState::Paused => !self.has_token(),
            TaskState::Running => false,
        }
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    store: DestinationStore,
    notifier: Notifier,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<TaskState>,
    lease_counter: AtomicU64,
}

/// Drives a single resumable download.
#[derive(Clone)]
pub struct Downloader {
    shared: Arc<Shared>,
}

impl Downloader {
    /// Create a downloader. Must be called inside a Tokio runtime, since the
    /// observer dispatcher is spawned here.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: DestinationStore,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let (state_tx, _) = watch::channel(TaskState::Idle);
        Self {
            shared: Arc::new(Shared {
                transport,
                store,
                notifier: Notifier::spawn(observer),
                inner: Mutex::new(Inner::default()),
                state_tx,
                lease_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Start a fresh download of `url`.
    ///
    /// # Errors
    ///
    /// [`DownloadError::InvalidRequest`] for a malformed URL,
    /// [`DownloadError::InvalidState`] while a task is running or resumable.
    pub async fn start(&self, url: &str, destination_name: Option<&str>) -> Result<(), DownloadError> {
        let request = DownloadRequest::new(url, destination_name)?;
        self.start_request(request).await
    }

    pub async fn start_request(&self, request: DownloadRequest) -> Result<(), DownloadError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        if !inner.is_replaceable() {
            return Err(DownloadError::InvalidState {
                operation: "start",
                state: inner.state(),
            });
        }

        let (sink, events) = EventSink::channel();
        let handle = shared
            .transport
            .open(StreamSource::Fresh(request.source_url().clone()), sink)?;
        let lease = shared.next_lease();

        tracing::info!(
            url = %request.source_url(),
            name = request.destination_name(),
            "Starting download"
        );

        let mut task = DownloadTask::new(request);
        task.state = TaskState::Running;
        inner.task = Some(task);
        inner.active = Some(ActiveStream { lease, handle });
        shared.notifier.progress(0, None);
        shared.announce(TaskState::Running, "Downloading");
        drop(inner);

        self.spawn_pump(lease, events);
        Ok(())
    }

    /// Ask the running transfer to stop and keep whatever it can resume from.
    ///
    /// Resolves once the transport has answered: `Ok(())` when a resume
    /// token was stored, [`DownloadError::NoResumeData`] when the task is
    /// paused but cannot be resumed.
    ///
    /// # Errors
    ///
    /// [`DownloadError::InvalidState`] if nothing is running, or if the
    /// transfer finished or failed before the cancel took effect.
    pub async fn pause(&self) -> Result<(), DownloadError> {
        let outcome = {
            let mut inner = self.shared.inner.lock().await;
            let state = inner.state();
            let Some(active) = inner.active.as_ref() else {
                return Err(DownloadError::InvalidState {
                    operation: "pause",
                    state,
                });
            };

            tracing::info!("Pause requested");
            active.handle.cancel();

            let (tx, rx) = oneshot::channel();
            inner.pause_waiters.push(tx);
            rx
        };

        outcome.await.unwrap_or_else(|_| {
            Err(DownloadError::transport(
                "stream went away before the pause settled",
            ))
        })
    }

    /// Continue a paused transfer from its stored token.
    ///
    /// # Errors
    ///
    /// [`DownloadError::NoResumeData`] if no token is stored; the state is
    /// left untouched. [`DownloadError::InvalidResumeToken`] if the
    /// transport rejects the token, after which the task stays paused
    /// without a token. A token the stream only finds unusable later ends
    /// the same way, with the error recorded on the task.
    pub async fn resume(&self) -> Result<(), DownloadError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        let Some(token) = inner.task.as_ref().and_then(|t| t.resume_token.clone()) else {
            return Err(DownloadError::NoResumeData);
        };

        let (sink, events) = EventSink::channel();
        let opened = shared
            .transport
            .open(StreamSource::Resume(token.clone()), sink);

        let Some(task) = inner.task.as_mut() else {
            return Err(DownloadError::NoResumeData);
        };

        match opened {
            Ok(handle) => {
                task.resume_token = None;
                task.error = None;
                task.state = TaskState::Running;

                let lease = shared.next_lease();
                inner.active = Some(ActiveStream { lease, handle });
                tracing::info!("Resuming download");
                shared.announce(TaskState::Running, "Resuming download");
                drop(inner);

                self.spawn_pump(lease, events);
                Ok(())
            }
            Err(e) if e.is_unresumable() => {
                tracing::warn!(error = %e, "Stored resume token is unusable, dropping it");
                task.resume_token = None;
                task.error = Some(e.clone());
                shared.transport.discard(&token);
                shared.announce(
                    TaskState::Paused,
                    format!("Download cannot be resumed: {e}"),
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop a paused task and its resume data, returning to `Idle`.
    ///
    /// # Errors
    ///
    /// [`DownloadError::InvalidState`] unless the task is paused.
    pub async fn abandon(&self) -> Result<(), DownloadError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        let state = inner.state();
        if state != TaskState::Paused {
            return Err(DownloadError::InvalidState {
                operation: "abandon",
                state,
            });
        }

        if let Some(token) = inner.task.take().and_then(|t| t.resume_token) {
            shared.transport.discard(&token);
        }
        shared.announce(TaskState::Idle, "Download abandoned");
        Ok(())
    }

    /// Install a paused task from a token saved by an earlier run.
    ///
    /// # Errors
    ///
    /// [`DownloadError::NoResumeData`] for an empty token,
    /// [`DownloadError::InvalidState`] while a task is running or resumable.
    pub async fn restore(
        &self,
        request: DownloadRequest,
        token: ResumeToken,
    ) -> Result<(), DownloadError> {
        if token.is_empty() {
            return Err(DownloadError::NoResumeData);
        }

        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        if !inner.is_replaceable() {
            return Err(DownloadError::InvalidState {
                operation: "restore",
                state: inner.state(),
            });
        }

        tracing::info!(url = %request.source_url(), "Restoring paused download");
        let mut task = DownloadTask::new(request);
        task.state = TaskState::Paused;
        task.resume_token = Some(token);
        inner.task = Some(task);
        shared.announce(TaskState::Paused, "Download restored; ready to resume");
        Ok(())
    }

    pub async fn state(&self) -> TaskState {
        self.shared.inner.lock().await.state()
    }

    /// A snapshot of the current task, if any.
    pub async fn task(&self) -> Option<DownloadTask> {
        self.shared.inner.lock().await.task.clone()
    }

    pub async fn resume_token(&self) -> Option<ResumeToken> {
        self.shared
            .inner
            .lock()
            .await
            .task
            .as_ref()
            .and_then(|t| t.resume_token.clone())
    }

    /// Wait until the task is no longer `Running` and return the state it settled in.
    pub async fn wait(&self) -> TaskState {
        let mut rx = self.shared.state_tx.subscribe();
        let settled = rx
            .wait_for(|state| *state != TaskState::Running)
            .await
            .map(|state| *state);
        match settled {
            Ok(state) => state,
            Err(_) => self.state().await,
        }
    }

    /// Wait for the task to settle and turn the result into the stored artifact.
    ///
    /// # Errors
    ///
    /// The task's error when it failed or was interrupted,
    /// [`DownloadError::Paused`] after a pause that kept a resume token,
    /// [`DownloadError::NoResumeData`] after one that did not.
    pub async fn outcome(&self) -> Result<StoredArtifact, DownloadError> {
        let state = self.wait().await;
        let task = self.task().await;
        match (state, task) {
            (TaskState::Completed, Some(DownloadTask { artifact: Some(artifact), .. })) => {
                Ok(artifact)
            }
            (_, Some(DownloadTask { error: Some(error), .. })) => Err(error),
            (
                TaskState::Paused,
                Some(DownloadTask {
                    resume_token: Some(_),
                    ..
                }),
            ) => Err(DownloadError::Paused),
            (TaskState::Paused, _) => Err(DownloadError::NoResumeData),
            (state, _) => Err(DownloadError::InvalidState {
                operation: "collect the outcome",
                state,
            }),
        }
    }

    /// Download `url` to completion in one call.
    pub async fn run(
        &self,
        url: &str,
        destination_name: Option<&str>,
    ) -> Result<StoredArtifact, DownloadError> {
        self.start(url, destination_name).await?;
        self.outcome().await
    }

    fn spawn_pump(&self, lease: LeaseId, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let terminal = event.is_terminal();
                shared.apply(lease, event).await;
                if terminal {
                    return;
                }
            }
            shared.stream_closed(lease).await;
        });
    }
}

impl Shared {
    fn next_lease(&self) -> LeaseId {
        LeaseId(self.lease_counter.fetch_add(1, Ordering::Relaxed))
    }

    fn announce(&self, state: TaskState, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(state = %state, message = %message, "State changed");
        self.state_tx.send_replace(state);
        self.notifier.state_changed(state, message);
    }

    async fn apply(&self, lease: LeaseId, event: TransportEvent) {
        let mut inner = self.inner.lock().await;
        if inner.active.as_ref().map(|a| a.lease) != Some(lease) {
            tracing::debug!(lease = lease.0, "Ignoring event from a settled stream");
            return;
        }

        match event {
            TransportEvent::Progress {
                total_written,
                total_expected,
                ..
            } => {
                self.notifier.progress(total_written, total_expected);
                return;
            }
            TransportEvent::Cancelled { resume_token } => {
                self.enter_paused(&mut inner, resume_token, None);
            }
            TransportEvent::Error {
                error,
                resume_token: Some(token),
            } if !token.is_empty() => {
                self.enter_paused(&mut inner, Some(token), Some(error));
            }
            TransportEvent::Error {
                error: error @ DownloadError::InvalidResumeToken(_),
                ..
            } => {
                // The checkpoint went bad after open; paused, but nothing to resume from.
                self.enter_paused(&mut inner, None, Some(error));
            }
            TransportEvent::Error { error, .. } => {
                self.enter_failed(&mut inner, error);
            }
            TransportEvent::Complete {
                artifact,
                original_url,
            } => {
                inner.active = None;
                let name = inner.task.as_ref().map_or_else(
                    || utils::get_filename_from_url(original_url.as_str()),
                    |t| t.request.destination_name().to_string(),
                );

                match self.store.persist(&artifact, &name).await {
                    Ok(stored) => {
                        if let Some(task) = inner.task.as_mut() {
                            task.state = TaskState::Completed;
                            task.artifact = Some(stored);
                        }
                        tracing::info!(url = %original_url, name = %name, "Download completed");
                        self.announce(TaskState::Completed, "Download completed");
                    }
                    Err(e) => {
                        tracing::warn!(
                            staging = %artifact.display(),
                            error = %e,
                            "Could not store finished download"
                        );
                        self.enter_failed(&mut inner, e);
                    }
                }
            }
        }

        Self::settle_pause_waiters(&mut inner);
    }

    /// The stream dropped its sink without a terminal event.
    async fn stream_closed(&self, lease: LeaseId) {
        let mut inner = self.inner.lock().await;
        if inner.active.as_ref().map(|a| a.lease) == Some(lease) {
            self.enter_failed(
                &mut inner,
                DownloadError::transport("stream ended without reporting an outcome"),
            );
            Self::settle_pause_waiters(&mut inner);
        }
    }

    fn enter_paused(
        &self,
        inner: &mut Inner,
        resume_token: Option<ResumeToken>,
        error: Option<DownloadError>,
    ) {
        inner.active = None;
        let resume_token = resume_token.filter(|t| !t.is_empty());
        let message = match (&error, resume_token.is_some()) {
            (Some(_), true) => "Connection interrupted; download can be resumed".to_string(),
            (Some(e), false) => format!("Download cannot be resumed: {e}"),
            (None, true) => "Download paused".to_string(),
            (None, false) => "Download paused; the server does not support resuming".to_string(),
        };

        tracing::info!(resumable = resume_token.is_some(), "Download paused");
        if let Some(task) = inner.task.as_mut() {
            task.state = TaskState::Paused;
            task.resume_token = resume_token;
            task.error = error;
        }
        self.announce(TaskState::Paused, message);
    }

    fn enter_failed(&self, inner: &mut Inner, error: DownloadError) {
        inner.active = None;
        tracing::warn!(error = %error, "Download failed");
        let message = format!("Download failed: {error}");
        if let Some(task) = inner.task.as_mut() {
            task.state = TaskState::Failed;
            task.error = Some(error);
        }
        self.announce(TaskState::Failed, message);
    }

    fn settle_pause_waiters(inner: &mut Inner) {
        if inner.pause_waiters.is_empty() {
            return;
        }

        let outcome = match inner.state() {
            TaskState::Paused if inner.has_token() => Ok(()),
            TaskState::Paused => Err(DownloadError::NoResumeData),
            state => Err(DownloadError::InvalidState {
                operation: "pause",
                state,
            }),
        };

        for waiter in inner.pause_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }
}
