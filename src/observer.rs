//! Observer interface and the dispatcher that feeds it.
//!
//! The state machine never calls an [`Observer`] directly. State changes go
//! through an unbounded channel and progress through the coalescing
//! [`ProgressReporter`]; a single dispatcher task drains both and invokes
//! the observer, so every callback runs on that one context.
use crate::progress::{Progress, ProgressReporter, ProgressSample};
use crate::state::TaskState;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Receives user-visible notifications from a [`crate::Downloader`].
pub trait Observer: Send + Sync + 'static {
    /// Called once per state transition with a short status message.
    fn on_state_changed(&self, state: TaskState, message: &str);

    /// Called with the latest progress; intermediate values may be skipped.
    fn on_progress(&self, progress: Progress);
}

/// Renders notifications on an `indicatif` progress bar.
///
/// The bar length is fixed at 1000 so fractions map to permille.
pub struct ConsoleObserver {
    pub pb: ProgressBar,
}

impl ConsoleObserver {
    const SCALE: u64 = 1000;

    pub fn new() -> Self {
        let pb = ProgressBar::new(Self::SCALE);
        if let Ok(style) =
            ProgressStyle::with_template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}%")
        {
            pb.set_style(style.progress_chars("=>-"));
        }
        Self { pb }
    }
}

impl Default for ConsoleObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for ConsoleObserver {
    fn on_state_changed(&self, state: TaskState, message: &str) {
        match state {
            TaskState::Completed | TaskState::Failed => {
                self.pb.finish_with_message(message.to_string());
            }
            TaskState::Paused => self.pb.abandon_with_message(message.to_string()),
            TaskState::Running => {
                self.pb.reset_elapsed();
                self.pb.set_message(message.to_string());
            }
            TaskState::Idle => self.pb.set_message(message.to_string()),
        }
    }

    fn on_progress(&self, progress: Progress) {
        match progress {
            Progress::Fraction(f) => {
                #[allow(
                    clippy::cast_possible_truncation,
                    clippy::cast_sign_loss,
                    clippy::cast_precision_loss
                )]
                let pos = (f * Self::SCALE as f64).round() as u64;
                self.pb.set_position(pos);
            }
            Progress::Indeterminate => self.pb.tick(),
        }
    }
}

/// The sending half used by the state machine.
pub struct Notifier {
    states: mpsc::UnboundedSender<(TaskState, String)>,
    reporter: ProgressReporter,
}

impl Notifier {
    /// Spawn the dispatcher task for `observer`. Requires a Tokio runtime.
    pub fn spawn(observer: Arc<dyn Observer>) -> Self {
        let (states, state_rx) = mpsc::unbounded_channel();
        let (reporter, progress_rx) = ProgressReporter::channel();
        tokio::spawn(dispatch(observer, state_rx, progress_rx));
        Self { states, reporter }
    }

    pub fn state_changed(&self, state: TaskState, message: impl Into<String>) {
        // A closed channel only means the dispatcher is gone with the runtime.
        let _ = self.states.send((state, message.into()));
    }

    pub fn progress(&self, written: u64, total: Option<u64>) {
        self.reporter.report(written, total);
    }
}

/// Delivers the pending progress sample, if it has not been delivered yet.
fn flush_progress(
    observer: &dyn Observer,
    progress: &mut watch::Receiver<ProgressSample>,
    delivered_seq: &mut u64,
) {
    let sample = *progress.borrow_and_update();
    if sample.seq != *delivered_seq {
        *delivered_seq = sample.seq;
        observer.on_progress(sample.progress());
    }
}

async fn dispatch(
    observer: Arc<dyn Observer>,
    mut states: mpsc::UnboundedReceiver<(TaskState, String)>,
    mut progress: watch::Receiver<ProgressSample>,
) {
    let mut delivered_seq = 0;

    loop {
        tokio::select! {
            biased;

            msg = states.recv() => match msg {
                Some((state, message)) => {
                    // Progress reported before the transition must land first.
                    flush_progress(observer.as_ref(), &mut progress, &mut delivered_seq);
                    observer.on_state_changed(state, &message);
                }
                None => break,
            },

            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                flush_progress(observer.as_ref(), &mut progress, &mut delivered_seq);
            }
        }
    }

    while let Ok((state, message)) = states.try_recv() {
        flush_progress(observer.as_ref(), &mut progress, &mut delivered_seq);
        observer.on_state_changed(state, &message);
    }
    flush_progress(observer.as_ref(), &mut progress, &mut delivered_seq);
    tracing::debug!("Observer dispatcher stopped");
}
