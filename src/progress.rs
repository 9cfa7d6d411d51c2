//! Progress reporting and throttling.
//!
//! The transport produces raw byte counts; [`ProgressReporter`] turns them
//! into a [`Progress`] value and publishes it through a `watch` channel so
//! the sender never waits on the observer. Only the latest sample is kept.

use std::time::{Duration, Instant};
use tokio::sync::watch;

/// What an observer is shown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// Completed fraction in `[0.0, 1.0]`.
    Fraction(f64),
    /// The total length is unknown or zero.
    Indeterminate,
}

/// Latest byte counts for the running transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSample {
    /// Bytes written so far, including any bytes carried over from a resume.
    pub written: u64,
    /// Expected total length, if known.
    pub total: Option<u64>,
    /// Monotonically increasing sequence number for change detection.
    pub seq: u64,
}

impl ProgressSample {
    pub fn progress(&self) -> Progress {
        match self.total {
            Some(total) if total > 0 => {
                #[allow(clippy::cast_precision_loss)]
                let fraction = self.written as f64 / total as f64;
                Progress::Fraction(fraction.clamp(0.0, 1.0))
            }
            _ => Progress::Indeterminate,
        }
    }
}

/// Publishes progress samples without blocking the caller.
#[derive(Debug)]
pub struct ProgressReporter {
    tx: watch::Sender<ProgressSample>,
}

impl ProgressReporter {
    /// Create a reporter and the receiver the observer side reads from.
    pub fn channel() -> (Self, watch::Receiver<ProgressSample>) {
        let (tx, rx) = watch::channel(ProgressSample::default());
        (Self { tx }, rx)
    }

    /// Record the latest counts. Overwrites any sample not yet consumed.
    pub fn report(&self, written: u64, total: Option<u64>) {
        // send_modify avoids clone and is infallible
        self.tx.send_modify(|sample| {
            sample.written = written;
            sample.total = total;
            sample.seq += 1;
        });
    }
}

/// Batches the byte counts of a body loop into spaced progress events.
///
/// Bytes recorded between two emits are carried over, so the sum of every
/// emitted batch plus the final [`ProgressThrottle::flush`] equals the bytes
/// recorded.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    pending: u64,
}

impl ProgressThrottle {
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            pending: 0,
        }
    }

    /// Count `len` new bytes. Returns the batch to report once `interval`
    /// has passed since the previous one; the first call always reports.
    pub fn record(&mut self, len: u64) -> Option<u64> {
        self.pending += len;
        let now = Instant::now();
        if self
            .last_emit
            .is_some_and(|last| now.duration_since(last) < self.interval)
        {
            return None;
        }
        self.last_emit = Some(now);
        Some(std::mem::take(&mut self.pending))
    }

    /// Bytes not reported yet, regardless of timing.
    pub fn flush(&mut self) -> u64 {
        std::mem::take(&mut self.pending)
    }
}
