//! # resumable-fetch
//!
//! A single-file download manager that can be paused and picked up later.
//! It supports:
//! - Pause and resume through an opaque resume token
//! - Resuming after a dropped connection when the server honours byte ranges
//! - Coalesced progress reporting to an [`Observer`]
//! - Atomic hand-off of the finished file into a destination directory
//!
//! ## Example Usage
//!
//! ```no_run
//! use resumable_fetch::{ConsoleObserver, DestinationStore, Downloader, HttpTransport, Settings};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::default();
//! let downloader = Downloader::new(
//!     Arc::new(HttpTransport::from_settings(&settings)?),
//!     DestinationStore::documents(),
//!     Arc::new(ConsoleObserver::new()),
//! );
//! let artifact = downloader.run("https://example.com/song.mp3", None).await?;
//! println!("saved to {}", artifact.path.display());
//! # Ok(())
//! # }
//! ```

pub mod args;
pub mod codec;
pub mod config;
pub mod downloader;
pub mod error;
pub mod observer;
pub mod progress;
pub mod state;
pub mod store;
pub mod transport;
pub mod utils;
pub mod worker;

pub use args::Args;
pub use config::Settings;
pub use downloader::Downloader;
pub use error::DownloadError;
pub use observer::{ConsoleObserver, Observer};
pub use progress::Progress;
pub use state::{DownloadRequest, DownloadTask, ResumeToken, StoredArtifact, TaskState};
pub use store::DestinationStore;
pub use transport::Transport;
pub use worker::HttpTransport;
