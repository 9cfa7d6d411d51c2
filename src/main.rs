//! Command-line entrypoint for `rfetch`.
//!
//! Downloads one URL. Ctrl+C pauses and writes the resume token next to the
//! staging files; running the same command again continues from it.
use anyhow::{Context, Result};
use clap::Parser;
use resumable_fetch::codec;
use resumable_fetch::state::{load_token, save_token};
use resumable_fetch::{
    Args, ConsoleObserver, DestinationStore, DownloadError, DownloadRequest, Downloader,
    HttpTransport, Settings, TaskState, Transport,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn remove_token_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "Could not remove resume file");
    }
}

/// Resume from a saved token when there is a usable one, otherwise start fresh.
async fn begin(
    downloader: &Downloader,
    transport: &HttpTransport,
    request: DownloadRequest,
    token_path: &Path,
) -> Result<()> {
    let saved = load_token(token_path).await.unwrap_or_else(|e| {
        tracing::warn!(path = %token_path.display(), error = %e, "Ignoring unreadable resume file");
        None
    });

    if let Some(token) = saved {
        let same_url = codec::decode(&token)
            .map(|state| state.url == *request.source_url())
            .unwrap_or(true);

        if same_url {
            downloader.restore(request.clone(), token).await?;
            match downloader.resume().await {
                Ok(()) => {
                    println!("Resuming {}", request.source_url());
                    return Ok(());
                }
                Err(e) if e.is_unresumable() => {
                    println!("⚠️  Saved progress is unusable ({e}), starting over.");
                    remove_token_file(token_path).await;
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            println!("⚠️  Saved progress belongs to a different URL, starting over.");
            transport.discard(&token);
            remove_token_file(token_path).await;
        }
    }

    println!("Starting download for: {}", request.source_url());
    downloader.start_request(request).await?;
    Ok(())
}

/// Wait for the download to settle, pausing it on Ctrl+C.
///
/// Returns whether the user paused it.
async fn drive(downloader: &Downloader) -> Result<bool> {
    tokio::select! {
        biased;

        _ = downloader.wait() => Ok(false),

        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            println!("\n🛑 Received Ctrl+C. Pausing download...");
            match downloader.pause().await {
                Ok(()) | Err(DownloadError::NoResumeData) => Ok(true),
                // The transfer settled before the pause landed; report that instead.
                Err(DownloadError::InvalidState { .. }) => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
    }
}

/// The resumed stream found its partial file unusable after it was opened.
async fn lost_checkpoint(downloader: &Downloader) -> bool {
    downloader.task().await.is_some_and(|task| {
        task.state == TaskState::Paused
            && task.resume_token.is_none()
            && matches!(task.error, Some(DownloadError::InvalidResumeToken(_)))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("⚠️  Could not read settings: {e}");
            eprintln!("   (Continuing with defaults)\n");
            Settings::default()
        }
    };
    init_tracing(&settings.log_level);

    let request = DownloadRequest::new(&args.url, args.output.as_deref())?;
    let store = match args
        .dir
        .map(PathBuf::from)
        .or_else(|| settings.documents_dir.clone())
    {
        Some(dir) => DestinationStore::new(dir),
        None => DestinationStore::documents(),
    };

    let transport = Arc::new(HttpTransport::from_settings(&settings)?);
    let token_path = transport
        .staging_dir()
        .join(format!("{}.resume", request.destination_name()));

    let downloader = Downloader::new(
        transport.clone(),
        store,
        Arc::new(ConsoleObserver::new()),
    );

    begin(&downloader, &transport, request.clone(), &token_path).await?;

    let mut paused_by_user = drive(&downloader).await?;
    if !paused_by_user && lost_checkpoint(&downloader).await {
        println!("⚠️  Saved progress is unusable, starting over.");
        remove_token_file(&token_path).await;
        downloader.start_request(request).await?;
        paused_by_user = drive(&downloader).await?;
    }

    match downloader.outcome().await {
        Ok(artifact) => {
            remove_token_file(&token_path).await;
            println!("✅ Saved {}", artifact.path.display());
            Ok(())
        }
        Err(e) => {
            if let Some(token) = downloader.resume_token().await {
                if let Some(dir) = token_path.parent() {
                    tokio::fs::create_dir_all(dir).await?;
                }
                save_token(&token, &token_path)
                    .await
                    .context("Failed to save resume file")?;
                println!("Progress saved. Run the same command again to resume.");
            } else {
                remove_token_file(&token_path).await;
                if paused_by_user {
                    println!("The server does not support resuming; the next run starts over.");
                }
            }

            if paused_by_user {
                Ok(())
            } else {
                Err(e).context("Download did not finish")
            }
        }
    }
}
