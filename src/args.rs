use clap::Parser;

/// A resumable single-file downloader.
///
/// Press Ctrl+C to pause; running the same command again picks the
/// download up where it stopped.
#[derive(Parser, Debug)]
#[command(name = "rfetch", author, version, about, long_about = None)]
pub struct Args {
    /// The URL of the file to download.
    pub url: String,

    /// The name to store the file under. Defaults to the last segment of the URL.
    #[arg(short, long)]
    pub output: Option<String>,

    /// Directory to store the finished file in. Defaults to the documents directory.
    #[arg(short, long)]
    pub dir: Option<String>,
}
