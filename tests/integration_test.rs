use indicatif::ProgressBar;
use resumable_fetch::codec::{self, ResumeState};
use resumable_fetch::{
    ConsoleObserver, DestinationStore, DownloadError, DownloadRequest, Downloader, HttpTransport,
    TaskState,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn body() -> Vec<u8> {
    (0..100u8).collect()
}

struct Harness {
    downloader: Downloader,
    pb: ProgressBar,
    staging: TempDir,
    documents: TempDir,
}

fn harness() -> Harness {
    let staging = tempdir().unwrap();
    let documents = tempdir().unwrap();
    // Report every chunk so tests can tell how far a transfer got.
    let transport = HttpTransport::new(reqwest::Client::new(), staging.path())
        .with_progress_interval(Duration::ZERO);
    let pb = ProgressBar::hidden();
    let observer = ConsoleObserver { pb: pb.clone() };
    let downloader = Downloader::new(
        Arc::new(transport),
        DestinationStore::new(documents.path()),
        Arc::new(observer),
    );
    Harness {
        downloader,
        pb,
        staging,
        documents,
    }
}

/// A staging file holding the first `offset` bytes, and a token pointing at it.
fn partial_transfer(
    staging: &Path,
    url: &str,
    offset: u64,
    validator: Option<&str>,
) -> (PathBuf, resumable_fetch::ResumeToken) {
    let partial_path = staging.join("half.part");
    std::fs::write(&partial_path, &body()[..offset as usize]).unwrap();
    let token = codec::encode(&ResumeState {
        url: Url::parse(url).unwrap(),
        partial_path: partial_path.clone(),
        offset,
        total: Some(100),
        validator: validator.map(str::to_string),
    })
    .unwrap();
    (partial_path, token)
}

#[tokio::test]
async fn test_fresh_download_lands_under_url_name() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/song.mp3"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Accept-Ranges", "bytes")
                .set_body_bytes(body()),
        )
        .mount(&server)
        .await;

    let h = harness();
    let url = format!("{}/files/song.mp3", server.uri());
    let artifact = h.downloader.run(&url, None).await.expect("download failed");

    assert_eq!(artifact.name, "song.mp3");
    assert_eq!(artifact.path, h.documents.path().join("song.mp3"));
    assert_eq!(std::fs::read(&artifact.path).unwrap(), body());
    assert_eq!(h.downloader.state().await, TaskState::Completed);

    // Nothing is left behind in staging.
    assert_eq!(std::fs::read_dir(h.staging.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_explicit_name_wins() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body()))
        .mount(&server)
        .await;

    let h = harness();
    let url = format!("{}/download?id=7", server.uri());
    let artifact = h
        .downloader
        .run(&url, Some("report.pdf"))
        .await
        .expect("download failed");

    assert_eq!(artifact.name, "report.pdf");
    assert_eq!(std::fs::read(&artifact.path).unwrap(), body());
}

#[tokio::test]
async fn test_resume_appends_remaining_range() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/song.mp3"))
        .and(header("Range", "bytes=50-"))
        .and(header("If-Range", "\"v1\""))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 50-99/100")
                .set_body_bytes(body()[50..].to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let h = harness();
    let url = format!("{}/files/song.mp3", server.uri());
    let (_, token) = partial_transfer(h.staging.path(), &url, 50, Some("\"v1\""));

    h.downloader
        .restore(DownloadRequest::new(&url, None).unwrap(), token)
        .await
        .unwrap();
    h.downloader.resume().await.unwrap();

    let artifact = h.downloader.outcome().await.expect("resume failed");
    assert_eq!(std::fs::read(&artifact.path).unwrap(), body());
}

#[tokio::test]
async fn test_server_ignoring_range_restarts_from_zero() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/song.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body()))
        .mount(&server)
        .await;

    let h = harness();
    let url = format!("{}/files/song.mp3", server.uri());
    let (_, token) = partial_transfer(h.staging.path(), &url, 50, None);

    h.downloader
        .restore(DownloadRequest::new(&url, None).unwrap(), token)
        .await
        .unwrap();
    h.downloader.resume().await.unwrap();

    let artifact = h.downloader.outcome().await.expect("restart failed");
    assert_eq!(std::fs::read(&artifact.path).unwrap(), body());
}

#[tokio::test]
async fn test_server_error_mid_resume_keeps_checkpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let h = harness();
    let url = format!("{}/files/song.mp3", server.uri());
    let (partial_path, token) = partial_transfer(h.staging.path(), &url, 50, None);

    h.downloader
        .restore(DownloadRequest::new(&url, None).unwrap(), token)
        .await
        .unwrap();
    h.downloader.resume().await.unwrap();

    assert_eq!(h.downloader.wait().await, TaskState::Paused);
    let task = h.downloader.task().await.unwrap();
    assert!(matches!(task.error, Some(DownloadError::Transport(_))));

    let checkpoint = codec::decode(&task.resume_token.expect("token kept")).unwrap();
    assert_eq!(checkpoint.offset, 50);
    assert_eq!(checkpoint.partial_path, partial_path);
    assert!(partial_path.exists());
}

#[tokio::test]
async fn test_not_found_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let h = harness();
    let url = format!("{}/missing.bin", server.uri());
    let err = h.downloader.run(&url, None).await.unwrap_err();

    assert!(matches!(err, DownloadError::Transport(_)), "{err:?}");
    assert_eq!(h.downloader.state().await, TaskState::Failed);
    assert_eq!(h.downloader.resume().await, Err(DownloadError::NoResumeData));
    assert!(!h.documents.path().join("missing.bin").exists());
}

#[tokio::test]
async fn test_pause_before_headers_has_nothing_to_resume() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body())
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let h = harness();
    let url = format!("{}/files/slow.bin", server.uri());
    h.downloader.start(&url, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.downloader.pause().await, Err(DownloadError::NoResumeData));
    assert_eq!(h.downloader.state().await, TaskState::Paused);
    assert_eq!(h.downloader.resume().await, Err(DownloadError::NoResumeData));
    assert_eq!(h.downloader.state().await, TaskState::Paused);

    // The unusable staging file is cleaned up.
    assert_eq!(std::fs::read_dir(h.staging.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_invalid_token_is_rejected_on_resume() {
    let h = harness();
    let url = "http://127.0.0.1:9/files/song.mp3";
    let token = resumable_fetch::ResumeToken::from(b"not json".to_vec());

    h.downloader
        .restore(DownloadRequest::new(url, None).unwrap(), token)
        .await
        .unwrap();
    let err = h.downloader.resume().await.unwrap_err();

    assert!(matches!(err, DownloadError::InvalidResumeToken(_)));
    assert_eq!(h.downloader.state().await, TaskState::Paused);
    assert_eq!(h.downloader.resume_token().await, None);
}

/// Reads one request head and returns it lowercased.
async fn read_request(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    String::from_utf8_lossy(&head).to_lowercase()
}

/// Sends the headers of a full 200 response for `body()` and its first 50 bytes.
async fn send_first_half(stream: &mut TcpStream) {
    stream
        .write_all(
            b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nAccept-Ranges: bytes\r\nETag: \"v1\"\r\n\r\n",
        )
        .await
        .unwrap();
    stream.write_all(&body()[..50]).await.unwrap();
    stream.flush().await.unwrap();
}

async fn wait_for_position(pb: &ProgressBar, position: u64) {
    for _ in 0..400 {
        if pb.position() == position {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("progress bar stuck at {}", pb.position());
}

#[tokio::test]
async fn test_pause_mid_body_then_resume_from_checkpoint() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/files/song.mp3", listener.local_addr().unwrap());
    let (requests_tx, mut requests) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        // First connection stalls after half the body.
        let (mut first, _) = listener.accept().await.unwrap();
        requests_tx.send(read_request(&mut first).await).unwrap();
        send_first_half(&mut first).await;

        let (mut second, _) = listener.accept().await.unwrap();
        requests_tx.send(read_request(&mut second).await).unwrap();
        second
            .write_all(
                b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 50-99/100\r\nContent-Length: 50\r\nETag: \"v1\"\r\n\r\n",
            )
            .await
            .unwrap();
        second.write_all(&body()[50..]).await.unwrap();
        second.flush().await.unwrap();
        drop(first);
        let _ = second.read(&mut [0u8; 1]).await;
    });

    let h = harness();
    h.downloader.start(&url, None).await.unwrap();
    wait_for_position(&h.pb, 500).await;

    h.downloader.pause().await.expect("pause should keep a checkpoint");
    assert_eq!(h.downloader.state().await, TaskState::Paused);
    assert_eq!(h.downloader.outcome().await, Err(DownloadError::Paused));

    let checkpoint = codec::decode(&h.downloader.resume_token().await.unwrap()).unwrap();
    assert_eq!(checkpoint.offset, 50);
    assert_eq!(checkpoint.total, Some(100));
    assert_eq!(checkpoint.validator.as_deref(), Some("\"v1\""));
    assert_eq!(std::fs::read(&checkpoint.partial_path).unwrap(), &body()[..50]);

    h.downloader.resume().await.unwrap();
    let artifact = h.downloader.outcome().await.expect("resume failed");
    assert_eq!(std::fs::read(&artifact.path).unwrap(), body());

    let first = requests.recv().await.unwrap();
    assert!(!first.contains("range:"), "{first}");
    let second = requests.recv().await.unwrap();
    assert!(second.contains("range: bytes=50-"), "{second}");
    assert!(second.contains("if-range: \"v1\""), "{second}");
}

#[tokio::test]
async fn test_connection_dropped_mid_body_pauses_with_checkpoint() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/files/song.mp3", listener.local_addr().unwrap());

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_request(&mut stream).await;
        send_first_half(&mut stream).await;
        // Closing here leaves the body 50 bytes short of Content-Length.
    });

    let h = harness();
    h.downloader.start(&url, None).await.unwrap();

    assert_eq!(h.downloader.wait().await, TaskState::Paused);
    let task = h.downloader.task().await.unwrap();
    assert!(matches!(task.error, Some(DownloadError::Transport(_))), "{:?}", task.error);

    let checkpoint = codec::decode(&task.resume_token.expect("checkpoint kept")).unwrap();
    assert_eq!(checkpoint.offset, 50);
    assert_eq!(std::fs::read(&checkpoint.partial_path).unwrap(), &body()[..50]);

    let err = h.downloader.outcome().await.unwrap_err();
    assert!(matches!(err, DownloadError::Transport(_)));
}

#[tokio::test]
async fn test_missing_partial_file_leaves_nothing_to_resume() {
    let h = harness();
    let url = "http://127.0.0.1:9/files/song.mp3";
    let (partial_path, token) = partial_transfer(h.staging.path(), url, 50, None);
    std::fs::remove_file(&partial_path).unwrap();

    h.downloader
        .restore(DownloadRequest::new(url, None).unwrap(), token)
        .await
        .unwrap();
    h.downloader.resume().await.unwrap();

    assert_eq!(h.downloader.wait().await, TaskState::Paused);
    let task = h.downloader.task().await.unwrap();
    assert_eq!(task.resume_token, None);
    assert!(matches!(task.error, Some(DownloadError::InvalidResumeToken(_))));
    assert_eq!(h.downloader.resume().await, Err(DownloadError::NoResumeData));
}
