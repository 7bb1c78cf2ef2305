//! Integration tests for the download pipeline.
//!
//! These tests drive full downloads against mock HTTP servers, covering
//! single-stream and chunked transfers, Append resume, the no-range-support
//! fallback, and cancellation.

mod support;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fetchpool::{
    ByteRange, LoadRequest, LoadRequestOptions, Request, RequestOptions, RequestState, Scheduler,
    WriteMode,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use support::{patterned_body, RangeServer};

const WAIT: Duration = Duration::from_secs(30);

fn options_for(dir: &TempDir) -> LoadRequestOptions {
    let mut options = LoadRequestOptions::new()
        .with_destination_dir(dir.path())
        .with_mode(WriteMode::Append);
    options.base = RequestOptions::default()
        .with_handler(Scheduler::new_standalone())
        .with_delay_between_attempts(Duration::from_millis(20));
    options
}

async fn mount_range_server(server: &MockServer, route: &str, body: Vec<u8>) {
    Mock::given(method("HEAD"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", body.len().to_string().as_str())
                .insert_header("Accept-Ranges", "bytes"),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(RangeServer::new(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_single_stream_download_full_flow() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");
    let body = patterned_body(1024 * 1024);
    mount_range_server(&server, "/data.bin", body.clone()).await;

    let final_progress = Arc::new(Mutex::new(0.0f64));
    let progress = Arc::clone(&final_progress);
    let options = options_for(&dir).with_progress(move |value| {
        *progress.lock().unwrap() = value;
    });
    let url = format!("{}/data.bin", server.uri());
    let request = LoadRequest::new(&url, options).expect("valid request");

    tokio::time::timeout(WAIT, request.wait()).await.expect("terminal");
    assert_eq!(request.state(), RequestState::Completed);

    let destination = dir.path().join("data.bin");
    let written = std::fs::read(&destination).expect("destination exists");
    assert_eq!(written, body, "destination must match the served body");
    assert!(
        !dir.path().join("data.bin.part").exists(),
        "part file must be gone after completion"
    );
    assert!(
        *final_progress.lock().unwrap() >= 0.9999,
        "progress must reach ~1.0, got {}",
        final_progress.lock().unwrap()
    );
}

#[tokio::test]
async fn test_download_uses_content_disposition_filename() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");

    Mock::given(path("/dl"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Disposition", r#"attachment; filename="named.bin""#)
                .set_body_bytes(b"content".to_vec()),
        )
        .mount(&server)
        .await;

    let url = format!("{}/dl", server.uri());
    let request = LoadRequest::new(&url, options_for(&dir)).expect("valid request");
    tokio::time::timeout(WAIT, request.wait()).await.expect("terminal");

    assert_eq!(request.state(), RequestState::Completed);
    assert_eq!(
        std::fs::read(dir.path().join("named.bin")).expect("named file"),
        b"content"
    );
}

#[tokio::test]
async fn test_chunked_download_merges_in_index_order() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");
    let body = patterned_body(512 * 1024 + 13);
    mount_range_server(&server, "/big.bin", body.clone()).await;

    let url = format!("{}/big.bin", server.uri());
    let request = LoadRequest::new(&url, options_for(&dir).with_chunks(4)).expect("valid request");

    tokio::time::timeout(WAIT, request.wait()).await.expect("terminal");
    assert_eq!(request.state(), RequestState::Completed);

    let written = std::fs::read(dir.path().join("big.bin")).expect("destination exists");
    assert_eq!(written.len(), body.len());
    assert_eq!(written, body, "chunks must merge in index order");
    for i in 0..4 {
        assert!(
            !dir.path().join(format!("big.bin_{i}.chunk")).exists(),
            "chunk file {i} must be cleaned up"
        );
    }
}

#[tokio::test]
async fn test_chunked_download_with_merge_while_progress() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");
    let body = patterned_body(256 * 1024);
    mount_range_server(&server, "/mwp.bin", body.clone()).await;

    let url = format!("{}/mwp.bin", server.uri());
    let options = options_for(&dir).with_chunks(3).with_merge_while_progress(true);
    let request = LoadRequest::new(&url, options).expect("valid request");

    tokio::time::timeout(WAIT, request.wait()).await.expect("terminal");
    assert_eq!(request.state(), RequestState::Completed);
    assert_eq!(
        std::fs::read(dir.path().join("mwp.bin")).expect("destination"),
        body
    );
}

#[tokio::test]
async fn test_chunked_falls_back_when_server_ignores_ranges() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");
    let body = patterned_body(128 * 1024);
    Mock::given(method("HEAD"))
        .and(path("/noranges.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", body.len().to_string().as_str()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/noranges.bin"))
        .respond_with(RangeServer::without_range_support(body.clone()))
        .mount(&server)
        .await;

    let completed = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&completed);
    let url = format!("{}/noranges.bin", server.uri());
    let mut options = options_for(&dir).with_chunks(4);
    options.base = options.base.on_completed(move |_path| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let request = LoadRequest::new(&url, options).expect("valid request");

    tokio::time::timeout(WAIT, request.wait()).await.expect("terminal");
    assert_eq!(request.state(), RequestState::Completed);
    assert_eq!(
        std::fs::read(dir.path().join("noranges.bin")).expect("destination"),
        body,
        "fallback single-stream output must be byte-identical"
    );
    assert_eq!(completed.load(Ordering::SeqCst), 1, "on_completed fires once");
}

#[tokio::test]
async fn test_append_resumes_partial_download_via_range() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");
    let body = patterned_body(64 * 1024);
    mount_range_server(&server, "/resume.bin", body.clone()).await;

    // Simulate an interrupted earlier session: half the file is on disk.
    let half = body.len() / 2;
    std::fs::write(dir.path().join("resume.bin.part"), &body[..half]).expect("seed part");

    let url = format!("{}/resume.bin", server.uri());
    let options = options_for(&dir).with_file_name("resume.bin");
    let request = LoadRequest::new(&url, options).expect("valid request");
    assert_eq!(request.bytes_written(), half as u64, "part length adopted");

    tokio::time::timeout(WAIT, request.wait()).await.expect("terminal");
    assert_eq!(request.state(), RequestState::Completed);
    assert_eq!(
        std::fs::read(dir.path().join("resume.bin")).expect("destination"),
        body,
        "resumed bytes plus partial bytes must equal the full content"
    );
}

#[tokio::test]
async fn test_ranged_download_writes_only_the_requested_slice() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");
    let body = patterned_body(10_000);
    mount_range_server(&server, "/slice.bin", body.clone()).await;

    let url = format!("{}/slice.bin", server.uri());
    let mut options = options_for(&dir).with_file_name("slice.bin");
    options.range = ByteRange {
        start: Some(1000),
        end: Some(4999),
    };
    let request = LoadRequest::new(&url, options).expect("valid request");

    tokio::time::timeout(WAIT, request.wait()).await.expect("terminal");
    assert_eq!(request.state(), RequestState::Completed);
    assert_eq!(
        std::fs::read(dir.path().join("slice.bin")).expect("destination"),
        body[1000..=4999],
    );
}

#[tokio::test]
async fn test_cancel_leaves_chunk_files_and_skips_on_completed() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");
    let body = patterned_body(64 * 1024);

    // Fast probe, then a GET that stalls so the download is reliably in
    // flight when the cancel arrives.
    Mock::given(method("HEAD"))
        .and(path("/slow.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", body.len().to_string().as_str())
                .insert_header("Accept-Ranges", "bytes"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/slow.bin"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(body)
                .set_delay(Duration::from_secs(60)),
        )
        .mount(&server)
        .await;

    let completed = Arc::new(AtomicU32::new(0));
    let cancelled = Arc::new(AtomicU32::new(0));
    let (completed_counter, cancelled_counter) = (Arc::clone(&completed), Arc::clone(&cancelled));

    let url = format!("{}/slow.bin", server.uri());
    let mut options = options_for(&dir).with_chunks(2);
    options.base = options
        .base
        .on_completed(move |_path| {
            completed_counter.fetch_add(1, Ordering::SeqCst);
        })
        .on_cancelled(move || {
            cancelled_counter.fetch_add(1, Ordering::SeqCst);
        });
    let request = LoadRequest::new(&url, options).expect("valid request");

    tokio::time::sleep(Duration::from_millis(300)).await;
    request.cancel();

    tokio::time::timeout(WAIT, request.wait()).await.expect("wait resolves");
    assert_eq!(request.state(), RequestState::Cancelled);
    assert_eq!(completed.load(Ordering::SeqCst), 0, "no completion after cancel");
    assert_eq!(cancelled.load(Ordering::SeqCst), 1, "cancel callback fires once");
    assert!(
        !dir.path().join("slow.bin").exists(),
        "no destination after cancellation"
    );
}

#[tokio::test]
async fn test_excluded_extension_from_response_fails_request() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");

    Mock::given(path("/evil"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Disposition", r#"attachment; filename="payload.exe""#)
                .set_body_bytes(b"MZ".to_vec()),
        )
        .mount(&server)
        .await;

    let url = format!("{}/evil", server.uri());
    let mut options = options_for(&dir);
    options.excluded_extensions = vec!["exe".to_string()];
    let request = LoadRequest::new(&url, options).expect("valid request");

    tokio::time::timeout(WAIT, request.wait()).await.expect("terminal");
    assert_eq!(request.state(), RequestState::Failed);
    assert!(!dir.path().join("payload.exe").exists());
}

#[tokio::test]
async fn test_transient_failures_are_retried_to_success() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");
    let body = patterned_body(4096);

    // HEAD probe always succeeds.
    Mock::given(method("HEAD"))
        .and(path("/flaky.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", body.len().to_string().as_str()),
        )
        .mount(&server)
        .await;

    // GET fails twice, then serves the file.
    let hits = Arc::new(AtomicU32::new(0));
    let hit_counter = Arc::clone(&hits);
    let served = body.clone();
    Mock::given(method("GET"))
        .and(path("/flaky.bin"))
        .respond_with(move |_request: &wiremock::Request| {
            if hit_counter.fetch_add(1, Ordering::SeqCst) < 2 {
                ResponseTemplate::new(503)
            } else {
                ResponseTemplate::new(200).set_body_bytes(served.clone())
            }
        })
        .mount(&server)
        .await;

    let url = format!("{}/flaky.bin", server.uri());
    let request = LoadRequest::new(&url, options_for(&dir)).expect("valid request");

    tokio::time::timeout(WAIT, request.wait()).await.expect("terminal");
    assert_eq!(request.state(), RequestState::Completed);
    assert_eq!(hits.load(Ordering::SeqCst), 3, "exactly three GET attempts");
    assert_eq!(
        std::fs::read(dir.path().join("flaky.bin")).expect("destination"),
        body
    );
}
