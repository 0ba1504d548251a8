use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use tiny_http::{Method, Response, Server};

use molid::domain::ArchiveManifestEntry;
use molid::error::MolidError;
use molid::transfer::{ArchiveSource, PubchemHttpSource, RetryPolicy};

const ARCHIVE: &str = "Compound_000000001_000500000.sdf.gz";

fn fast_retry(max_attempts: usize) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(10),
    }
}

fn entry() -> ArchiveManifestEntry {
    ArchiveManifestEntry {
        name: ARCHIVE.to_string(),
        size: None,
        last_modified: None,
    }
}

/// Serves `body` for GET, honouring `Range: bytes=N-` (416 past the end); HEAD is refused.
fn spawn_range_server(body: Vec<u8>, count: usize) -> (String, Arc<Mutex<Vec<Option<String>>>>) {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    let ranges = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&ranges);
    thread::spawn(move || {
        for _ in 0..count {
            let Ok(request) = server.recv() else {
                return;
            };
            if *request.method() == Method::Head {
                let _ = request.respond(Response::empty(405));
                continue;
            }
            let range = request
                .headers()
                .iter()
                .find(|header| header.field.equiv("Range"))
                .map(|header| header.value.as_str().to_string());
            seen.lock().unwrap().push(range.clone());
            let start = range
                .as_deref()
                .and_then(|value| value.strip_prefix("bytes="))
                .and_then(|value| value.trim_end_matches('-').parse::<usize>().ok());
            let response = match start {
                Some(start) if start >= body.len() => Response::empty(416).boxed(),
                Some(start) => Response::from_data(body[start..].to_vec()).with_status_code(206).boxed(),
                None => Response::from_data(body.clone()).boxed(),
            };
            let _ = request.respond(response);
        }
    });
    (format!("http://{addr}/"), ranges)
}

#[test]
fn download_resumes_partial_file_with_range() {
    let body: Vec<u8> = (0..4096u32).map(|idx| (idx % 251) as u8).collect();
    let (base_url, ranges) = spawn_range_server(body.clone(), 2);
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(ARCHIVE), &body[..1000]).unwrap();

    let source = PubchemHttpSource::with_base_url(base_url, fast_retry(2)).unwrap();
    let path = source.download(&entry(), dir.path()).unwrap();

    assert_eq!(std::fs::read(path).unwrap(), body);
    assert_eq!(
        ranges.lock().unwrap().as_slice(),
        &[Some("bytes=1000-".to_string())]
    );
}

#[test]
fn download_without_partial_fetches_whole_file() {
    let body = b"complete archive bytes".to_vec();
    let (base_url, ranges) = spawn_range_server(body.clone(), 2);
    let dir = tempfile::tempdir().unwrap();

    let source = PubchemHttpSource::with_base_url(base_url, fast_retry(2)).unwrap();
    let path = source.download(&entry(), dir.path()).unwrap();

    assert_eq!(std::fs::read(path).unwrap(), body);
    assert_eq!(ranges.lock().unwrap().as_slice(), &[None]);
}

#[test]
fn complete_local_copy_survives_unsatisfiable_range() {
    let body: Vec<u8> = (0..2048u32).map(|idx| (idx % 13) as u8).collect();
    let (base_url, ranges) = spawn_range_server(body.clone(), 4);
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(ARCHIVE), &body).unwrap();

    let source = PubchemHttpSource::with_base_url(base_url, fast_retry(3)).unwrap();
    let path = source.download(&entry(), dir.path()).unwrap();

    assert_eq!(std::fs::read(path).unwrap(), body);
    assert_eq!(
        ranges.lock().unwrap().as_slice(),
        &[Some("bytes=2048-".to_string())]
    );
}

#[test]
fn missing_archive_is_fatal_without_retries() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    let gets = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&gets);
    thread::spawn(move || {
        while let Ok(request) = server.recv() {
            if *request.method() == Method::Get {
                *counter.lock().unwrap() += 1;
            }
            let _ = request.respond(Response::empty(404));
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let source = PubchemHttpSource::with_base_url(format!("http://{addr}/"), fast_retry(4)).unwrap();
    let err = source.download(&entry(), dir.path()).unwrap_err();

    assert_matches!(err, MolidError::TransferStatus { status: 404, .. });
    assert_eq!(*gets.lock().unwrap(), 1);
}

#[test]
fn unavailable_server_exhausts_attempts() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    thread::spawn(move || {
        while let Ok(request) = server.recv() {
            let _ = request.respond(Response::empty(503));
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let source = PubchemHttpSource::with_base_url(format!("http://{addr}/"), fast_retry(2)).unwrap();
    let err = source.download(&entry(), dir.path()).unwrap_err();

    assert_matches!(err, MolidError::TransferExhausted { attempts: 2, .. });
    assert!(err.skips_archive());
}

#[test]
fn listing_is_read_from_directory_index() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    thread::spawn(move || {
        if let Ok(request) = server.recv() {
            let html = format!(
                "<html><body><a href=\"{ARCHIVE}\">{ARCHIVE}</a>  2024-05-12 10:21  298M\n\
                 <a href=\"{ARCHIVE}.md5\">{ARCHIVE}.md5</a>  2024-05-12 10:21  68\n</body></html>"
            );
            let _ = request.respond(Response::from_string(html));
        }
    });

    let source = PubchemHttpSource::with_base_url(format!("http://{addr}/"), fast_retry(1)).unwrap();
    let entries = source.list_remote_archives().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, ARCHIVE);
}
