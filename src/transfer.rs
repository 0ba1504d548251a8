use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderValue, RANGE, USER_AGENT};
use tracing::{debug, info, warn};

use crate::domain::ArchiveManifestEntry;
use crate::error::MolidError;

pub const PUBCHEM_SDF_URL: &str = "https://ftp.ncbi.nlm.nih.gov/pubchem/Compound/CURRENT-Full/SDF/";

static LISTING_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"<a href="(?P<name>[A-Za-z0-9_.\-]+\.sdf\.gz)">[^<]*</a>\s*(?P<modified>\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2})?"#,
    )
    .expect("listing pattern is valid")
});

pub trait ArchiveSource {
    fn list_remote_archives(&self) -> Result<Vec<ArchiveManifestEntry>, MolidError>;
    fn download(
        &self,
        entry: &ArchiveManifestEntry,
        destination_dir: &Path,
    ) -> Result<PathBuf, MolidError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
        }
    }
}

enum AttemptError {
    Transient(String),
    Fatal(MolidError),
}

#[derive(Clone)]
pub struct PubchemHttpSource {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl PubchemHttpSource {
    pub fn new() -> Result<Self, MolidError> {
        Self::with_base_url(PUBCHEM_SDF_URL, RetryPolicy::default())
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        retry: RetryPolicy,
    ) -> Result<Self, MolidError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("molid/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MolidError::TransferHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| MolidError::TransferHttp(err.to_string()))?;

        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            client,
            base_url,
            retry,
        })
    }

    fn archive_url(&self, name: &str) -> String {
        format!("{}{}", self.base_url, name)
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, MolidError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        let mut delay = self.retry.base_delay;
        let mut attempt = 1usize;
        loop {
            let response = make_req().send();
            let retry = match &response {
                Ok(resp) => is_retryable_status(resp.status().as_u16()),
                Err(err) => is_retryable_error(err),
            };
            if retry && attempt < self.retry.max_attempts {
                thread::sleep(delay);
                delay = delay.saturating_mul(2);
                attempt += 1;
                continue;
            }
            return response.map_err(|err| MolidError::TransferHttp(err.to_string()));
        }
    }

    fn remote_size(&self, name: &str) -> Result<Option<u64>, AttemptError> {
        let response = self
            .client
            .head(self.archive_url(name))
            .send()
            .map_err(|err| classify_request_error(name, err))?;
        let status = response.status().as_u16();
        if is_retryable_status(status) {
            return Err(AttemptError::Transient(format!("HEAD returned status {status}")));
        }
        // Some mirrors refuse HEAD; the GET that follows decides.
        if !response.status().is_success() {
            debug!(archive = %name, status, "size probe refused");
            return Ok(None);
        }
        Ok(response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok()))
    }

    fn attempt_download(
        &self,
        entry: &ArchiveManifestEntry,
        local_path: &Path,
    ) -> Result<(), AttemptError> {
        let remote_size = self.remote_size(&entry.name)?.or(entry.size);
        let mut start = local_len(local_path);

        if let Some(size) = remote_size {
            if start > size {
                warn!(archive = %entry.name, start, size, "local copy larger than remote; restarting");
                remove_partial(local_path)?;
                start = 0;
            } else if start == size && size > 0 {
                debug!(archive = %entry.name, "local copy already complete");
                return Ok(());
            }
        }

        let mut request = self.client.get(self.archive_url(&entry.name));
        if start > 0 {
            debug!(archive = %entry.name, start, "resuming partial download");
            request = request.header(RANGE, format!("bytes={start}-"));
        }
        let mut response = request
            .send()
            .map_err(|err| classify_request_error(&entry.name, err))?;

        let status = response.status().as_u16();
        let append = match status {
            206 if start > 0 => true,
            200 | 206 => {
                if start > 0 {
                    debug!(archive = %entry.name, "server ignored range request; restarting");
                }
                false
            }
            // Without a known size a complete local copy is only detectable here;
            // gzip validation catches a bad one.
            416 if start > 0 => {
                debug!(archive = %entry.name, start, "range past end; keeping local copy");
                return Ok(());
            }
            416 => {
                remove_partial(local_path)?;
                return Err(AttemptError::Transient(
                    "requested range not satisfiable; restarting".to_string(),
                ));
            }
            status if is_retryable_status(status) => {
                return Err(AttemptError::Transient(format!("status {status}")));
            }
            status => {
                return Err(AttemptError::Fatal(MolidError::TransferStatus {
                    archive: entry.name.clone(),
                    status,
                }));
            }
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(local_path)
            .map_err(|err| AttemptError::Fatal(MolidError::Filesystem(err.to_string())))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| AttemptError::Transient(format!("body interrupted: {err}")))?;
        drop(file);

        let written = local_len(local_path);
        if let Some(size) = remote_size {
            if written != size {
                return Err(AttemptError::Transient(format!(
                    "size mismatch: have {written} of {size} bytes"
                )));
            }
        }
        Ok(())
    }
}

impl ArchiveSource for PubchemHttpSource {
    fn list_remote_archives(&self) -> Result<Vec<ArchiveManifestEntry>, MolidError> {
        let response = self
            .send_with_retries(|| self.client.get(&self.base_url))
            .map_err(|err| MolidError::Listing(err.to_string()))?;
        if !response.status().is_success() {
            return Err(MolidError::Listing(format!(
                "listing returned status {}",
                response.status().as_u16()
            )));
        }
        let body = response
            .text()
            .map_err(|err| MolidError::Listing(err.to_string()))?;
        let entries = parse_listing(&body);
        info!(count = entries.len(), "remote archives listed");
        Ok(entries)
    }

    fn download(
        &self,
        entry: &ArchiveManifestEntry,
        destination_dir: &Path,
    ) -> Result<PathBuf, MolidError> {
        fs::create_dir_all(destination_dir)
            .map_err(|err| MolidError::Filesystem(err.to_string()))?;
        let local_path = destination_dir.join(&entry.name);

        let mut delay = self.retry.base_delay;
        let mut last_reason = String::new();
        for attempt in 1..=self.retry.max_attempts {
            match self.attempt_download(entry, &local_path) {
                Ok(()) => {
                    info!(archive = %entry.name, attempt, "download complete");
                    return Ok(local_path);
                }
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Transient(reason)) => {
                    warn!(archive = %entry.name, attempt, %reason, "download attempt failed");
                    last_reason = reason;
                    if attempt < self.retry.max_attempts {
                        thread::sleep(delay);
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }

        Err(MolidError::TransferExhausted {
            archive: entry.name.clone(),
            attempts: self.retry.max_attempts,
            reason: last_reason,
        })
    }
}

/// Extracts `*.sdf.gz` entries from an HTTP directory index, sorted by name.
pub fn parse_listing(html: &str) -> Vec<ArchiveManifestEntry> {
    let mut entries: Vec<ArchiveManifestEntry> = LISTING_ENTRY
        .captures_iter(html)
        .map(|caps| ArchiveManifestEntry {
            name: caps["name"].to_string(),
            size: None,
            last_modified: caps
                .name("modified")
                .map(|value| value.as_str().split_whitespace().collect::<Vec<_>>().join(" ")),
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries.dedup_by(|a, b| a.name == b.name);
    entries
}

fn local_len(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

fn remove_partial(path: &Path) -> Result<(), AttemptError> {
    if path.exists() {
        fs::remove_file(path)
            .map_err(|err| AttemptError::Fatal(MolidError::Filesystem(err.to_string())))?;
    }
    Ok(())
}

fn classify_request_error(archive: &str, err: reqwest::Error) -> AttemptError {
    if is_retryable_error(&err) {
        AttemptError::Transient(err.to_string())
    } else {
        AttemptError::Fatal(MolidError::TransferHttp(format!("{archive}: {err}")))
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_keeps_only_sdf_archives() {
        let html = r#"
<a href="Compound_000500001_001000000.sdf.gz">Compound_000500001_001000000.sdf.gz</a>  2024-05-12 10:23  301M
<a href="Compound_000000001_000500000.sdf.gz">Compound_000000001_000500000.sdf.gz</a>  2024-05-12 10:21  298M
<a href="Compound_000000001_000500000.sdf.gz.md5">Compound_000000001_000500000.sdf.gz.md5</a>  2024-05-12 10:21  68
<a href="README">README</a>
"#;
        let entries = parse_listing(html);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "Compound_000000001_000500000.sdf.gz");
        assert_eq!(entries[0].last_modified.as_deref(), Some("2024-05-12 10:21"));
        assert_eq!(entries[1].name, "Compound_000500001_001000000.sdf.gz");
    }
}
