use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{CONTENT_DISPOSITION, HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use crate::error::AbiError;

/// A successfully staged network resource: the filename the server declared
/// for it and the local path the bytes landed at.
#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub filename: String,
    pub path: PathBuf,
}

pub trait ResourceFetcher: Send + Sync {
    fn fetch(&self, url: &str, destination_dir: &Path) -> Result<FetchedResource, AbiError>;
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, AbiError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("abi-connect/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| AbiError::DownloadHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| AbiError::DownloadHttp(err.to_string()))?;
        Ok(Self { client })
    }
}

impl ResourceFetcher for HttpFetcher {
    fn fetch(&self, url: &str, destination_dir: &Path) -> Result<FetchedResource, AbiError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| AbiError::DownloadHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "download request failed".to_string());
            return Err(AbiError::DownloadStatus { status, message });
        }

        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(disposition_filename)
            .or_else(|| url_filename(url))
            .ok_or_else(|| {
                AbiError::DownloadHttp(format!("no filename derivable for {url}"))
            })?;

        std::fs::create_dir_all(destination_dir)
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix("abi-connect-dl")
            .tempfile_in(destination_dir)
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, temp.as_file_mut())
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        let path = destination_dir.join(&filename);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|err| AbiError::Filesystem(err.to_string()))?;
        }
        temp.persist(&path)
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;

        debug!(url = %url, path = %path.display(), "resource staged");
        Ok(FetchedResource { filename, path })
    }
}

/// Bounded-retry wrapper over any fetcher. On failure waits `backoff` and
/// tries again, up to `max_retries` total attempts; exhaustion is reported as
/// an explicit per-item failure so the caller can skip and continue.
pub struct RetryingFetcher<F> {
    inner: F,
    max_retries: usize,
    backoff: Duration,
}

impl<F: ResourceFetcher> RetryingFetcher<F> {
    pub fn new(inner: F, max_retries: usize, backoff: Duration) -> Self {
        Self {
            inner,
            max_retries: max_retries.max(1),
            backoff,
        }
    }
}

impl<F: ResourceFetcher> ResourceFetcher for RetryingFetcher<F> {
    fn fetch(&self, url: &str, destination_dir: &Path) -> Result<FetchedResource, AbiError> {
        for attempt in 1..=self.max_retries {
            match self.inner.fetch(url, destination_dir) {
                Ok(resource) => return Ok(resource),
                Err(err) => {
                    warn!(url = %url, attempt, max = self.max_retries, error = %err, "fetch attempt failed");
                    if attempt < self.max_retries {
                        thread::sleep(self.backoff);
                    }
                }
            }
        }
        Err(AbiError::DownloadExhausted {
            url: url.to_string(),
            attempts: self.max_retries,
        })
    }
}

/// Filename declared in a `Content-Disposition` header value, unquoted.
/// The header is server-controlled, so only the final path component is
/// kept; a name that reduces to nothing usable is treated as absent.
pub fn disposition_filename(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename=") {
            let declared = rest.trim().trim_matches('"');
            let name = declared.rsplit(['/', '\\']).next().unwrap_or(declared);
            if !name.is_empty() && name != "." && name != ".." {
                return Some(name.to_string());
            }
        }
    }
    None
}

fn url_filename(url: &str) -> Option<String> {
    let tail = url.split(['?', '#']).next()?;
    let name = tail.rsplit('/').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
