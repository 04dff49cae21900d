use std::collections::BTreeMap;
use std::fs;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::archive::ArchiveCodec;
use crate::config::CloudIndexConfig;
use crate::error::RetrievalError;
use crate::fs_util::WildcardPattern;

/// A file known to the cloud archive index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub file_id: u64,
    pub dataset: String,
    pub relative_path: String,
    #[serde(default)]
    pub transaction_id: u64,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub modified_utc: Option<DateTime<Utc>>,
}

impl RemoteFile {
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.relative_path)
    }

    /// Folder part of the relative path, `""` for files at the dataset root.
    pub fn subfolder(&self) -> &str {
        match self.relative_path.rfind(['/', '\\']) {
            Some(idx) => &self.relative_path[..idx],
            None => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloudQuery {
    pub dataset: String,
    pub subfolder: Option<String>,
    pub file_pattern: Option<String>,
    pub recurse: bool,
}

impl CloudQuery {
    pub fn dataset(dataset: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            ..Self::default()
        }
    }

    pub fn in_subfolder(mut self, subfolder: Option<&str>) -> Self {
        self.subfolder = subfolder
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        self
    }

    pub fn matching(mut self, pattern: &str) -> Self {
        self.file_pattern = Some(pattern.to_string());
        self
    }

    pub fn recursive(mut self) -> Self {
        self.recurse = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub file_id: u64,
    pub result: Result<Utf8PathBuf, String>,
}

pub trait CloudIndex {
    fn find_files(&self, query: &CloudQuery) -> Result<Vec<RemoteFile>, RetrievalError>;

    /// Downloads `files` into `target_dir` in one batch and reports per-file results.
    fn download(
        &self,
        files: &[RemoteFile],
        target_dir: &Utf8Path,
    ) -> Result<Vec<DownloadOutcome>, RetrievalError>;
}

/// Filters an index listing the way the index itself is expected to, used by
/// in-memory indexes and as a safety net over remote responses.
pub fn filter_listing(files: &[RemoteFile], query: &CloudQuery) -> Result<Vec<RemoteFile>, RetrievalError> {
    let pattern = match &query.file_pattern {
        Some(pattern) => Some(WildcardPattern::new(pattern)?),
        None => None,
    };
    let subfolder = query
        .subfolder
        .as_deref()
        .map(|value| value.replace('\\', "/").trim_matches('/').to_ascii_lowercase());

    Ok(files
        .iter()
        .filter(|file| file.dataset.eq_ignore_ascii_case(&query.dataset))
        .filter(|file| {
            let folder = file.subfolder().replace('\\', "/").to_ascii_lowercase();
            match (&subfolder, query.recurse) {
                (Some(sub), false) => folder == *sub,
                (Some(sub), true) => folder == *sub || folder.starts_with(&format!("{sub}/")),
                (None, false) => folder.is_empty(),
                (None, true) => true,
            }
        })
        .filter(|file| {
            pattern
                .as_ref()
                .map(|pattern| pattern.is_match(file.file_name()))
                .unwrap_or(true)
        })
        .cloned()
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedDownload {
    pub file: RemoteFile,
    pub target_dir: Utf8PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Added,
    AlreadyQueued,
    /// A different file with the same name already targets the directory.
    NameTaken,
}

impl Enqueued {
    /// True when the file will be downloaded on the next drain.
    pub fn is_queued(self) -> bool {
        matches!(self, Enqueued::Added | Enqueued::AlreadyQueued)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub downloaded: Vec<Utf8PathBuf>,
    pub failed: Vec<String>,
    pub pending: usize,
}

impl DrainReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.pending == 0
    }
}

/// Cloud files waiting to be materialized locally. Entries are only removed
/// once their download is confirmed on disk or their failure has been logged.
#[derive(Debug, Clone, Default)]
pub struct DownloadQueue {
    entries: Vec<QueuedDownload>,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[QueuedDownload] {
        &self.entries
    }

    /// Downloads land in `target_dir` under their file name, so a second file
    /// with the same name for the same directory is refused.
    pub fn enqueue(&mut self, file: RemoteFile, target_dir: &Utf8Path) -> Enqueued {
        let same_dir = self.entries.iter().filter(|entry| entry.target_dir == target_dir);
        for entry in same_dir {
            if entry.file.file_id == file.file_id {
                debug!(file = %file.relative_path, "already queued for download");
                return Enqueued::AlreadyQueued;
            }
            if entry.file.file_name().eq_ignore_ascii_case(file.file_name()) {
                warn!(
                    file = %file.relative_path,
                    queued = %entry.file.relative_path,
                    target = %target_dir,
                    "another file with this name is already queued for the directory; not queued"
                );
                return Enqueued::NameTaken;
            }
        }
        debug!(file = %file.relative_path, target = %target_dir, "queued for download");
        self.entries.push(QueuedDownload {
            file,
            target_dir: target_dir.to_path_buf(),
        });
        Enqueued::Added
    }

    pub fn process<C: CloudIndex + ?Sized>(&mut self, index: &C) -> DrainReport {
        let mut report = DrainReport::default();
        if self.entries.is_empty() {
            return report;
        }

        let mut batches: BTreeMap<Utf8PathBuf, Vec<RemoteFile>> = BTreeMap::new();
        for entry in &self.entries {
            batches
                .entry(entry.target_dir.clone())
                .or_default()
                .push(entry.file.clone());
        }

        for (target_dir, files) in batches {
            info!(count = files.len(), target = %target_dir, "downloading from cloud index");
            if let Err(err) = fs::create_dir_all(target_dir.as_std_path()) {
                error!(target = %target_dir, error = %err, "cannot create download directory");
                continue;
            }
            let outcomes = match index.download(&files, &target_dir) {
                Ok(outcomes) => outcomes,
                Err(err) => {
                    error!(target = %target_dir, error = %err, "cloud download failed; entries kept in queue");
                    continue;
                }
            };
            for outcome in outcomes {
                let Some(position) = self.entries.iter().position(|entry| {
                    entry.file.file_id == outcome.file_id && entry.target_dir == target_dir
                }) else {
                    warn!(file_id = outcome.file_id, "cloud index reported an unrequested file");
                    continue;
                };
                match outcome.result {
                    Ok(path) if path.as_std_path().is_file() => {
                        self.entries.remove(position);
                        report.downloaded.push(path);
                    }
                    Ok(path) => {
                        warn!(path = %path, "download reported success but file is missing; kept in queue");
                    }
                    Err(message) => {
                        let entry = self.entries.remove(position);
                        error!(file = %entry.file.relative_path, "download failed: {message}");
                        report
                            .failed
                            .push(format!("{}: {message}", entry.file.relative_path));
                    }
                }
            }
        }

        report.pending = self.entries.len();
        if report.pending > 0 {
            warn!(pending = report.pending, "download queue not fully drained");
        }
        report
    }
}

#[derive(Debug, Serialize)]
struct DownloadRequest<'a> {
    file_ids: Vec<u64>,
    dataset_paths: Vec<&'a str>,
}

#[derive(Clone)]
pub struct HttpCloudIndex {
    client: Client,
    base_url: String,
    codec: ArchiveCodec,
}

impl HttpCloudIndex {
    pub fn new(config: &CloudIndexConfig) -> Result<Self, RetrievalError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("artifact-retrieval/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| RetrievalError::CloudHttp(err.to_string()))?,
        );

        if let Ok(token) = std::env::var("CLOUD_INDEX_TOKEN") {
            if !token.trim().is_empty() {
                headers.insert(
                    "Authorization",
                    HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                        .map_err(|err| RetrievalError::CloudHttp(err.to_string()))?,
                );
            }
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|err| RetrievalError::CloudHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            codec: ArchiveCodec::default(),
        })
    }

    fn check_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, RetrievalError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "cloud index request failed".to_string());
        Err(RetrievalError::CloudStatus { status, message })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, RetrievalError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(RetrievalError::CloudHttp(err.to_string()));
                }
            }
        }
    }
}

impl CloudIndex for HttpCloudIndex {
    fn find_files(&self, query: &CloudQuery) -> Result<Vec<RemoteFile>, RetrievalError> {
        let url = format!("{}/datasets/{}/files", self.base_url, query.dataset);
        let response = self.send_with_retries(|| {
            let mut request = self.client.get(&url);
            if let Some(subfolder) = &query.subfolder {
                request = request.query(&[("subdir", subfolder.as_str())]);
            }
            if let Some(pattern) = &query.file_pattern {
                request = request.query(&[("pattern", pattern.as_str())]);
            }
            request.query(&[("recurse", if query.recurse { "true" } else { "false" })])
        })?;
        let files: Vec<RemoteFile> = Self::check_status(response)?
            .json()
            .map_err(|err| RetrievalError::CloudHttp(err.to_string()))?;
        filter_listing(&files, query)
    }

    fn download(
        &self,
        files: &[RemoteFile],
        target_dir: &Utf8Path,
    ) -> Result<Vec<DownloadOutcome>, RetrievalError> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let body = DownloadRequest {
            file_ids: files.iter().map(|file| file.file_id).collect(),
            dataset_paths: files.iter().map(|file| file.relative_path.as_str()).collect(),
        };
        let url = format!("{}/download", self.base_url);
        let mut response =
            Self::check_status(self.send_with_retries(|| self.client.post(&url).json(&body))?)?;

        let staging = tempfile::Builder::new()
            .prefix("cloud-download")
            .tempdir_in(target_dir.as_std_path())
            .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
        let bundle = staging.path().join("bundle.zip");
        let mut out =
            fs::File::create(&bundle).map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut out)
            .map_err(|err| RetrievalError::CloudHttp(err.to_string()))?;
        drop(out);

        let bundle = crate::fs_util::utf8_path(bundle)?;
        let extract_dir = crate::fs_util::utf8_path(staging.path().join("files"))?;
        let listing = self.codec.unzip(&bundle, &extract_dir, None)?;

        let mut outcomes = Vec::with_capacity(files.len());
        for file in files {
            let result = match listing.find_by_relative(&file.relative_path) {
                Some(entry) => {
                    let dest = target_dir.join(file.file_name());
                    fs::rename(entry.path.as_std_path(), dest.as_std_path())
                        .map(|_| dest)
                        .map_err(|err| err.to_string())
                }
                None => Err(format!("{} missing from download bundle", file.relative_path)),
            };
            outcomes.push(DownloadOutcome {
                file_id: file.file_id,
                result,
            });
        }
        Ok(outcomes)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
