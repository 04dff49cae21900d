mod data_package;
mod folder;
mod masic;
mod spectra;

use std::collections::BTreeSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, error, info, warn};

pub use data_package::{DataPackageReport, JobRetrieval, PackageJob, PackageOptions, SpectraKind};
pub use spectra::SpectraFormat;

use crate::archive::{ArchiveCodec, ExtractListing, GZIP_EXTENSION, ZIP_EXTENSION};
use crate::cloud::{CloudIndex, DownloadQueue, DrainReport};
use crate::config::RetrievalOptions;
use crate::domain::{DatasetIdentity, MissSeverity, Resolution, ResolvedFile};
use crate::error::RetrievalError;
use crate::params::{ParamStore, ResultSkipList, SkipList};
use crate::probe::TierProbe;
use crate::resolver::Resolver;
use crate::store::WorkArea;

/// One retrieval session for a job: owns the job parameters, the working
/// directory, the download queue and the list of inputs to skip as results.
pub struct Retriever<'c, P: ParamStore, C: CloudIndex + ?Sized> {
    params: P,
    cloud: Option<&'c C>,
    options: RetrievalOptions,
    work: WorkArea,
    codec: ArchiveCodec,
    queue: DownloadQueue,
    skip: SkipList,
    copied: BTreeSet<String>,
    pending_extract: Vec<Utf8PathBuf>,
    pending_rename: Vec<PendingRename>,
    pending_register: BTreeSet<Utf8PathBuf>,
}

/// A download staged under another name, moved into place once it arrives.
#[derive(Debug, Clone)]
struct PendingRename {
    downloaded: Utf8PathBuf,
    dest: Utf8PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueReport {
    #[serde(flatten)]
    pub drain: DrainReport,
    pub extracted: Vec<Utf8PathBuf>,
}

impl<'c, P: ParamStore, C: CloudIndex + ?Sized> Retriever<'c, P, C> {
    pub fn new(
        params: P,
        cloud: Option<&'c C>,
        options: RetrievalOptions,
        work_dir: impl Into<Utf8PathBuf>,
    ) -> Self {
        let codec = ArchiveCodec::new(options.crc_check_threshold_bytes);
        Self {
            params,
            cloud,
            options,
            work: WorkArea::new(work_dir),
            codec,
            queue: DownloadQueue::new(),
            skip: SkipList::default(),
            copied: BTreeSet::new(),
            pending_extract: Vec::new(),
            pending_rename: Vec::new(),
            pending_register: BTreeSet::new(),
        }
    }

    pub fn params(&self) -> &P {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut P {
        &mut self.params
    }

    pub fn options(&self) -> &RetrievalOptions {
        &self.options
    }

    pub fn work_dir(&self) -> &Utf8Path {
        self.work.work_dir()
    }

    pub fn queue(&self) -> &DownloadQueue {
        &self.queue
    }

    pub fn skip_list(&self) -> &SkipList {
        &self.skip
    }

    pub fn codec(&self) -> &ArchiveCodec {
        &self.codec
    }

    pub fn into_params(self) -> P {
        self.params
    }

    pub fn dataset(&self) -> Result<DatasetIdentity, RetrievalError> {
        DatasetIdentity::from_params(&self.params)
    }

    pub fn find_artifact_location(
        &self,
        file_pattern: Option<&str>,
        folder_pattern: Option<&str>,
        want_instrument_data: bool,
    ) -> Result<Resolution, RetrievalError> {
        let probe = self.probe();
        Resolver::new(&self.params, &probe, &self.options).find_artifact_location(
            file_pattern,
            folder_pattern,
            want_instrument_data,
        )
    }

    pub fn find_data_file(
        &self,
        file_name: &str,
        want_instrument_data: bool,
        severity: MissSeverity,
    ) -> Result<Option<ResolvedFile>, RetrievalError> {
        let probe = self.probe();
        Resolver::new(&self.params, &probe, &self.options).find_data_file(
            file_name,
            want_instrument_data,
            None,
            self.work.work_dir(),
            severity,
        )
    }

    /// Retrieves one file from whichever tier holds it.
    pub fn retrieve_file(&mut self, file_name: &str, severity: MissSeverity) -> Result<bool, RetrievalError> {
        if self.copied.contains(&file_name.to_ascii_lowercase()) {
            debug!("{file_name} already retrieved");
            return Ok(true);
        }
        match self.find_data_file(file_name, false, severity)? {
            Some(file) => self.fetch(&file, file_name, severity),
            None => Ok(false),
        }
    }

    /// Retrieves `<dataset><extension>`, skipping primary storage when the
    /// instrument data has been purged.
    pub fn retrieve_instrument_file(&mut self, extension: &str) -> Result<bool, RetrievalError> {
        let dataset = self.dataset()?;
        let extension = extension.trim();
        let file_name = if extension.starts_with('.') {
            format!("{}{extension}", dataset.name())
        } else {
            format!("{}.{extension}", dataset.name())
        };
        match self.find_data_file(&file_name, true, MissSeverity::Error)? {
            Some(file) => self.fetch(&file, &file_name, MissSeverity::Error),
            None => Ok(false),
        }
    }

    /// Downloads everything queued from the cloud index, moves staged
    /// downloads to their final names, then unpacks archives that were
    /// waiting on those downloads.
    pub fn process_download_queue(&mut self) -> Result<QueueReport, RetrievalError> {
        if self.queue.is_empty() {
            return Ok(QueueReport::default());
        }
        let cloud = self.cloud.ok_or(RetrievalError::CloudNotConfigured)?;
        let mut drain = self.queue.process(cloud);

        for path in drain.downloaded.iter_mut() {
            if let Some(index) = self
                .pending_rename
                .iter()
                .position(|pending| pending.downloaded == *path)
            {
                let pending = self.pending_rename.remove(index);
                if self.apply_rename(&pending) {
                    *path = pending.dest;
                }
            }
        }
        let confirmed: Vec<Utf8PathBuf> = drain
            .downloaded
            .iter()
            .filter(|path| self.pending_register.remove(*path))
            .cloned()
            .collect();
        for path in confirmed {
            if let Some(file_name) = path.file_name() {
                let file_name = file_name.to_string();
                self.register(&file_name);
            }
        }

        let mut extracted = Vec::new();
        let pending = std::mem::take(&mut self.pending_extract);
        for archive in pending {
            if !archive.as_std_path().is_file() {
                self.pending_extract.push(archive);
                continue;
            }
            if let Some(listing) = self.extract_local(&archive) {
                extracted.extend(listing.paths().map(Utf8Path::to_path_buf));
            }
        }
        Ok(QueueReport { drain, extracted })
    }

    fn apply_rename(&self, pending: &PendingRename) -> bool {
        match fs::rename(pending.downloaded.as_std_path(), pending.dest.as_std_path()) {
            Ok(()) => {
                debug!("renamed {} to {}", pending.downloaded, pending.dest);
                if let Some(staging) = pending.downloaded.parent() {
                    // Fails while the staging folder still holds other downloads.
                    let _ = fs::remove_dir(staging.as_std_path());
                }
                true
            }
            Err(err) => {
                error!("cannot rename {} to {}: {err}", pending.downloaded, pending.dest);
                false
            }
        }
    }

    fn probe(&self) -> TierProbe<'c, C> {
        TierProbe::new(self.cloud, self.options.retry)
    }

    /// Materializes `file` as `dest_name` and records it as a retrieved input.
    fn fetch(&mut self, file: &ResolvedFile, dest_name: &str, severity: MissSeverity) -> Result<bool, RetrievalError> {
        let stored = self
            .work
            .materialize_as(file, dest_name, &self.options, &mut self.queue, severity)?;
        if stored {
            self.register(dest_name);
        }
        Ok(stored)
    }

    fn register(&mut self, file_name: &str) {
        self.copied.insert(file_name.to_ascii_lowercase());
        self.skip.add_result_file_to_skip(file_name);
        if self.options.reference_only {
            self.skip
                .add_result_file_to_skip(&format!("{file_name}{}", crate::domain::STORAGE_PATH_INFO_SUFFIX));
        }
    }

    /// Unpacks a retrieved `.zip`/`.gz` in the working directory now, or after
    /// the download queue is drained when it is still remote.
    fn extract_retrieved(&mut self, file: &ResolvedFile, local_name: &str) -> Result<bool, RetrievalError> {
        if self.options.reference_only || !self.options.unzip_on_retrieve {
            return Ok(true);
        }
        let local = self.work.path_for(local_name);
        if matches!(file, ResolvedFile::Cloud { .. }) && !local.as_std_path().is_file() {
            debug!("{local_name} queued; extracting after download");
            self.pending_extract.push(local);
            return Ok(true);
        }
        Ok(self.extract_local(&local).is_some())
    }

    fn extract_local(&mut self, archive: &Utf8Path) -> Option<ExtractListing> {
        let name = archive.file_name().unwrap_or_default().to_ascii_lowercase();
        let target = self.work.work_dir().to_path_buf();
        let result = if name.ends_with(ZIP_EXTENSION) {
            self.codec.unzip(archive, &target, None)
        } else if name.ends_with(GZIP_EXTENSION) {
            self.codec.gunzip(archive, &target)
        } else {
            warn!("{archive} is not a recognized archive; left as is");
            return Some(ExtractListing::default());
        };
        match result {
            Ok(listing) => {
                for entry in &listing.entries {
                    if let Some(file_name) = entry.path.file_name() {
                        let file_name = file_name.to_string();
                        self.register(&file_name);
                    }
                }
                info!("extracted {} file(s) from {archive}", listing.len());
                Some(listing)
            }
            Err(err) => {
                error!("cannot extract {archive}: {err}");
                None
            }
        }
    }
}
