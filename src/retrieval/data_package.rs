use std::fs;
use std::io::{self, BufRead, BufReader, Read};

use camino::Utf8Path;
use flate2::read::MultiGzDecoder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{PendingRename, Retriever};
use super::spectra::SpectraFormat;
use crate::archive::GZIP_EXTENSION;
use crate::cloud::CloudIndex;
use crate::domain::{MissSeverity, ResolvedFile};
use crate::error::RetrievalError;
use crate::params::{JOB_SECTION, ParamStore, STEP_SECTION, keys};

const OVERRIDDEN_KEYS: [&str; 9] = [
    keys::JOB,
    keys::DATASET_NAME,
    keys::DATASET_FOLDER_NAME,
    keys::DATASET_ID,
    keys::DATASET_STORAGE_PATH,
    keys::DATASET_ARCHIVE_PATH,
    keys::INPUT_FOLDER_NAME,
    keys::SHARED_RESULTS_FOLDERS,
    keys::INSTRUMENT_DATA_PURGED,
];

/// One analysis job of a data package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageJob {
    pub job: u32,
    pub dataset: String,
    #[serde(default)]
    pub dataset_folder: Option<String>,
    #[serde(default)]
    pub dataset_id: Option<String>,
    pub storage_path: String,
    #[serde(default)]
    pub archive_path: Option<String>,
    pub results_folder: String,
    #[serde(default)]
    pub instrument_data_purged: bool,
}

#[derive(Debug, Clone)]
pub struct PackageOptions {
    /// First suffix is required, the rest are optional.
    pub file_suffixes: Vec<String>,
    pub mzid_suffixes: Vec<String>,
    pub retrieve_spectra: bool,
}

impl Default for PackageOptions {
    fn default() -> Self {
        Self {
            file_suffixes: [
                "_syn.txt",
                "_syn_ResultToSeqMap.txt",
                "_syn_SeqToProteinMap.txt",
                "_syn_SeqInfo.txt",
                "_syn_ModSummary.txt",
            ]
            .map(str::to_string)
            .to_vec(),
            mzid_suffixes: ["_msgfplus.mzid.gz", "_msgfplus.mzid"]
                .map(str::to_string)
                .to_vec(),
            retrieve_spectra: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpectraKind {
    #[serde(rename = "mzml")]
    MzML,
    #[serde(rename = "mzxml")]
    MzXML,
    #[serde(rename = "concatenated_dta")]
    ConcatenatedDta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRetrieval {
    pub job: u32,
    pub dataset: String,
    pub files: Vec<String>,
    pub spectra: Option<SpectraKind>,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataPackageReport {
    pub jobs: Vec<JobRetrieval>,
}

impl DataPackageReport {
    pub fn is_success(&self) -> bool {
        self.jobs.iter().all(|job| job.success)
    }
}

type SavedParams = Vec<(&'static str, &'static str, String)>;

impl<'c, P: ParamStore, C: CloudIndex + ?Sized> Retriever<'c, P, C> {
    /// Retrieves result files for every job of a data package. Each job runs
    /// with its own dataset parameters; the caller's parameters are restored
    /// afterwards even when a job fails.
    pub fn retrieve_data_package(
        &mut self,
        jobs: &[PackageJob],
        options: &PackageOptions,
    ) -> Result<DataPackageReport, RetrievalError> {
        let mut report = DataPackageReport::default();
        for job in jobs {
            info!("retrieving data package job {} ({})", job.job, job.dataset);
            let saved = self.override_job_params(job);
            let result = self.retrieve_package_job(job, options);
            self.restore_params(saved);
            report.jobs.push(result?);
        }
        Ok(report)
    }

    fn retrieve_package_job(
        &mut self,
        job: &PackageJob,
        options: &PackageOptions,
    ) -> Result<JobRetrieval, RetrievalError> {
        let mut outcome = JobRetrieval {
            job: job.job,
            dataset: job.dataset.clone(),
            files: Vec::new(),
            spectra: None,
            success: true,
        };

        for (index, suffix) in options.file_suffixes.iter().enumerate() {
            let name = format!("{}{suffix}", job.dataset);
            let severity = if index == 0 {
                MissSeverity::Error
            } else {
                MissSeverity::Debug
            };
            match self.retrieve_job_file(job, &name, severity)? {
                Some(stored) => outcome.files.push(stored),
                None if index == 0 => outcome.success = false,
                None => {}
            }
        }

        if options.retrieve_spectra {
            let kind = self.job_spectra_kind(job, options, &mut outcome.files)?;
            let retrieved = match kind {
                SpectraKind::MzML => self.retrieve_cached_spectra(SpectraFormat::MzML)?,
                SpectraKind::MzXML => self.retrieve_cached_spectra(SpectraFormat::MzXML)?,
                SpectraKind::ConcatenatedDta => self.retrieve_concatenated_spectra()?,
            };
            outcome.spectra = Some(kind);
            outcome.success &= retrieved;
        }
        Ok(outcome)
    }

    /// Retrieves `name` for `job`, storing it as `Job<job>_<name>` when an
    /// earlier job already put a file with that name in the working directory.
    /// Returns the stored name relative to the working directory.
    fn retrieve_job_file(
        &mut self,
        job: &PackageJob,
        name: &str,
        severity: MissSeverity,
    ) -> Result<Option<String>, RetrievalError> {
        let Some(file) = self.find_data_file(name, false, severity)? else {
            return Ok(None);
        };
        if !self.copied.contains(&name.to_ascii_lowercase()) {
            return Ok(self.fetch(&file, name, severity)?.then(|| name.to_string()));
        }

        let renamed = format!("Job{}_{name}", job.job);
        match &file {
            ResolvedFile::Cloud { file: remote, .. } if !self.options.reference_only => {
                // Staged in its own folder so it cannot clash with the earlier
                // job's download, then renamed after the queue drains.
                let staging = self.work.path_for(&format!("Job{}", job.job));
                if !self.queue.enqueue(remote.clone(), &staging).is_queued() {
                    return Ok(None);
                }
                warn!("{name} already retrieved for another job; job {} copy will be stored as {renamed}", job.job);
                self.pending_rename.push(PendingRename {
                    downloaded: staging.join(remote.file_name()),
                    dest: self.work.path_for(&renamed),
                });
                self.register(&renamed);
                Ok(Some(renamed))
            }
            _ => {
                debug!("{name} already retrieved for another job; storing as {renamed}");
                Ok(self.fetch(&file, &renamed, severity)?.then_some(renamed))
            }
        }
    }

    fn job_spectra_kind(
        &mut self,
        job: &PackageJob,
        options: &PackageOptions,
        files: &mut Vec<String>,
    ) -> Result<SpectraKind, RetrievalError> {
        for suffix in &options.mzid_suffixes {
            let name = format!("{}{suffix}", job.dataset);
            let Some(stored) = self.retrieve_job_file(job, &name, MissSeverity::Debug)? else {
                continue;
            };
            files.push(stored.clone());
            if self.options.reference_only {
                break;
            }

            let local = self.work.path_for(&stored);
            if !local.as_std_path().is_file() && !self.queue.is_empty() {
                self.process_download_queue()?;
            }
            match read_spectra_location(&local) {
                Ok(Some(location)) => {
                    let kind = spectra_kind_for(&location);
                    debug!("{name} references {location}; using {kind:?}");
                    return Ok(kind);
                }
                Ok(None) => debug!("{name} has no SpectraData location"),
                Err(err) => warn!("cannot read {local}: {err}"),
            }
            break;
        }
        Ok(SpectraKind::ConcatenatedDta)
    }

    fn override_job_params(&mut self, job: &PackageJob) -> SavedParams {
        let job_number = job.job.to_string();
        let values = [
            job_number.as_str(),
            job.dataset.as_str(),
            job.dataset_folder.as_deref().unwrap_or_default(),
            job.dataset_id.as_deref().unwrap_or_default(),
            job.storage_path.as_str(),
            job.archive_path.as_deref().unwrap_or_default(),
            job.results_folder.as_str(),
            "",
            if job.instrument_data_purged { "true" } else { "false" },
        ];

        let mut saved = Vec::with_capacity(OVERRIDDEN_KEYS.len() * 2);
        let params = self.params_mut();
        for section in [JOB_SECTION, STEP_SECTION] {
            for (key, value) in OVERRIDDEN_KEYS.iter().zip(values) {
                saved.push((section, *key, params.get_param(section, key).unwrap_or_default()));
                params.set_param(section, key, value);
            }
        }
        saved
    }

    fn restore_params(&mut self, saved: SavedParams) {
        let params = self.params_mut();
        for (section, key, value) in saved {
            params.set_param(section, key, &value);
        }
    }
}

/// The `location` attribute of the first `<SpectraData>` element of an mzid
/// file, which may be gzipped.
pub fn read_spectra_location(mzid: &Utf8Path) -> Result<Option<String>, RetrievalError> {
    let pattern = Regex::new(r#"<SpectraData\b[^>]*?\blocation\s*=\s*"([^"]*)""#)
        .map_err(|err| RetrievalError::InvalidPattern(err.to_string()))?;
    let file = fs::File::open(mzid.as_std_path())
        .map_err(|err| RetrievalError::Filesystem(format!("open {mzid}: {err}")))?;
    let reader: Box<dyn Read> = if mzid.as_str().to_ascii_lowercase().ends_with(GZIP_EXTENSION) {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };

    for line in BufReader::new(reader).lines() {
        let line = line.map_err(|err: io::Error| RetrievalError::corrupt_archive(mzid, err))?;
        if let Some(captures) = pattern.captures(&line) {
            return Ok(captures.get(1).map(|location| location.as_str().to_string()));
        }
        if line.contains("</Inputs>") {
            break;
        }
    }
    Ok(None)
}

pub fn spectra_kind_for(location: &str) -> SpectraKind {
    let lower = location.to_ascii_lowercase();
    let lower = lower.strip_suffix(GZIP_EXTENSION).unwrap_or(&lower);
    if lower.ends_with(".mzml") {
        SpectraKind::MzML
    } else if lower.ends_with(".mzxml") {
        SpectraKind::MzXML
    } else {
        SpectraKind::ConcatenatedDta
    }
}
