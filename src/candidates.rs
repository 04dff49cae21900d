use camino::Utf8PathBuf;
use tracing::debug;

use crate::domain::{Candidate, CandidateLocation, DatasetIdentity, Tier};
use crate::error::RetrievalError;
use crate::params::{JOB_SECTION, ParamStore, keys};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateRequest {
    pub want_instrument_data: bool,
    pub search_cloud: bool,
    pub long_term_reachable: bool,
}

impl Default for CandidateRequest {
    fn default() -> Self {
        Self {
            want_instrument_data: false,
            search_cloud: true,
            long_term_reachable: true,
        }
    }
}

impl CandidateRequest {
    /// Whether the long-term archive tier takes part in this search.
    pub fn includes_long_term(&self) -> bool {
        self.long_term_reachable || !self.search_cloud
    }

    /// True when some archive tier is left out, so a failed search is not exhaustive.
    pub fn skips_archive_tier(&self) -> bool {
        !self.search_cloud || !self.includes_long_term()
    }
}

/// Subfolder suffixes tried under every dataset folder: the job's input
/// folder, then each shared results folder, then the bare dataset folder.
pub fn folder_suffixes<P: ParamStore + ?Sized>(params: &P) -> Vec<Option<String>> {
    let mut suffixes = Vec::new();
    if let Some(input) = non_empty(params.get_any(keys::INPUT_FOLDER_NAME)) {
        suffixes.push(Some(input));
    }

    // Shared folders are tried last-listed first. Job definitions depend on
    // this ordering, so keep the reversal.
    let shared = params.get_any(keys::SHARED_RESULTS_FOLDERS).unwrap_or_default();
    for folder in shared.split(',').rev() {
        let folder = folder.trim();
        if folder.is_empty() {
            continue;
        }
        let folder = Some(folder.to_string());
        if !suffixes.contains(&folder) {
            suffixes.push(folder);
        }
    }

    suffixes.push(None);
    suffixes
}

pub fn build_candidates<P: ParamStore + ?Sized>(
    dataset: &DatasetIdentity,
    params: &P,
    request: &CandidateRequest,
) -> Result<Vec<Candidate>, RetrievalError> {
    let suffixes = folder_suffixes(params);
    let mut candidates = Vec::new();

    if let Some(transfer) = non_empty(params.get_any(keys::TRANSFER_FOLDER_PATH)) {
        push_filesystem(
            &mut candidates,
            Tier::TransferStaging,
            &transfer,
            dataset,
            &suffixes,
            false,
        );
    }

    let purged = params.get_bool(JOB_SECTION, keys::INSTRUMENT_DATA_PURGED, false);
    if purged && request.want_instrument_data {
        debug!(dataset = %dataset, "instrument data purged; skipping primary storage");
    } else if let Some(storage) = non_empty(params.get_any(keys::DATASET_STORAGE_PATH)) {
        push_filesystem(
            &mut candidates,
            Tier::PrimaryStorage,
            &storage,
            dataset,
            &suffixes,
            true,
        );
    }

    if request.search_cloud {
        for suffix in &suffixes {
            candidates.push(Candidate {
                tier: Tier::CloudArchive,
                location: CandidateLocation::CloudIndex {
                    dataset: dataset.name().to_string(),
                    subfolder: suffix.clone(),
                },
                log_if_missing: true,
            });
        }
    }

    if request.includes_long_term() {
        if let Some(archive) = non_empty(params.get_any(keys::DATASET_ARCHIVE_PATH)) {
            push_filesystem(
                &mut candidates,
                Tier::LongTermArchive,
                &archive,
                dataset,
                &suffixes,
                true,
            );
        }
    }

    Ok(candidates)
}

/// `<storage>/<datasetFolder>`, the path reported when nothing is found.
pub fn default_storage_path<P: ParamStore + ?Sized>(
    dataset: &DatasetIdentity,
    params: &P,
) -> Utf8PathBuf {
    match non_empty(params.get_any(keys::DATASET_STORAGE_PATH)) {
        Some(storage) => Utf8PathBuf::from(storage).join(dataset.folder_name()),
        None => Utf8PathBuf::from(dataset.folder_name()),
    }
}

fn push_filesystem(
    candidates: &mut Vec<Candidate>,
    tier: Tier,
    base: &str,
    dataset: &DatasetIdentity,
    suffixes: &[Option<String>],
    log_if_missing: bool,
) {
    let base = Utf8PathBuf::from(base.trim_end_matches(['/', '\\']));
    for suffix in suffixes {
        for folder in dataset.folder_spellings() {
            let mut path = base.join(folder);
            if let Some(suffix) = suffix {
                path.push(suffix);
            }
            candidates.push(Candidate {
                tier,
                location: CandidateLocation::Filesystem(path),
                log_if_missing,
            });
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
