use std::cell::RefCell;
use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use artifact_retrieval::cloud::{CloudIndex, CloudQuery, DownloadOutcome, RemoteFile, filter_listing};
use artifact_retrieval::config::{RetrievalOptions, RetryPolicy};
use artifact_retrieval::domain::{MissSeverity, Resolution, ResolvedFile, Tier};
use artifact_retrieval::error::RetrievalError;
use artifact_retrieval::params::{JOB_SECTION, JobParams, keys};
use artifact_retrieval::retrieval::Retriever;

struct FakeIndex {
    files: Vec<RemoteFile>,
    downloads: RefCell<Vec<u64>>,
}

impl FakeIndex {
    fn new(files: Vec<RemoteFile>) -> Self {
        Self {
            files,
            downloads: RefCell::new(Vec::new()),
        }
    }
}

impl CloudIndex for FakeIndex {
    fn find_files(&self, query: &CloudQuery) -> Result<Vec<RemoteFile>, RetrievalError> {
        filter_listing(&self.files, query)
    }

    fn download(
        &self,
        files: &[RemoteFile],
        target_dir: &Utf8Path,
    ) -> Result<Vec<DownloadOutcome>, RetrievalError> {
        let mut outcomes = Vec::new();
        for file in files {
            self.downloads.borrow_mut().push(file.file_id);
            let dest = target_dir.join(file.file_name());
            fs::write(dest.as_std_path(), file.relative_path.as_bytes()).unwrap();
            outcomes.push(DownloadOutcome {
                file_id: file.file_id,
                result: Ok(dest),
            });
        }
        Ok(outcomes)
    }
}

fn remote(id: u64, relative: &str) -> RemoteFile {
    RemoteFile {
        file_id: id,
        dataset: "QC_Shew_01".to_string(),
        relative_path: relative.to_string(),
        transaction_id: 1,
        size_bytes: 3,
        modified_utc: None,
    }
}

fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

fn params(root: &Utf8Path) -> JobParams {
    JobParams::new()
        .with(JOB_SECTION, keys::DATASET_NAME, "QC_Shew_01")
        .with(JOB_SECTION, keys::DATASET_STORAGE_PATH, root.join("storage").as_str())
        .with(JOB_SECTION, keys::DATASET_ARCHIVE_PATH, root.join("archive").as_str())
}

fn options() -> RetrievalOptions {
    RetrievalOptions {
        retry: RetryPolicy::new(1, Duration::ZERO),
        ..RetrievalOptions::default()
    }
}

#[test]
fn instrument_file_only_in_cloud_is_queued_then_downloaded() {
    let (_temp, root) = scratch();
    let index = FakeIndex::new(vec![remote(77, "QC_Shew_01.raw")]);
    let mut retriever = Retriever::new(params(&root), Some(&index), options(), root.join("work"));

    let file = retriever
        .find_data_file("QC_Shew_01.raw", true, MissSeverity::Error)
        .unwrap()
        .unwrap();
    assert_eq!(file.tier(), Tier::CloudArchive);
    assert_eq!(file.path_string(), "cloud-index://QC_Shew_01/QC_Shew_01.raw@fileid=77");

    assert!(retriever.retrieve_instrument_file(".raw").unwrap());
    assert_eq!(retriever.queue().len(), 1);
    assert!(!root.join("work/QC_Shew_01.raw").as_std_path().exists());

    let report = retriever.process_download_queue().unwrap();
    assert!(report.drain.is_success());
    assert_eq!(report.drain.downloaded, vec![root.join("work/QC_Shew_01.raw")]);
    assert!(retriever.queue().is_empty());
    assert_eq!(*index.downloads.borrow(), vec![77]);
}

#[test]
fn concatenated_spectra_found_only_in_cloud_are_queued_once() {
    let (_temp, root) = scratch();
    let index = FakeIndex::new(vec![remote(12, "QC_Shew_01_dta.zip")]);
    let mut retriever = Retriever::new(params(&root), Some(&index), options(), root.join("work"));

    let file = retriever
        .find_data_file("QC_Shew_01_dta.zip", false, MissSeverity::Debug)
        .unwrap()
        .unwrap();
    assert_eq!(file.path_string(), "cloud-index://QC_Shew_01/QC_Shew_01_dta.zip@fileid=12");

    assert!(retriever.retrieve_concatenated_spectra().unwrap());
    assert_eq!(retriever.queue().len(), 1);
    assert_eq!(retriever.queue().entries()[0].file.file_id, 12);
    assert!(index.downloads.borrow().is_empty());
}

#[test]
fn storage_beats_cloud_when_both_hold_the_file() {
    let (_temp, root) = scratch();
    let dataset_dir = root.join("storage/QC_Shew_01");
    fs::create_dir_all(dataset_dir.as_std_path()).unwrap();
    fs::write(dataset_dir.join("QC_Shew_01.raw"), b"raw").unwrap();
    let index = FakeIndex::new(vec![remote(77, "QC_Shew_01.raw")]);
    let retriever = Retriever::new(params(&root), Some(&index), options(), root.join("work"));

    let file = retriever
        .find_data_file("QC_Shew_01.raw", false, MissSeverity::Error)
        .unwrap()
        .unwrap();
    assert_matches!(file, ResolvedFile::Local { tier: Tier::PrimaryStorage, .. });
}

#[test]
fn purged_dataset_falls_through_to_long_term_archive() {
    let (_temp, root) = scratch();
    for tier in ["storage", "archive"] {
        let dir = root.join(tier).join("QC_Shew_01");
        fs::create_dir_all(dir.as_std_path()).unwrap();
        fs::write(dir.join("QC_Shew_01.raw"), tier).unwrap();
    }
    let params = params(&root).with(JOB_SECTION, keys::INSTRUMENT_DATA_PURGED, "true");
    let options = RetrievalOptions {
        search_cloud_archive: false,
        ..options()
    };
    let mut retriever: Retriever<'_, _, FakeIndex> =
        Retriever::new(params, None, options, root.join("work"));

    assert!(retriever.retrieve_instrument_file("raw").unwrap());
    let copied = fs::read_to_string(root.join("work/QC_Shew_01.raw")).unwrap();
    assert_eq!(copied, "archive");
}

#[test]
fn missing_everywhere_reports_default_storage_path() {
    let (_temp, root) = scratch();
    let index = FakeIndex::new(Vec::new());
    let retriever = Retriever::new(params(&root), Some(&index), options(), root.join("work"));

    let resolution = retriever
        .find_artifact_location(Some("QC_Shew_01_syn.txt"), None, false)
        .unwrap();
    assert!(!resolution.is_found());
    assert_matches!(resolution, Resolution::NotFound { ref default_path, .. } => {
        assert_eq!(default_path, &root.join("storage/QC_Shew_01"));
    });
}

#[test]
fn reference_only_writes_storage_path_info() {
    let (_temp, root) = scratch();
    let dataset_dir = root.join("storage/QC_Shew_01");
    fs::create_dir_all(dataset_dir.as_std_path()).unwrap();
    fs::write(dataset_dir.join("QC_Shew_01.raw"), b"raw").unwrap();
    let options = RetrievalOptions {
        reference_only: true,
        search_cloud_archive: false,
        ..options()
    };
    let mut retriever: Retriever<'_, _, FakeIndex> =
        Retriever::new(params(&root), None, options, root.join("work"));

    assert!(retriever.retrieve_file("QC_Shew_01.raw", MissSeverity::Error).unwrap());
    assert!(!root.join("work/QC_Shew_01.raw").as_std_path().exists());
    let info = fs::read_to_string(root.join("work/QC_Shew_01.raw_StoragePathInfo.txt")).unwrap();
    assert!(info.contains("QC_Shew_01.raw"));
    assert!(retriever.skip_list().should_skip("QC_Shew_01.raw_StoragePathInfo.txt"));
}
