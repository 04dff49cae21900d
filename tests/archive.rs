use std::fs;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};

use artifact_retrieval::archive::ArchiveCodec;
use artifact_retrieval::fs_util::{self, WildcardPattern};

fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

#[test]
fn zipped_directory_extracts_with_layout_and_times() {
    let (_temp, root) = scratch();
    let source = root.join("SIC201801");
    fs::create_dir_all(source.join("plots").as_std_path()).unwrap();
    fs::write(source.join("Dataset_ScanStats.txt"), "scan\tstats\n".repeat(50)).unwrap();
    fs::write(source.join("plots/Dataset_TIC.png"), [0_u8, 1, 2, 3]).unwrap();
    let stamp = DateTime::<Utc>::from_timestamp(1_650_000_000, 0).unwrap();
    fs_util::set_modified_utc(&source.join("Dataset_ScanStats.txt"), stamp).unwrap();

    let codec = ArchiveCodec::default();
    let zip_path = root.join("SIC201801.zip");
    assert_eq!(codec.zip_directory(&source, &zip_path).unwrap(), 2);

    let verification = codec.verify_zip(&zip_path).unwrap();
    // two files plus the `plots/` directory entry
    assert_eq!(verification.entries, 3);
    assert!(verification.full_check);

    let target = root.join("extracted");
    let listing = codec.unzip(&zip_path, &target, None).unwrap();
    assert_eq!(listing.len(), 2);
    assert_eq!(
        fs::read(target.join("plots/Dataset_TIC.png")).unwrap(),
        vec![0_u8, 1, 2, 3]
    );
    let restored = fs_util::modified_utc(&target.join("Dataset_ScanStats.txt")).unwrap();
    assert!((restored - stamp).num_seconds().abs() <= 2);
}

#[test]
fn unzip_filter_limits_extracted_entries() {
    let (_temp, root) = scratch();
    let source = root.join("results");
    fs::create_dir_all(source.as_std_path()).unwrap();
    fs::write(source.join("Dataset_syn.txt"), "syn").unwrap();
    fs::write(source.join("Dataset_fht.txt"), "fht").unwrap();

    let codec = ArchiveCodec::default();
    let zip_path = root.join("results.zip");
    codec.zip_directory(&source, &zip_path).unwrap();

    let filter = WildcardPattern::new("*_syn.txt").unwrap();
    let listing = codec.unzip(&zip_path, &root.join("out"), Some(&filter)).unwrap();
    assert_eq!(listing.len(), 1);
    assert!(listing.find_file_name("dataset_SYN.txt").is_some());
    assert!(!root.join("out/Dataset_fht.txt").as_std_path().exists());
}

#[test]
fn gzip_keeps_name_and_round_trips() {
    let (_temp, root) = scratch();
    let source = root.join("Dataset.mzML");
    fs::write(source.as_std_path(), "<mzML/>\n".repeat(100)).unwrap();

    let codec = ArchiveCodec::default();
    let gz = codec.gzip_file(&source, None).unwrap();
    assert_eq!(gz, root.join("Dataset.mzML.gz"));
    assert_eq!(codec.verify_gzip(&gz).unwrap(), 800);

    let listing = codec.gunzip(&gz, &root.join("out")).unwrap();
    let extracted = root.join("out/Dataset.mzML");
    assert_eq!(listing.paths().collect::<Vec<_>>(), vec![extracted.as_path()]);
    assert_eq!(fs::read(extracted).unwrap(), fs::read(source).unwrap());
}
