use std::fs;

use camino::Utf8PathBuf;

use artifact_retrieval::fs_util;
use artifact_retrieval::sidecar::{self, SidecarCheck, SidecarRecord};

fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

#[test]
fn same_size_same_time_edit_is_caught_only_by_hash() {
    let (_temp, root) = scratch();
    let data = root.join("Dataset.mzML.gz");
    fs::write(data.as_std_path(), b"original-bytes").unwrap();
    let written = sidecar::write_sidecar(&data, true).unwrap();
    assert_eq!(written, sidecar::sidecar_path(&data));

    let record = SidecarRecord::read(&written).unwrap();
    assert_eq!(record.size, 14);
    assert_eq!(record.hash.as_deref().map(str::len), Some(64));

    let stamp = fs_util::modified_utc(&data).unwrap();
    fs::write(data.as_std_path(), b"tampered-bytes").unwrap();
    fs_util::set_modified_utc(&data, stamp).unwrap();

    assert!(sidecar::validate(&data, None, SidecarCheck::default()).is_valid());
    let with_hash = sidecar::validate(&data, None, SidecarCheck::with_hash());
    assert!(!with_hash.is_valid());
    assert!(with_hash.message().unwrap().contains("hash mismatch"));
}

#[test]
fn missing_sidecar_is_invalid() {
    let (_temp, root) = scratch();
    let data = root.join("Dataset.mzML");
    fs::write(data.as_std_path(), b"x").unwrap();
    assert!(!sidecar::validate(&data, None, SidecarCheck::default()).is_valid());
}
