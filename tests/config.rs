use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use artifact_retrieval::config::{ConfigLoader, RetrievalOptions};
use artifact_retrieval::error::RetrievalError;

#[test]
fn resolve_from_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("artifact-retrieval.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "work_dir": "/scratch/work",
            "retry": { "max_attempts": 4, "hold_off_secs": 2 },
            "crc_check_threshold_bytes": 1048576,
            "search_long_term_archive": false,
            "cloud_index": { "base_url": "https://index.example.org", "timeout_secs": 30 }
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.work_dir.as_str(), "/scratch/work");
    assert_eq!(resolved.retry.attempts(), 4);
    assert_eq!(resolved.crc_check_threshold_bytes, 1_048_576);
    assert_eq!(
        resolved.cloud_index.as_ref().map(|cloud| cloud.timeout),
        Some(Duration::from_secs(30))
    );

    let options = RetrievalOptions::from(&resolved);
    assert!(options.search_cloud_archive);
    assert!(!options.search_long_term_archive);
    assert!(options.unzip_on_retrieve);
    assert!(!options.reference_only);
}

#[test]
fn explicit_missing_file_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, RetrievalError::ConfigRead(_));
    assert!(err.is_configuration());
}

#[test]
fn empty_cloud_url_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("config.json");
    fs::write(&path, r#"{ "work_dir": "/w", "cloud_index": { "base_url": " / " } }"#).unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(RetrievalError::ConfigParse(_))
    );
}
