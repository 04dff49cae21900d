use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::Retriever;
use crate::archive::GZIP_EXTENSION;
use crate::cloud::CloudIndex;
use crate::domain::{MissSeverity, ResolvedFile, Tier};
use crate::error::RetrievalError;
use crate::fs_util;
use crate::params::{ParamStore, keys};
use crate::sidecar::{self, SidecarCheck, SidecarRecord};

pub const DTA_ZIP_SUFFIX: &str = "_dta.zip";
pub const DTA_TXT_SUFFIX: &str = "_dta.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SpectraFormat {
    #[value(name = "mzml")]
    MzML,
    #[value(name = "mzxml")]
    MzXML,
}

impl SpectraFormat {
    pub fn extension(self) -> &'static str {
        match self {
            SpectraFormat::MzML => ".mzML",
            SpectraFormat::MzXML => ".mzXML",
        }
    }
}

impl fmt::Display for SpectraFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension().trim_start_matches('.'))
    }
}

impl<'c, P: ParamStore, C: CloudIndex + ?Sized> Retriever<'c, P, C> {
    /// Retrieves `<dataset>_dta.zip` (unzipped when enabled), falling back to
    /// `<dataset>_dta.txt`.
    pub fn retrieve_concatenated_spectra(&mut self) -> Result<bool, RetrievalError> {
        let dataset = self.dataset()?;
        let zip_name = format!("{}{DTA_ZIP_SUFFIX}", dataset.name());
        let txt_name = format!("{}{DTA_TXT_SUFFIX}", dataset.name());

        if let Some(file) = self.find_data_file(&zip_name, false, MissSeverity::Debug)? {
            if self.fetch(&file, &zip_name, MissSeverity::Error)? {
                return self.extract_retrieved(&file, &zip_name);
            }
        }

        warn!("{zip_name} not found; falling back to {txt_name}");
        match self.find_data_file(&txt_name, false, MissSeverity::Error)? {
            Some(file) => self.fetch(&file, &txt_name, MissSeverity::Error),
            None => Ok(false),
        }
    }

    /// Retrieves the dataset's mzML/mzXML file, preferring the shared
    /// converted-spectra cache over per-dataset storage.
    pub fn retrieve_cached_spectra(&mut self, format: SpectraFormat) -> Result<bool, RetrievalError> {
        let dataset = self.dataset()?;
        let plain = format!("{}{}", dataset.name(), format.extension());
        let gzipped = format!("{plain}{GZIP_EXTENSION}");

        if let Some(cache_dir) = self.spectra_cache_dir() {
            for name in [&gzipped, &plain] {
                match self.retrieve_from_cache(&cache_dir, name)? {
                    CacheHit::Retrieved => return Ok(true),
                    CacheHit::Missing | CacheHit::Rejected => {}
                }
            }
            debug!("no valid {format} in cache {cache_dir}");
        }

        if let Some(file) = self.find_data_file(&gzipped, false, MissSeverity::Debug)? {
            if self.fetch(&file, &gzipped, MissSeverity::Error)? {
                return self.extract_retrieved(&file, &gzipped);
            }
        }
        self.retrieve_file(&plain, MissSeverity::Error)
    }

    /// `<cacheRoot>/<tool>_<version>_<datasetID>`, when all parts are known.
    pub fn spectra_cache_dir(&self) -> Option<Utf8PathBuf> {
        let value = |key: &str| {
            self.params()
                .get_any(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let root = value(keys::MSXML_CACHE_FOLDER_PATH)?;
        let tool = value(keys::MSXML_GENERATOR_TOOL)?;
        let version = value(keys::MSXML_GENERATOR_VERSION)?;
        let dataset_id = value(keys::DATASET_ID)?;
        Some(Utf8PathBuf::from(root).join(format!("{tool}_{version}_{dataset_id}")))
    }

    fn retrieve_from_cache(&mut self, cache_dir: &Utf8Path, name: &str) -> Result<CacheHit, RetrievalError> {
        let remote = cache_dir.join(name);
        match fs_util::exists_with_retry(&remote, &self.options().retry) {
            Ok(true) => {}
            Ok(false) => return Ok(CacheHit::Missing),
            Err(err) => {
                warn!("cannot check cache file {remote}: {err}");
                return Ok(CacheHit::Missing);
            }
        }

        let sidecar_file = sidecar::sidecar_path(&remote);
        let validation = sidecar::validate(&remote, Some(sidecar_file.as_path()), SidecarCheck::default());
        if !validation.is_valid() {
            warn!(
                "cached {remote} failed validation ({}); not using it",
                validation.message().unwrap_or("unknown reason")
            );
            return Ok(CacheHit::Rejected);
        }

        let file = ResolvedFile::Local {
            tier: Tier::PrimaryStorage,
            path: remote.clone(),
        };
        if !self.fetch(&file, name, MissSeverity::Error)? {
            return Ok(CacheHit::Missing);
        }

        if self.options().verify_hash_after_copy && !self.options().reference_only {
            let local = self.work.path_for(name);
            if !local_copy_matches(&local, &sidecar_file)? {
                warn!("hash of {local} does not match cache record; evicting both copies");
                evict_or_warn(&local, &remote);
                self.copied.remove(&name.to_ascii_lowercase());
                return Ok(CacheHit::Rejected);
            }
        }

        info!("using cached {remote}");
        if name.to_ascii_lowercase().ends_with(GZIP_EXTENSION) {
            if self.extract_retrieved(&file, name)? {
                Ok(CacheHit::Retrieved)
            } else {
                Ok(CacheHit::Rejected)
            }
        } else {
            Ok(CacheHit::Retrieved)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheHit {
    Retrieved,
    Missing,
    Rejected,
}

/// A failed eviction leaves the cache entry in place; the caller still falls
/// back to dataset storage.
fn evict_or_warn(local: &Utf8Path, remote: &Utf8Path) {
    if let Err(err) = sidecar::evict_stale(Some(local), Some(remote)) {
        warn!("cannot evict stale copies of {remote}: {err}");
    }
}

/// True when the local copy hashes to the value recorded in the cache
/// sidecar, or when the sidecar carries no hash at all.
fn local_copy_matches(local: &Utf8Path, sidecar_file: &Utf8Path) -> Result<bool, RetrievalError> {
    let record = SidecarRecord::read(sidecar_file)?;
    match record.hash {
        Some(expected) => Ok(sidecar::sha256_file(local)?.eq_ignore_ascii_case(&expected)),
        None => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use super::*;
    use crate::archive::ArchiveCodec;
    use crate::cloud::{CloudQuery, DownloadOutcome, RemoteFile};
    use crate::config::{RetrievalOptions, RetryPolicy};
    use crate::params::{JOB_SECTION, JobParams, STEP_SECTION};

    struct NoCloud;

    impl CloudIndex for NoCloud {
        fn find_files(&self, _query: &CloudQuery) -> Result<Vec<RemoteFile>, RetrievalError> {
            Ok(Vec::new())
        }

        fn download(
            &self,
            _files: &[RemoteFile],
            _target_dir: &Utf8Path,
        ) -> Result<Vec<DownloadOutcome>, RetrievalError> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        root: Utf8PathBuf,
        params: JobParams,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("storage/Dataset").as_std_path()).unwrap();
        let params = JobParams::new()
            .with(JOB_SECTION, keys::DATASET_NAME, "Dataset")
            .with(JOB_SECTION, keys::DATASET_ID, "1234")
            .with(JOB_SECTION, keys::DATASET_STORAGE_PATH, root.join("storage").as_str())
            .with(STEP_SECTION, keys::MSXML_CACHE_FOLDER_PATH, root.join("cache").as_str())
            .with(STEP_SECTION, keys::MSXML_GENERATOR_TOOL, "MSConvert")
            .with(STEP_SECTION, keys::MSXML_GENERATOR_VERSION, "3.0");
        Fixture {
            _temp: temp,
            root,
            params,
        }
    }

    fn options() -> RetrievalOptions {
        RetrievalOptions {
            search_cloud_archive: false,
            retry: RetryPolicy::new(1, Duration::ZERO),
            ..RetrievalOptions::default()
        }
    }

    fn seed_cache(root: &Utf8Path, content: &[u8]) -> Utf8PathBuf {
        let cache_dir = root.join("cache/MSConvert_3.0_1234");
        fs::create_dir_all(cache_dir.as_std_path()).unwrap();
        let plain = cache_dir.join("Dataset.mzML");
        fs::write(plain.as_std_path(), content).unwrap();
        let gz = ArchiveCodec::default().gzip_file(&plain, None).unwrap();
        fs::remove_file(plain.as_std_path()).unwrap();
        sidecar::write_sidecar(&gz, true).unwrap();
        gz
    }

    #[test]
    fn cache_hit_is_validated_and_gunzipped() {
        let fx = fixture();
        seed_cache(&fx.root, b"<mzML/>");
        let options = RetrievalOptions {
            verify_hash_after_copy: true,
            ..options()
        };
        let mut retriever: Retriever<'_, _, NoCloud> =
            Retriever::new(fx.params, None, options, fx.root.join("work"));

        assert!(retriever.retrieve_cached_spectra(SpectraFormat::MzML).unwrap());
        assert_eq!(fs::read(fx.root.join("work/Dataset.mzML")).unwrap(), b"<mzML/>");
        assert!(retriever.skip_list().should_skip("Dataset.mzML"));
        assert!(retriever.skip_list().should_skip("Dataset.mzML.gz"));
    }

    #[test]
    fn size_mismatch_keeps_cache_entry_and_uses_storage() {
        let fx = fixture();
        let gz = seed_cache(&fx.root, b"<mzML/>");
        fs::write(gz.as_std_path(), b"truncated").unwrap();
        fs::write(fx.root.join("storage/Dataset/Dataset.mzML"), b"<mzML>storage</mzML>").unwrap();

        let mut retriever: Retriever<'_, _, NoCloud> =
            Retriever::new(fx.params, None, options(), fx.root.join("work"));
        assert!(retriever.retrieve_cached_spectra(SpectraFormat::MzML).unwrap());
        assert!(gz.as_std_path().exists());
        assert!(sidecar::sidecar_path(&gz).as_std_path().exists());
        assert_eq!(
            fs::read(fx.root.join("work/Dataset.mzML")).unwrap(),
            b"<mzML>storage</mzML>"
        );
    }

    #[test]
    fn cache_entry_without_sidecar_is_left_alone() {
        let fx = fixture();
        let gz = seed_cache(&fx.root, b"<mzML/>");
        fs::remove_file(sidecar::sidecar_path(&gz).as_std_path()).unwrap();
        fs::write(fx.root.join("storage/Dataset/Dataset.mzML"), b"<mzML>storage</mzML>").unwrap();

        let mut retriever: Retriever<'_, _, NoCloud> =
            Retriever::new(fx.params, None, options(), fx.root.join("work"));
        assert!(retriever.retrieve_cached_spectra(SpectraFormat::MzML).unwrap());
        assert!(gz.as_std_path().is_file());
        assert!(!fx.root.join("work/Dataset.mzML.gz").as_std_path().exists());
        assert_eq!(
            fs::read(fx.root.join("work/Dataset.mzML")).unwrap(),
            b"<mzML>storage</mzML>"
        );
    }

    #[test]
    fn hash_mismatch_after_copy_evicts_both_copies() {
        let fx = fixture();
        let gz = seed_cache(&fx.root, b"<mzML/>");
        let mut record = SidecarRecord::for_file(&gz, false).unwrap();
        record.hash = Some("0".repeat(64));
        record.write(&sidecar::sidecar_path(&gz)).unwrap();
        fs::write(fx.root.join("storage/Dataset/Dataset.mzML"), b"<mzML>storage</mzML>").unwrap();

        let options = RetrievalOptions {
            verify_hash_after_copy: true,
            ..options()
        };
        let mut retriever: Retriever<'_, _, NoCloud> =
            Retriever::new(fx.params, None, options, fx.root.join("work"));
        assert!(retriever.retrieve_cached_spectra(SpectraFormat::MzML).unwrap());
        assert!(!gz.as_std_path().exists());
        assert!(!sidecar::sidecar_path(&gz).as_std_path().exists());
        assert!(!fx.root.join("work/Dataset.mzML.gz").as_std_path().exists());
        assert_eq!(
            fs::read(fx.root.join("work/Dataset.mzML")).unwrap(),
            b"<mzML>storage</mzML>"
        );
    }

    #[test]
    fn failed_eviction_is_logged_not_raised() {
        let fx = fixture();
        let local = fx.root.join("work/Dataset.mzML.gz");
        fs::create_dir_all(fx.root.join("work").as_std_path()).unwrap();
        fs::write(local.as_std_path(), b"gz").unwrap();
        // A directory cannot be removed with remove_file.
        let remote = fx.root.join("cache/MSConvert_3.0_1234/Dataset.mzML.gz");
        fs::create_dir_all(remote.as_std_path()).unwrap();

        evict_or_warn(&local, &remote);
        assert!(!local.as_std_path().exists());
        assert!(remote.as_std_path().is_dir());
    }

    #[test]
    fn dta_zip_is_preferred_and_unzipped() {
        let fx = fixture();
        let storage = fx.root.join("storage/Dataset");
        let txt = storage.join("Dataset_dta.txt");
        fs::write(txt.as_std_path(), b"=== spectra ===").unwrap();
        ArchiveCodec::default()
            .zip_file(&txt, &storage.join("Dataset_dta.zip"))
            .unwrap();
        fs::remove_file(txt.as_std_path()).unwrap();

        let mut retriever: Retriever<'_, _, NoCloud> =
            Retriever::new(fx.params, None, options(), fx.root.join("work"));
        assert!(retriever.retrieve_concatenated_spectra().unwrap());
        assert_eq!(
            fs::read(fx.root.join("work/Dataset_dta.txt")).unwrap(),
            b"=== spectra ==="
        );
    }

    #[test]
    fn dta_text_is_used_without_zip() {
        let fx = fixture();
        fs::write(fx.root.join("storage/Dataset/Dataset_dta.txt"), b"dta").unwrap();
        let mut retriever: Retriever<'_, _, NoCloud> =
            Retriever::new(fx.params, None, options(), fx.root.join("work"));
        assert!(retriever.retrieve_concatenated_spectra().unwrap());
        assert!(fx.root.join("work/Dataset_dta.txt").as_std_path().is_file());
    }

    #[test]
    fn format_names() {
        assert_eq!(SpectraFormat::MzXML.extension(), ".mzXML");
        assert_eq!(SpectraFormat::MzML.to_string(), "mzML");
    }
}
