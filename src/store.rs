use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;
use tracing::{debug, error, info};

use crate::cloud::DownloadQueue;
use crate::config::{RetrievalOptions, RetryPolicy};
use crate::domain::{MissSeverity, ResolvedFile, STORAGE_PATH_INFO_SUFFIX};
use crate::error::RetrievalError;
use crate::fs_util;
use crate::sidecar;

/// The job's local working directory.
#[derive(Debug, Clone)]
pub struct WorkArea {
    work_dir: Utf8PathBuf,
}

impl WorkArea {
    pub fn new(work_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Utf8Path {
        &self.work_dir
    }

    pub fn path_for(&self, name: &str) -> Utf8PathBuf {
        self.work_dir.join(name)
    }

    pub fn ensure(&self) -> Result<(), RetrievalError> {
        fs::create_dir_all(self.work_dir.as_std_path())
            .map_err(|err| RetrievalError::Filesystem(err.to_string()))
    }

    pub fn materialize(
        &self,
        file: &ResolvedFile,
        options: &RetrievalOptions,
        queue: &mut DownloadQueue,
        severity: MissSeverity,
    ) -> Result<bool, RetrievalError> {
        let name = file.file_name()?.to_string();
        self.materialize_as(file, &name, options, queue, severity)
    }

    /// Like [`WorkArea::materialize`] but stores a local file under `dest_name`.
    /// Cloud files keep their own name; they are downloaded later.
    pub fn materialize_as(
        &self,
        file: &ResolvedFile,
        dest_name: &str,
        options: &RetrievalOptions,
        queue: &mut DownloadQueue,
        severity: MissSeverity,
    ) -> Result<bool, RetrievalError> {
        self.ensure()?;
        if options.reference_only {
            self.write_reference(dest_name, &file.path_string())?;
            return Ok(true);
        }

        match file {
            ResolvedFile::Cloud { file, .. } => {
                Ok(queue.enqueue(file.clone(), &self.work_dir).is_queued())
            }
            ResolvedFile::Local { path, .. } => {
                let dest = self.path_for(dest_name);
                self.copy_in(path, &dest, options, severity)
            }
        }
    }

    fn copy_in(
        &self,
        source: &Utf8Path,
        dest: &Utf8Path,
        options: &RetrievalOptions,
        severity: MissSeverity,
    ) -> Result<bool, RetrievalError> {
        match copy_with_retry(source, dest, &options.retry) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                severity.log(&format!("file not found: {source}"));
                return Ok(false);
            }
            Err(err) => {
                error!("error copying {source} to {dest}: {err}");
                return Ok(false);
            }
        }

        if options.verify_hash_after_copy {
            let expected = sidecar::sha256_file(source)?;
            let actual = sidecar::sha256_file(dest)?;
            if expected != actual {
                error!("hash mismatch after copying {source}; removing {dest}");
                fs_util::remove_file_if_exists(dest)?;
                return Ok(false);
            }
        }
        debug!("copied {source} to {dest}");
        Ok(true)
    }

    /// Writes `<name>_StoragePathInfo.txt`, whose first line is the remote path.
    pub fn write_reference(&self, name: &str, remote_path: &str) -> Result<Utf8PathBuf, RetrievalError> {
        let info_path = self.path_for(&format!("{name}{STORAGE_PATH_INFO_SUFFIX}"));
        write_bytes_atomic(&info_path, format!("{remote_path}\n").as_bytes())?;
        info!("referenced {remote_path} via {info_path}");
        Ok(info_path)
    }
}

pub fn read_storage_path_info(path: &Utf8Path) -> Result<String, RetrievalError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| RetrievalError::Filesystem(format!("read {path}: {err}")))?;
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .ok_or_else(|| RetrievalError::InvalidPath(format!("{path} is empty")))
}

pub fn copy_with_retry(source: &Utf8Path, dest: &Utf8Path, policy: &RetryPolicy) -> io::Result<()> {
    fs_util::with_retry(policy, &format!("copy {source}"), || {
        copy_file_atomic_io(source, dest)
    })
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), RetrievalError> {
    let parent = containing_dir(path);
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
    let temp = Builder::new()
        .prefix(".artifact-write")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
    fs::write(temp.path(), content).map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), RetrievalError> {
    copy_file_atomic_io(source, dest)
        .map_err(|err| RetrievalError::Filesystem(format!("copy {source} to {dest}: {err}")))
}

fn copy_file_atomic_io(source: &Utf8Path, dest: &Utf8Path) -> io::Result<()> {
    let parent = containing_dir(dest);
    fs::create_dir_all(parent.as_std_path())?;
    let temp = Builder::new()
        .prefix(".artifact-copy")
        .tempfile_in(parent.as_std_path())?;
    fs::copy(source.as_std_path(), temp.path())?;
    let modified = fs::metadata(source.as_std_path())?.modified()?;
    temp.as_file().set_modified(modified)?;
    temp.persist(dest.as_std_path()).map_err(|err| err.error)?;
    Ok(())
}

fn containing_dir(path: &Utf8Path) -> &Utf8Path {
    match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    }
}

/// Copies every file under `source` into `dest`, keeping relative paths.
pub fn copy_dir_recursive(
    source: &Utf8Path,
    dest: &Utf8Path,
    policy: &RetryPolicy,
) -> Result<Vec<Utf8PathBuf>, RetrievalError> {
    fs::create_dir_all(dest.as_std_path())
        .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
    let mut copied = Vec::new();
    for entry in fs_util::walk_dir(source.as_std_path())? {
        let entry = fs_util::utf8_path(entry)?;
        let relative = entry
            .strip_prefix(source)
            .map_err(|_| RetrievalError::InvalidPath(entry.to_string()))?;
        let target = dest.join(relative);
        if entry.as_std_path().is_dir() {
            fs::create_dir_all(target.as_std_path())
                .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
        } else {
            copy_with_retry(&entry, &target, policy)
                .map_err(|err| RetrievalError::Filesystem(format!("copy {entry}: {err}")))?;
            copied.push(target);
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cloud::RemoteFile;
    use crate::domain::{CloudPath, Tier};

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, root)
    }

    fn options() -> RetrievalOptions {
        RetrievalOptions {
            retry: RetryPolicy::new(2, Duration::ZERO),
            ..RetrievalOptions::default()
        }
    }

    #[test]
    fn copies_local_file_into_work_dir() {
        let (_temp, root) = scratch();
        let source = root.join("storage").join("QC_Shew_01_dta.txt");
        fs::create_dir_all(source.parent().unwrap().as_std_path()).unwrap();
        fs::write(source.as_std_path(), b"spectra").unwrap();

        let work = WorkArea::new(root.join("work"));
        let mut queue = DownloadQueue::new();
        let file = ResolvedFile::Local {
            tier: Tier::PrimaryStorage,
            path: source.clone(),
        };
        let options = RetrievalOptions {
            verify_hash_after_copy: true,
            ..options()
        };
        assert!(work.materialize(&file, &options, &mut queue, MissSeverity::Error).unwrap());
        assert_eq!(fs::read(work.path_for("QC_Shew_01_dta.txt")).unwrap(), b"spectra");
        assert!(queue.is_empty());
    }

    #[test]
    fn missing_source_is_not_an_error() {
        let (_temp, root) = scratch();
        let work = WorkArea::new(root.join("work"));
        let file = ResolvedFile::Local {
            tier: Tier::PrimaryStorage,
            path: root.join("absent.txt"),
        };
        let copied = work
            .materialize(&file, &options(), &mut DownloadQueue::new(), MissSeverity::Debug)
            .unwrap();
        assert!(!copied);
    }

    #[test]
    fn reference_only_writes_storage_path_info() {
        let (_temp, root) = scratch();
        let work = WorkArea::new(root.join("work"));
        let remote = RemoteFile {
            file_id: 77,
            dataset: "QC_Shew_01".to_string(),
            relative_path: "QC_Shew_01.raw".to_string(),
            transaction_id: 0,
            size_bytes: 10,
            modified_utc: None,
        };
        let file = ResolvedFile::Cloud {
            path: CloudPath::for_file(&remote),
            file: remote,
        };
        let options = RetrievalOptions {
            reference_only: true,
            ..options()
        };
        let mut queue = DownloadQueue::new();
        assert!(work.materialize(&file, &options, &mut queue, MissSeverity::Error).unwrap());
        assert!(queue.is_empty());

        let info = work.path_for("QC_Shew_01.raw_StoragePathInfo.txt");
        assert_eq!(
            read_storage_path_info(&info).unwrap(),
            "cloud-index://QC_Shew_01/QC_Shew_01.raw@fileid=77"
        );
    }

    #[test]
    fn copy_dir_keeps_relative_layout() {
        let (_temp, root) = scratch();
        let source = root.join("SIC1");
        fs::create_dir_all(source.join("plots").as_std_path()).unwrap();
        fs::write(source.join("a.txt").as_std_path(), b"a").unwrap();
        fs::write(source.join("plots").join("b.png").as_std_path(), b"b").unwrap();

        let copied =
            copy_dir_recursive(&source, &root.join("out"), &RetryPolicy::new(1, Duration::ZERO))
                .unwrap();
        assert_eq!(copied.len(), 2);
        assert_eq!(fs::read(root.join("out/plots/b.png")).unwrap(), b"b");
    }
}
