//! `.hashcheck` sidecar records stored next to cached artifacts.
//!
//! The file is plain text, one `key=value` per line, `#` starts a comment:
//!
//! ```text
//! # Hashcheck file created 2024-05-01T10:00:00Z
//! size=1048576
//! modification_date_utc=2024-05-01T09:58:12Z
//! hash=9f86d081884c7d65...
//! hashtype=sha256
//! ```

use std::fs;
use std::io::{self, Read};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::RetrievalError;
use crate::fs_util;

pub const SIDECAR_EXTENSION: &str = ".hashcheck";
pub const MTIME_TOLERANCE_SECS: i64 = 2;
pub const HASH_TYPE_SHA256: &str = "sha256";

pub fn sidecar_path(data_file: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{data_file}{SIDECAR_EXTENSION}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarRecord {
    pub size: u64,
    pub modification_date_utc: DateTime<Utc>,
    pub hash: Option<String>,
    pub hash_type: String,
}

impl SidecarRecord {
    pub fn for_file(data_file: &Utf8Path, compute_hash: bool) -> Result<Self, RetrievalError> {
        let meta = fs::metadata(data_file.as_std_path())
            .map_err(|err| RetrievalError::Filesystem(format!("stat {data_file}: {err}")))?;
        let hash = if compute_hash {
            Some(sha256_file(data_file)?)
        } else {
            None
        };
        Ok(Self {
            size: meta.len(),
            modification_date_utc: fs_util::modified_utc(data_file)?,
            hash,
            hash_type: HASH_TYPE_SHA256.to_string(),
        })
    }

    pub fn parse(content: &str, origin: &str) -> Result<Self, RetrievalError> {
        let invalid = |message: String| RetrievalError::InvalidSidecar {
            path: origin.to_string(),
            message,
        };

        let mut size = None;
        let mut modified = None;
        let mut hash = None;
        let mut hash_type = None;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "size" => {
                    size = Some(
                        value
                            .parse::<u64>()
                            .map_err(|_| invalid(format!("size is not an integer: {value}")))?,
                    )
                }
                "modification_date_utc" => {
                    modified = Some(
                        parse_timestamp(value)
                            .ok_or_else(|| invalid(format!("unparseable date: {value}")))?,
                    )
                }
                "hash" => hash = Some(value.to_ascii_lowercase()).filter(|h| !h.is_empty()),
                "hashtype" => hash_type = Some(value.to_ascii_lowercase()),
                _ => {}
            }
        }

        Ok(Self {
            size: size.ok_or_else(|| invalid("missing size".to_string()))?,
            modification_date_utc: modified
                .ok_or_else(|| invalid("missing modification_date_utc".to_string()))?,
            hash,
            hash_type: hash_type
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| HASH_TYPE_SHA256.to_string()),
        })
    }

    pub fn read(path: &Utf8Path) -> Result<Self, RetrievalError> {
        let content = fs::read_to_string(path.as_std_path()).map_err(|err| {
            RetrievalError::InvalidSidecar {
                path: path.to_string(),
                message: err.to_string(),
            }
        })?;
        Self::parse(&content, path.as_str())
    }

    pub fn to_file_text(&self) -> String {
        format!(
            "# Hashcheck file created {}\nsize={}\nmodification_date_utc={}\nhash={}\nhashtype={}\n",
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            self.size,
            self.modification_date_utc
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            self.hash.as_deref().unwrap_or(""),
            self.hash_type,
        )
    }

    pub fn write(&self, path: &Utf8Path) -> Result<(), RetrievalError> {
        crate::store::write_bytes_atomic(path, self.to_file_text().as_bytes())
    }
}

/// Writes `<data_file>.hashcheck` describing the current file.
pub fn write_sidecar(data_file: &Utf8Path, compute_hash: bool) -> Result<Utf8PathBuf, RetrievalError> {
    let record = SidecarRecord::for_file(data_file, compute_hash)?;
    let path = sidecar_path(data_file);
    record.write(&path)?;
    debug!(sidecar = %path, "wrote sidecar");
    Ok(path)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%m/%d/%Y %I:%M:%S %p",
        "%m/%d/%Y %H:%M:%S",
    ];
    FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

pub fn sha256_file(path: &Utf8Path) -> Result<String, RetrievalError> {
    let mut file = fs::File::open(path.as_std_path())
        .map_err(|err| RetrievalError::Filesystem(format!("open {path}: {err}")))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(RetrievalError::Filesystem(format!("read {path}: {err}"))),
        };
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidecarCheck {
    pub check_date: bool,
    pub compute_hash: bool,
}

impl Default for SidecarCheck {
    fn default() -> Self {
        Self {
            check_date: true,
            compute_hash: false,
        }
    }
}

impl SidecarCheck {
    pub fn with_hash() -> Self {
        Self {
            compute_hash: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidecarValidation {
    Valid,
    Invalid(String),
}

impl SidecarValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, SidecarValidation::Valid)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            SidecarValidation::Valid => None,
            SidecarValidation::Invalid(message) => Some(message),
        }
    }
}

/// Compares `data_file` against its sidecar. Size is always compared; the
/// date and hash checks follow `check`. Hashing is opt-in because the data
/// file usually sits on a remote share.
pub fn validate(
    data_file: &Utf8Path,
    sidecar: Option<&Utf8Path>,
    check: SidecarCheck,
) -> SidecarValidation {
    let sidecar = sidecar
        .map(Utf8Path::to_path_buf)
        .unwrap_or_else(|| sidecar_path(data_file));

    let meta = match fs::metadata(data_file.as_std_path()) {
        Ok(meta) => meta,
        Err(err) => return SidecarValidation::Invalid(format!("data file {data_file}: {err}")),
    };
    let record = match SidecarRecord::read(&sidecar) {
        Ok(record) => record,
        Err(err) => return SidecarValidation::Invalid(err.to_string()),
    };

    if record.size != meta.len() {
        return SidecarValidation::Invalid(format!(
            "size mismatch for {data_file}: sidecar {} bytes, actual {} bytes",
            record.size,
            meta.len()
        ));
    }

    if check.check_date {
        let actual = match fs_util::modified_utc(data_file) {
            Ok(actual) => actual,
            Err(err) => return SidecarValidation::Invalid(err.to_string()),
        };
        let drift = (actual - record.modification_date_utc).abs();
        if drift > TimeDelta::seconds(MTIME_TOLERANCE_SECS) {
            return SidecarValidation::Invalid(format!(
                "modification time mismatch for {data_file}: sidecar {}, actual {} ({}s apart)",
                record.modification_date_utc.to_rfc3339(),
                actual.to_rfc3339(),
                drift.num_seconds()
            ));
        }
    }

    if check.compute_hash {
        if record.hash_type != HASH_TYPE_SHA256 {
            return SidecarValidation::Invalid(format!(
                "unsupported hash type in {sidecar}: {}",
                record.hash_type
            ));
        }
        let Some(expected) = record.hash.as_deref() else {
            return SidecarValidation::Invalid(format!("sidecar {sidecar} has no hash"));
        };
        let actual = match sha256_file(data_file) {
            Ok(actual) => actual,
            Err(err) => return SidecarValidation::Invalid(err.to_string()),
        };
        if actual != expected {
            return SidecarValidation::Invalid(format!(
                "hash mismatch for {data_file}: sidecar {expected}, actual {actual}"
            ));
        }
    }

    SidecarValidation::Valid
}

/// Deletes a stale local copy and, when given, the stale remote copy together
/// with its sidecar so the artifact gets regenerated. Every removal is
/// attempted; the first failure is returned.
pub fn evict_stale(local: Option<&Utf8Path>, remote: Option<&Utf8Path>) -> Result<(), RetrievalError> {
    let mut first_error = None;
    let mut remove = |path: &Utf8Path, what: &str| match fs_util::remove_file_if_exists(path) {
        Ok(true) => warn!(path = %path, "deleted stale {what}"),
        Ok(false) => {}
        Err(err) => {
            first_error.get_or_insert(err);
        }
    };
    if let Some(local) = local {
        remove(local, "local copy");
    }
    if let Some(remote) = remote {
        remove(remote, "cached copy");
        remove(&sidecar_path(remote), "sidecar");
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, root)
    }

    fn sidecar_for(data: &Utf8Path, size: u64, modified: DateTime<Utc>, hash: &str) {
        let text = format!(
            "# test\nsize={size}\nmodification_date_utc={}\nhash={hash}\n",
            modified.to_rfc3339()
        );
        fs::write(sidecar_path(data).as_std_path(), text).unwrap();
    }

    #[test]
    fn sidecar_path_appends_extension() {
        assert_eq!(
            sidecar_path(Utf8Path::new("/cache/Dataset.mzML.gz")),
            Utf8PathBuf::from("/cache/Dataset.mzML.gz.hashcheck")
        );
    }

    #[test]
    fn parse_accepts_comments_and_legacy_dates() {
        let record = SidecarRecord::parse(
            "# comment\nsize=12\nmodification_date_utc=5/1/2024 9:58:12 AM\nhash=\n",
            "test",
        )
        .unwrap();
        assert_eq!(record.size, 12);
        assert_eq!(record.hash, None);
        assert_eq!(record.hash_type, HASH_TYPE_SHA256);
        assert_eq!(
            record.modification_date_utc.to_rfc3339(),
            "2024-05-01T09:58:12+00:00"
        );
    }

    #[test]
    fn parse_requires_size() {
        let err = SidecarRecord::parse("modification_date_utc=2024-05-01T00:00:00Z\n", "test")
            .unwrap_err();
        assert!(err.to_string().contains("missing size"));
    }

    #[test]
    fn written_sidecar_validates_with_hash() {
        let (_temp, root) = scratch();
        let data = root.join("Dataset.mzML");
        fs::write(data.as_std_path(), b"<mzML/>").unwrap();
        write_sidecar(&data, true).unwrap();

        assert!(validate(&data, None, SidecarCheck::default()).is_valid());
        assert!(validate(&data, None, SidecarCheck::with_hash()).is_valid());
    }

    #[test]
    fn size_mismatch_fails_for_every_flag_combination() {
        let (_temp, root) = scratch();
        let data = root.join("Dataset.mzML");
        fs::write(data.as_std_path(), b"12345").unwrap();
        let modified = fs_util::modified_utc(&data).unwrap();
        let hash = sha256_file(&data).unwrap();
        sidecar_for(&data, 999, modified, &hash);

        for check_date in [false, true] {
            for compute_hash in [false, true] {
                let check = SidecarCheck {
                    check_date,
                    compute_hash,
                };
                let result = validate(&data, None, check);
                assert!(!result.is_valid(), "{check:?}");
                assert!(result.message().unwrap().contains("size mismatch"));
            }
        }
    }

    #[test]
    fn mtime_three_seconds_off_fails() {
        let (_temp, root) = scratch();
        let data = root.join("Dataset.mzML");
        fs::write(data.as_std_path(), b"12345").unwrap();
        let actual = fs_util::modified_utc(&data).unwrap();
        sidecar_for(&data, 5, actual - TimeDelta::seconds(3), "");

        let result = validate(&data, None, SidecarCheck::default());
        assert!(result.message().unwrap().contains("modification time mismatch"));

        let no_date = SidecarCheck {
            check_date: false,
            ..SidecarCheck::default()
        };
        assert!(validate(&data, None, no_date).is_valid());
    }

    #[test]
    fn mtime_within_tolerance_passes() {
        let (_temp, root) = scratch();
        let data = root.join("Dataset.mzML");
        fs::write(data.as_std_path(), b"12345").unwrap();
        let exact = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        fs_util::set_modified_utc(&data, exact).unwrap();
        sidecar_for(&data, 5, exact - TimeDelta::seconds(2), "");

        assert!(validate(&data, None, SidecarCheck::default()).is_valid());
    }

    #[test]
    fn hash_mismatch_is_reported() {
        let (_temp, root) = scratch();
        let data = root.join("Dataset.mzML");
        fs::write(data.as_std_path(), b"12345").unwrap();
        let modified = fs_util::modified_utc(&data).unwrap();
        sidecar_for(&data, 5, modified, "deadbeef");

        assert!(validate(&data, None, SidecarCheck::default()).is_valid());
        let result = validate(&data, None, SidecarCheck::with_hash());
        assert!(result.message().unwrap().contains("hash mismatch"));
    }

    #[test]
    fn missing_sidecar_is_invalid() {
        let (_temp, root) = scratch();
        let data = root.join("Dataset.mzML");
        fs::write(data.as_std_path(), b"12345").unwrap();
        assert!(!validate(&data, None, SidecarCheck::default()).is_valid());
    }

    #[test]
    fn evict_removes_local_remote_and_sidecar() {
        let (_temp, root) = scratch();
        let local = root.join("local.mzML");
        let remote = root.join("remote.mzML");
        fs::write(local.as_std_path(), b"a").unwrap();
        fs::write(remote.as_std_path(), b"a").unwrap();
        write_sidecar(&remote, false).unwrap();

        evict_stale(Some(local.as_path()), Some(remote.as_path())).unwrap();
        assert!(!local.as_std_path().exists());
        assert!(!remote.as_std_path().exists());
        assert!(!sidecar_path(&remote).as_std_path().exists());
    }

    #[test]
    fn evict_keeps_going_after_a_failed_removal() {
        let (_temp, root) = scratch();
        let local = root.join("local.mzML");
        let remote = root.join("remote.mzML");
        fs::write(local.as_std_path(), b"a").unwrap();
        fs::create_dir(remote.as_std_path()).unwrap();
        fs::write(sidecar_path(&remote).as_std_path(), b"size=1\n").unwrap();

        let err = evict_stale(Some(local.as_path()), Some(remote.as_path())).unwrap_err();
        assert!(err.to_string().contains("remote.mzML"));
        assert!(!local.as_std_path().exists());
        assert!(remote.as_std_path().is_dir());
        assert!(!sidecar_path(&remote).as_std_path().exists());
    }
}
