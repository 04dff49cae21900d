use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cloud::RemoteFile;
use crate::error::RetrievalError;
use crate::params::{JOB_SECTION, ParamStore, keys};

pub const CLOUD_PATH_FLAG: &str = "cloud-index://";
pub const CLOUD_FILE_ID_TAG: &str = "@fileid=";
pub const STORAGE_PATH_INFO_SUFFIX: &str = "_StoragePathInfo.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    TransferStaging,
    PrimaryStorage,
    CloudArchive,
    LongTermArchive,
}

impl Tier {
    pub fn is_archive(self) -> bool {
        matches!(self, Tier::CloudArchive | Tier::LongTermArchive)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::TransferStaging => write!(f, "transfer"),
            Tier::PrimaryStorage => write!(f, "storage"),
            Tier::CloudArchive => write!(f, "cloud"),
            Tier::LongTermArchive => write!(f, "archive"),
        }
    }
}

/// Log level used when an artifact cannot be found; `Debug` marks optional files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum MissSeverity {
    Debug,
    Info,
    Warning,
    #[default]
    Error,
}

impl MissSeverity {
    pub fn log(self, message: &str) {
        match self {
            MissSeverity::Debug => debug!("{message}"),
            MissSeverity::Info => info!("{message}"),
            MissSeverity::Warning => warn!("{message}"),
            MissSeverity::Error => error!("{message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetIdentity {
    name: String,
    folder_name: String,
}

impl DatasetIdentity {
    pub fn new(name: impl Into<String>, folder_name: Option<String>) -> Self {
        let name = name.into();
        let folder_name = folder_name
            .map(|folder| folder.trim().to_string())
            .filter(|folder| !folder.is_empty())
            .unwrap_or_else(|| name.clone());
        Self { name, folder_name }
    }

    pub fn from_params<P: ParamStore + ?Sized>(params: &P) -> Result<Self, RetrievalError> {
        let name = params
            .get_param(JOB_SECTION, keys::DATASET_NAME)
            .filter(|value| !value.trim().is_empty())
            .or_else(|| params.get_any(keys::DATASET_NAME))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| RetrievalError::missing_parameter(JOB_SECTION, keys::DATASET_NAME))?;
        let folder_name = params.get_param(JOB_SECTION, keys::DATASET_FOLDER_NAME);
        Ok(Self::new(name, folder_name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn folder_name(&self) -> &str {
        &self.folder_name
    }

    pub fn is_renamed(&self) -> bool {
        self.folder_name != self.name
    }

    /// Folder spellings to try, the storage folder name first.
    pub fn folder_spellings(&self) -> Vec<&str> {
        if self.is_renamed() {
            vec![self.folder_name.as_str(), self.name.as_str()]
        } else {
            vec![self.folder_name.as_str()]
        }
    }
}

impl fmt::Display for DatasetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateLocation {
    Filesystem(Utf8PathBuf),
    CloudIndex {
        dataset: String,
        subfolder: Option<String>,
    },
}

impl fmt::Display for CandidateLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateLocation::Filesystem(path) => write!(f, "{path}"),
            CandidateLocation::CloudIndex { dataset, subfolder } => {
                let path = CloudPath::new(dataset.clone(), subfolder.clone().unwrap_or_default());
                write!(f, "{path}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub tier: Tier,
    pub location: CandidateLocation,
    pub log_if_missing: bool,
}

/// Location inside the cloud archive index, rendered as
/// `cloud-index://<dataset>/<relative path>[@fileid=<id>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CloudPath {
    pub dataset: String,
    pub relative: String,
    pub file_id: Option<u64>,
}

impl CloudPath {
    pub fn new(dataset: impl Into<String>, relative: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            relative: normalize_relative(&relative.into()),
            file_id: None,
        }
    }

    pub fn for_file(file: &RemoteFile) -> Self {
        Self {
            dataset: file.dataset.clone(),
            relative: normalize_relative(&file.relative_path),
            file_id: Some(file.file_id),
        }
    }

    pub fn join(&self, name: &str) -> Self {
        let relative = if self.relative.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.relative)
        };
        Self::new(self.dataset.clone(), relative)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.relative.rsplit('/').next().filter(|name| !name.is_empty())
    }

    pub fn is_cloud_path(value: &str) -> bool {
        value.starts_with(CLOUD_PATH_FLAG)
    }
}

fn normalize_relative(value: &str) -> String {
    value
        .replace('\\', "/")
        .split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

impl fmt::Display for CloudPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{CLOUD_PATH_FLAG}{}", self.dataset)?;
        if !self.relative.is_empty() {
            write!(f, "/{}", self.relative)?;
        }
        if let Some(id) = self.file_id {
            write!(f, "{CLOUD_FILE_ID_TAG}{id}")?;
        }
        Ok(())
    }
}

impl FromStr for CloudPath {
    type Err = RetrievalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let rest = value
            .trim()
            .strip_prefix(CLOUD_PATH_FLAG)
            .ok_or_else(|| RetrievalError::InvalidCloudPath(value.to_string()))?;
        let (path, file_id) = match rest.rsplit_once(CLOUD_FILE_ID_TAG) {
            Some((path, id)) => {
                let id = id
                    .parse::<u64>()
                    .map_err(|_| RetrievalError::InvalidCloudPath(value.to_string()))?;
                (path, Some(id))
            }
            None => (rest, None),
        };
        let (dataset, relative) = path.split_once('/').unwrap_or((path, ""));
        if dataset.is_empty() {
            return Err(RetrievalError::InvalidCloudPath(value.to_string()));
        }
        let mut parsed = CloudPath::new(dataset, relative);
        parsed.file_id = file_id;
        Ok(parsed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedLocation {
    Filesystem {
        folder: Utf8PathBuf,
        matched_files: Vec<Utf8PathBuf>,
    },
    Cloud {
        folder: CloudPath,
        files: Vec<RemoteFile>,
    },
}

impl ResolvedLocation {
    pub fn path_string(&self) -> String {
        match self {
            ResolvedLocation::Filesystem { folder, .. } => folder.to_string(),
            ResolvedLocation::Cloud { folder, .. } => folder.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub tier: Tier,
    pub location: ResolvedLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(Resolved),
    NotFound {
        default_path: Utf8PathBuf,
        reason: String,
    },
}

impl Resolution {
    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found(_))
    }

    pub fn path(&self) -> String {
        match self {
            Resolution::Found(resolved) => resolved.location.path_string(),
            Resolution::NotFound { default_path, .. } => default_path.to_string(),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Resolution::Found(_) => None,
            Resolution::NotFound { reason, .. } => Some(reason),
        }
    }

    pub fn found(self) -> Option<Resolved> {
        match self {
            Resolution::Found(resolved) => Some(resolved),
            Resolution::NotFound { .. } => None,
        }
    }
}

/// One concrete file picked by the resolver.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedFile {
    Local { tier: Tier, path: Utf8PathBuf },
    Cloud { path: CloudPath, file: RemoteFile },
}

impl ResolvedFile {
    pub fn tier(&self) -> Tier {
        match self {
            ResolvedFile::Local { tier, .. } => *tier,
            ResolvedFile::Cloud { .. } => Tier::CloudArchive,
        }
    }

    pub fn file_name(&self) -> Result<&str, RetrievalError> {
        match self {
            ResolvedFile::Local { path, .. } => path
                .file_name()
                .ok_or_else(|| RetrievalError::InvalidPath(path.to_string())),
            ResolvedFile::Cloud { path, .. } => path
                .file_name()
                .ok_or_else(|| RetrievalError::InvalidCloudPath(path.to_string())),
        }
    }

    pub fn path_string(&self) -> String {
        match self {
            ResolvedFile::Local { path, .. } => path.to_string(),
            ResolvedFile::Cloud { path, .. } => path.to_string(),
        }
    }

    pub fn local_path(&self) -> Option<&Utf8Path> {
        match self {
            ResolvedFile::Local { path, .. } => Some(path),
            ResolvedFile::Cloud { .. } => None,
        }
    }
}
