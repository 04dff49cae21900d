use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum RetrievalError {
    #[error("required job parameter is missing or empty: {section}/{key}")]
    #[diagnostic(help("set the parameter in the job parameter file before retrieving"))]
    MissingParameter { section: String, key: String },

    #[error("invalid job parameter {key}: {message}")]
    InvalidParameter { key: String, message: String },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("cannot determine parent directory of {0}")]
    NoParentDirectory(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("corrupt archive {path}: {message}")]
    CorruptArchive { path: String, message: String },

    #[error("invalid sidecar file {path}: {message}")]
    InvalidSidecar { path: String, message: String },

    #[error("invalid wildcard pattern: {0}")]
    InvalidPattern(String),

    #[error("cloud index request failed: {0}")]
    CloudHttp(String),

    #[error("cloud index returned status {status}: {message}")]
    CloudStatus { status: u16, message: String },

    #[error("cloud index is not configured")]
    CloudNotConfigured,

    #[error("invalid cloud path: {0}")]
    InvalidCloudPath(String),
}

impl RetrievalError {
    pub fn missing_parameter(section: &str, key: &str) -> Self {
        Self::MissingParameter {
            section: section.to_string(),
            key: key.to_string(),
        }
    }

    pub fn corrupt_archive(path: impl ToString, message: impl ToString) -> Self {
        Self::CorruptArchive {
            path: path.to_string(),
            message: message.to_string(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingParameter { .. }
                | Self::InvalidParameter { .. }
                | Self::ConfigRead(_)
                | Self::ConfigParse(_)
                | Self::CloudNotConfigured
        )
    }
}
