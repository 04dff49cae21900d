use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;

pub const JOB_SECTION: &str = "JobParameters";
pub const STEP_SECTION: &str = "StepParameters";

pub mod keys {
    pub const JOB: &str = "Job";
    pub const DATASET_NAME: &str = "DatasetName";
    pub const DATASET_FOLDER_NAME: &str = "DatasetFolderName";
    pub const DATASET_ID: &str = "DatasetID";
    pub const DATASET_STORAGE_PATH: &str = "DatasetStoragePath";
    pub const DATASET_ARCHIVE_PATH: &str = "DatasetArchivePath";
    pub const TRANSFER_FOLDER_PATH: &str = "transferFolderPath";
    pub const SHARED_RESULTS_FOLDERS: &str = "SharedResultsFolders";
    pub const INPUT_FOLDER_NAME: &str = "InputFolderName";
    pub const INSTRUMENT_DATA_PURGED: &str = "InstrumentDataPurged";
    pub const MSXML_CACHE_FOLDER_PATH: &str = "MSXMLCacheFolderPath";
    pub const MSXML_GENERATOR_TOOL: &str = "MSXMLGeneratorTool";
    pub const MSXML_GENERATOR_VERSION: &str = "MSXMLGeneratorVersion";
}

/// Read/write view over a job's sectioned key/value parameters.
pub trait ParamStore {
    fn get_param(&self, section: &str, key: &str) -> Option<String>;

    /// Looks the key up in every section; the first non-empty value wins.
    fn get_any(&self, key: &str) -> Option<String>;

    fn set_param(&mut self, section: &str, key: &str, value: &str);

    fn get_str(&self, section: &str, key: &str, default: &str) -> String {
        self.get_param(section, key)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get_param(section, key) {
            Some(value) => parse_bool(&value).unwrap_or(default),
            None => default,
        }
    }

    fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        self.get_param(section, key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_float(&self, section: &str, key: &str, default: f64) -> f64 {
        self.get_param(section, key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }

    fn require(&self, section: &str, key: &str) -> Result<String, RetrievalError> {
        self.get_param(section, key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| RetrievalError::missing_parameter(section, key))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "y" => Some(true),
        "false" | "no" | "0" | "n" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParams {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl JobParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, RetrievalError> {
        let content = fs::read_to_string(path)
            .map_err(|_| RetrievalError::ConfigRead(path.to_path_buf()))?;
        serde_json::from_str(&content).map_err(|err| RetrievalError::ConfigParse(err.to_string()))
    }

    pub fn with(mut self, section: &str, key: &str, value: &str) -> Self {
        self.set_param(section, key, value);
        self
    }
}

impl ParamStore for JobParams {
    fn get_param(&self, section: &str, key: &str) -> Option<String> {
        self.sections
            .get(section)
            .and_then(|entries| entries.get(key))
            .cloned()
    }

    fn get_any(&self, key: &str) -> Option<String> {
        self.sections
            .values()
            .filter_map(|entries| entries.get(key))
            .find(|value| !value.trim().is_empty())
            .cloned()
    }

    fn set_param(&mut self, section: &str, key: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }
}

/// Inputs retrieved into the working directory that must not be collected as results.
pub trait ResultSkipList {
    fn add_result_file_to_skip(&mut self, name: &str);
    fn add_result_file_extension_to_skip(&mut self, extension: &str);
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SkipList {
    files: BTreeSet<String>,
    extensions: BTreeSet<String>,
}

impl SkipList {
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(String::as_str)
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(String::as_str)
    }

    pub fn should_skip(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        self.files.contains(&lower) || self.extensions.iter().any(|ext| lower.ends_with(ext))
    }
}

impl ResultSkipList for SkipList {
    fn add_result_file_to_skip(&mut self, name: &str) {
        let name = name.trim();
        if !name.is_empty() {
            self.files.insert(name.to_ascii_lowercase());
        }
    }

    fn add_result_file_extension_to_skip(&mut self, extension: &str) {
        let extension = extension.trim();
        if extension.is_empty() {
            return;
        }
        let extension = if extension.starts_with('.') || extension.starts_with('_') {
            extension.to_ascii_lowercase()
        } else {
            format!(".{}", extension.to_ascii_lowercase())
        };
        self.extensions.insert(extension);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn typed_getters_fall_back_to_defaults() {
        let params = JobParams::new()
            .with(JOB_SECTION, keys::INSTRUMENT_DATA_PURGED, "True")
            .with(JOB_SECTION, keys::JOB, "1234")
            .with(STEP_SECTION, "Tolerance", "0.5")
            .with(STEP_SECTION, "Broken", "abc");

        assert!(params.get_bool(JOB_SECTION, keys::INSTRUMENT_DATA_PURGED, false));
        assert!(!params.get_bool(JOB_SECTION, "Missing", false));
        assert_eq!(params.get_int(JOB_SECTION, keys::JOB, 0), 1234);
        assert_eq!(params.get_int(STEP_SECTION, "Broken", 7), 7);
        assert_eq!(params.get_float(STEP_SECTION, "Tolerance", 0.0), 0.5);
        assert_eq!(params.get_str(JOB_SECTION, "Missing", "x"), "x");
    }

    #[test]
    fn get_any_searches_all_sections() {
        let params = JobParams::new()
            .with(JOB_SECTION, keys::DATASET_NAME, "")
            .with(STEP_SECTION, keys::DATASET_NAME, "QC_Shew_01");
        assert_eq!(params.get_any(keys::DATASET_NAME).as_deref(), Some("QC_Shew_01"));
    }

    #[test]
    fn require_rejects_blank_values() {
        let params = JobParams::new().with(JOB_SECTION, keys::DATASET_NAME, "   ");
        let err = params.require(JOB_SECTION, keys::DATASET_NAME).unwrap_err();
        assert_matches!(err, RetrievalError::MissingParameter { .. });
        assert!(err.is_configuration());
    }

    #[test]
    fn params_round_trip_through_json() {
        let json = r#"{ "JobParameters": { "DatasetName": "QC_Shew_01" } }"#;
        let params: JobParams = serde_json::from_str(json).unwrap();
        assert_eq!(
            params.get_param(JOB_SECTION, keys::DATASET_NAME).as_deref(),
            Some("QC_Shew_01")
        );
    }

    #[test]
    fn skip_list_normalizes_extensions() {
        let mut skip = SkipList::default();
        skip.add_result_file_to_skip("Dataset_dta.zip");
        skip.add_result_file_extension_to_skip("mzML");
        skip.add_result_file_extension_to_skip("_syn.txt");
        assert!(skip.should_skip("dataset_DTA.zip"));
        assert!(skip.should_skip("Other.mzml"));
        assert!(skip.should_skip("Other_syn.txt"));
        assert!(!skip.should_skip("Other_fht.txt"));
    }
}
