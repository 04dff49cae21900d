use std::collections::BTreeSet;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::cloud::{CloudIndex, CloudQuery, RemoteFile};
use crate::config::RetryPolicy;
use crate::domain::{Candidate, CandidateLocation, CloudPath, ResolvedLocation};
use crate::error::RetrievalError;
use crate::fs_util::{self, WildcardPattern};

/// What a candidate location must contain. Both patterns are matched
/// case-insensitively against top-level entries only.
#[derive(Debug, Clone, Default)]
pub struct ProbeSpec {
    pub file_pattern: Option<WildcardPattern>,
    pub folder_pattern: Option<WildcardPattern>,
}

impl ProbeSpec {
    pub fn new(file_pattern: Option<&str>, folder_pattern: Option<&str>) -> Result<Self, RetrievalError> {
        let compile = |pattern: Option<&str>| -> Result<Option<WildcardPattern>, RetrievalError> {
            match pattern.map(str::trim).filter(|value| !value.is_empty()) {
                Some(pattern) => WildcardPattern::new(pattern).map(Some),
                None => Ok(None),
            }
        };
        Ok(Self {
            file_pattern: compile(file_pattern)?,
            folder_pattern: compile(folder_pattern)?,
        })
    }

    pub fn file(pattern: &str) -> Result<Self, RetrievalError> {
        Self::new(Some(pattern), None)
    }

    pub fn folder(pattern: &str) -> Result<Self, RetrievalError> {
        Self::new(None, Some(pattern))
    }

    pub fn file_only(&self) -> Self {
        Self {
            file_pattern: self.file_pattern.clone(),
            folder_pattern: None,
        }
    }

    /// Both patterns given: a miss may still be satisfied one level deeper.
    pub fn allows_nested_search(&self) -> bool {
        self.file_pattern.is_some() && self.folder_pattern.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    Matched { files: Vec<Utf8PathBuf> },
    NoMatch,
}

/// Checks an existing folder against `spec`.
pub fn probe_folder(root: &Utf8Path, spec: &ProbeSpec) -> std::io::Result<MatchResult> {
    let files = match &spec.file_pattern {
        Some(pattern) => {
            let files = fs_util::matching_files(root, pattern)?;
            if files.is_empty() {
                return Ok(MatchResult::NoMatch);
            }
            files
        }
        None => Vec::new(),
    };
    if let Some(pattern) = &spec.folder_pattern {
        if fs_util::matching_dirs(root, pattern)?.is_empty() {
            return Ok(MatchResult::NoMatch);
        }
    }
    Ok(MatchResult::Matched { files })
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Found(ResolvedLocation),
    Missing,
    Errored(String),
}

pub trait LocationProbe {
    fn probe(&self, candidate: &Candidate, spec: &ProbeSpec) -> ProbeOutcome;

    /// Subfolders of `candidate` whose names match `folder_pattern`, as candidates
    /// of the same tier.
    fn subfolders(&self, _candidate: &Candidate, _folder_pattern: &WildcardPattern) -> Vec<Candidate> {
        Vec::new()
    }
}

pub struct TierProbe<'a, C: CloudIndex + ?Sized> {
    cloud: Option<&'a C>,
    retry: RetryPolicy,
}

impl<'a, C: CloudIndex + ?Sized> TierProbe<'a, C> {
    pub fn new(cloud: Option<&'a C>, retry: RetryPolicy) -> Self {
        Self { cloud, retry }
    }

    fn probe_filesystem(&self, root: &Utf8Path, spec: &ProbeSpec) -> ProbeOutcome {
        match fs_util::exists_with_retry(root, &self.retry) {
            Ok(true) => {}
            Ok(false) => return ProbeOutcome::Missing,
            Err(err) => return ProbeOutcome::Errored(format!("{root}: {err}")),
        }
        match probe_folder(root, spec) {
            Ok(MatchResult::Matched { files }) => ProbeOutcome::Found(ResolvedLocation::Filesystem {
                folder: root.to_path_buf(),
                matched_files: files,
            }),
            Ok(MatchResult::NoMatch) => ProbeOutcome::Missing,
            Err(err) => ProbeOutcome::Errored(format!("{root}: {err}")),
        }
    }

    fn probe_cloud(
        &self,
        index: &C,
        dataset: &str,
        subfolder: Option<&str>,
        spec: &ProbeSpec,
    ) -> ProbeOutcome {
        let folder = CloudPath::new(dataset, subfolder.unwrap_or_default());
        let listing = match list_cloud(index, dataset, subfolder, spec) {
            Ok(listing) => listing,
            Err(err) => return ProbeOutcome::Errored(format!("{folder}: {err}")),
        };

        let base = normalize(subfolder.unwrap_or_default());
        let top_files: Vec<RemoteFile> = listing
            .iter()
            .filter(|file| normalize(file.subfolder()) == base)
            .filter(|file| {
                spec.file_pattern
                    .as_ref()
                    .map(|pattern| pattern.is_match(file.file_name()))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        let files = match &spec.folder_pattern {
            Some(pattern) => {
                let in_folders: Vec<RemoteFile> = listing
                    .iter()
                    .filter(|file| {
                        child_folder(&base, file.subfolder())
                            .map(|child| pattern.is_match(&child))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect();
                if in_folders.is_empty() {
                    return ProbeOutcome::Missing;
                }
                if spec.file_pattern.is_some() { top_files } else { in_folders }
            }
            None => top_files,
        };

        if files.is_empty() {
            ProbeOutcome::Missing
        } else {
            ProbeOutcome::Found(ResolvedLocation::Cloud { folder, files })
        }
    }
}

impl<C: CloudIndex + ?Sized> LocationProbe for TierProbe<'_, C> {
    fn probe(&self, candidate: &Candidate, spec: &ProbeSpec) -> ProbeOutcome {
        match &candidate.location {
            CandidateLocation::Filesystem(root) => self.probe_filesystem(root, spec),
            CandidateLocation::CloudIndex { dataset, subfolder } => match self.cloud {
                Some(index) => self.probe_cloud(index, dataset, subfolder.as_deref(), spec),
                None => {
                    debug!("cloud index not configured; skipping {}", candidate.location);
                    ProbeOutcome::Missing
                }
            },
        }
    }

    fn subfolders(&self, candidate: &Candidate, folder_pattern: &WildcardPattern) -> Vec<Candidate> {
        let nested = |location| Candidate {
            tier: candidate.tier,
            location,
            log_if_missing: candidate.log_if_missing,
        };
        match &candidate.location {
            CandidateLocation::Filesystem(root) => match fs_util::matching_dirs(root, folder_pattern) {
                Ok(dirs) => dirs
                    .into_iter()
                    .map(|dir| nested(CandidateLocation::Filesystem(dir)))
                    .collect(),
                Err(err) => {
                    debug!(folder = %root, error = %err, "cannot list subfolders");
                    Vec::new()
                }
            },
            CandidateLocation::CloudIndex { dataset, subfolder } => {
                let Some(index) = self.cloud else {
                    return Vec::new();
                };
                let spec = ProbeSpec {
                    file_pattern: None,
                    folder_pattern: Some(folder_pattern.clone()),
                };
                let listing = match list_cloud(index, dataset, subfolder.as_deref(), &spec) {
                    Ok(listing) => listing,
                    Err(err) => {
                        warn!(dataset = %dataset, error = %err, "cloud subfolder listing failed");
                        return Vec::new();
                    }
                };
                let base = normalize(subfolder.as_deref().unwrap_or_default());
                let children: BTreeSet<String> = listing
                    .iter()
                    .filter_map(|file| child_folder(&base, file.subfolder()))
                    .filter(|child| folder_pattern.is_match(child))
                    .collect();
                children
                    .into_iter()
                    .map(|child| {
                        let path = match subfolder.as_deref() {
                            Some(parent) if !parent.is_empty() => format!("{parent}/{child}"),
                            _ => child,
                        };
                        nested(CandidateLocation::CloudIndex {
                            dataset: dataset.clone(),
                            subfolder: Some(path),
                        })
                    })
                    .collect()
            }
        }
    }
}

fn list_cloud<C: CloudIndex + ?Sized>(
    index: &C,
    dataset: &str,
    subfolder: Option<&str>,
    spec: &ProbeSpec,
) -> Result<Vec<RemoteFile>, RetrievalError> {
    let mut query = CloudQuery::dataset(dataset).in_subfolder(subfolder);
    if spec.folder_pattern.is_some() {
        query = query.recursive();
    } else if let Some(pattern) = &spec.file_pattern {
        query = query.matching(pattern.as_str());
    }
    index.find_files(&query)
}

fn normalize(folder: &str) -> String {
    folder.replace('\\', "/").trim_matches('/').to_ascii_lowercase()
}

/// First path component of `folder` below `base`, keeping its original case.
fn child_folder(base: &str, folder: &str) -> Option<String> {
    let folder = folder.replace('\\', "/");
    let folder = folder.trim_matches('/');
    let rest = if base.is_empty() {
        folder
    } else {
        let lower = folder.to_ascii_lowercase();
        if !lower.starts_with(base) || lower.len() == base.len() {
            return None;
        }
        folder.get(base.len()..)?.strip_prefix('/')?
    };
    rest.split('/').next().filter(|child| !child.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use super::*;
    use crate::cloud::{DownloadOutcome, filter_listing};
    use crate::domain::Tier;

    struct ListingIndex {
        files: Vec<RemoteFile>,
    }

    impl CloudIndex for ListingIndex {
        fn find_files(&self, query: &CloudQuery) -> Result<Vec<RemoteFile>, RetrievalError> {
            filter_listing(&self.files, query)
        }

        fn download(
            &self,
            _files: &[RemoteFile],
            _target_dir: &Utf8Path,
        ) -> Result<Vec<DownloadOutcome>, RetrievalError> {
            Ok(Vec::new())
        }
    }

    fn remote(id: u64, relative: &str) -> RemoteFile {
        RemoteFile {
            file_id: id,
            dataset: "QC_Shew_01".to_string(),
            relative_path: relative.to_string(),
            transaction_id: 0,
            size_bytes: 1,
            modified_utc: None,
        }
    }

    fn cloud_candidate(subfolder: Option<&str>) -> Candidate {
        Candidate {
            tier: Tier::CloudArchive,
            location: CandidateLocation::CloudIndex {
                dataset: "QC_Shew_01".to_string(),
                subfolder: subfolder.map(str::to_string),
            },
            log_if_missing: true,
        }
    }

    #[test]
    fn probe_folder_requires_both_patterns() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        fs::write(root.join("QC_Shew_01_ScanStats.txt"), b"x").unwrap();

        let file_only = ProbeSpec::file("*_scanstats.txt").unwrap();
        assert_eq!(
            probe_folder(&root, &file_only).unwrap(),
            MatchResult::Matched {
                files: vec![root.join("QC_Shew_01_ScanStats.txt")]
            }
        );

        let both = ProbeSpec::new(Some("*_ScanStats.txt"), Some("SIC*")).unwrap();
        assert_eq!(probe_folder(&root, &both).unwrap(), MatchResult::NoMatch);
        fs::create_dir_all(root.join("SIC201801")).unwrap();
        assert!(matches!(
            probe_folder(&root, &both).unwrap(),
            MatchResult::Matched { .. }
        ));
    }

    #[test]
    fn filesystem_probe_reports_missing_folder() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("absent")).unwrap();
        let probe: TierProbe<'_, ListingIndex> = TierProbe::new(None, RetryPolicy::new(3, Duration::ZERO));
        let candidate = Candidate {
            tier: Tier::PrimaryStorage,
            location: CandidateLocation::Filesystem(root),
            log_if_missing: true,
        };
        let outcome = probe.probe(&candidate, &ProbeSpec::file("*.raw").unwrap());
        assert_eq!(outcome, ProbeOutcome::Missing);
    }

    #[test]
    fn cloud_probe_scopes_to_subfolder() {
        let index = ListingIndex {
            files: vec![
                remote(1, "QC_Shew_01_dta.zip"),
                remote(2, "SIC2018/QC_Shew_01_ScanStats.txt"),
            ],
        };
        let probe = TierProbe::new(Some(&index), RetryPolicy::default());
        let spec = ProbeSpec::file("QC_Shew_01_dta.zip").unwrap();

        let ProbeOutcome::Found(ResolvedLocation::Cloud { folder, files }) =
            probe.probe(&cloud_candidate(None), &spec)
        else {
            panic!("expected cloud match");
        };
        assert_eq!(folder.to_string(), "cloud-index://QC_Shew_01");
        assert_eq!(files.len(), 1);

        let missing = probe.probe(&cloud_candidate(Some("SIC2018")), &spec);
        assert_eq!(missing, ProbeOutcome::Missing);
    }

    #[test]
    fn cloud_subfolders_match_pattern() {
        let index = ListingIndex {
            files: vec![
                remote(1, "SIC2018/QC_Shew_01_ScanStats.txt"),
                remote(2, "SIC2019/QC_Shew_01_ScanStats.txt"),
                remote(3, "DTA_Gen/QC_Shew_01_dta.zip"),
            ],
        };
        let probe = TierProbe::new(Some(&index), RetryPolicy::default());
        let pattern = WildcardPattern::new("sic*").unwrap();
        let nested = probe.subfolders(&cloud_candidate(None), &pattern);
        let names: Vec<String> = nested.iter().map(|c| c.location.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "cloud-index://QC_Shew_01/SIC2018",
                "cloud-index://QC_Shew_01/SIC2019"
            ]
        );
    }

    #[test]
    fn child_folder_strips_base() {
        assert_eq!(child_folder("", "SIC1/sub"), Some("SIC1".to_string()));
        assert_eq!(child_folder("seq1", "SEQ1/SIC1"), Some("SIC1".to_string()));
        assert_eq!(child_folder("seq1", "SEQ1"), None);
        assert_eq!(child_folder("seq1", "SEQ10/x"), None);
    }
}
