use camino::Utf8Path;
use tracing::{debug, error, info, warn};

use crate::candidates::{self, CandidateRequest};
use crate::cloud::DownloadQueue;
use crate::config::RetrievalOptions;
use crate::domain::{
    Candidate, CloudPath, DatasetIdentity, MissSeverity, Resolution, Resolved, ResolvedFile,
    ResolvedLocation,
};
use crate::error::RetrievalError;
use crate::params::ParamStore;
use crate::probe::{LocationProbe, ProbeOutcome, ProbeSpec};

/// Probes `candidates` in order and returns the first match. A candidate that
/// misses is retried one folder level deeper when `spec` names both a file and
/// a folder.
pub fn resolve_in_order<L: LocationProbe + ?Sized>(
    candidates: &[Candidate],
    probe: &L,
    spec: &ProbeSpec,
) -> Option<Resolved> {
    for candidate in candidates {
        if let Some(location) = probe_one(probe, candidate, spec) {
            return Some(Resolved {
                tier: candidate.tier,
                location,
            });
        }

        if let (true, Some(folder_pattern)) = (spec.allows_nested_search(), &spec.folder_pattern) {
            let file_only = spec.file_only();
            for nested in probe.subfolders(candidate, folder_pattern) {
                if let Some(location) = probe_one(probe, &nested, &file_only) {
                    return Some(Resolved {
                        tier: nested.tier,
                        location,
                    });
                }
            }
        }
    }
    None
}

fn probe_one<L: LocationProbe + ?Sized>(
    probe: &L,
    candidate: &Candidate,
    spec: &ProbeSpec,
) -> Option<ResolvedLocation> {
    match probe.probe(candidate, spec) {
        ProbeOutcome::Found(location) => Some(location),
        ProbeOutcome::Missing => {
            if candidate.log_if_missing {
                debug!(tier = %candidate.tier, "not found in {}", candidate.location);
            }
            None
        }
        ProbeOutcome::Errored(message) => {
            warn!(tier = %candidate.tier, "probe failed, treating as not found: {message}");
            None
        }
    }
}

pub struct Resolver<'a, P: ParamStore + ?Sized, L: LocationProbe + ?Sized> {
    params: &'a P,
    probe: &'a L,
    options: &'a RetrievalOptions,
}

impl<'a, P: ParamStore + ?Sized, L: LocationProbe + ?Sized> Resolver<'a, P, L> {
    pub fn new(params: &'a P, probe: &'a L, options: &'a RetrievalOptions) -> Self {
        Self {
            params,
            probe,
            options,
        }
    }

    pub fn request(&self, want_instrument_data: bool) -> CandidateRequest {
        CandidateRequest {
            want_instrument_data,
            search_cloud: self.options.search_cloud_archive,
            long_term_reachable: self.options.search_long_term_archive,
        }
    }

    pub fn candidates(&self, want_instrument_data: bool) -> Result<Vec<Candidate>, RetrievalError> {
        let dataset = DatasetIdentity::from_params(self.params)?;
        candidates::build_candidates(&dataset, self.params, &self.request(want_instrument_data))
    }

    /// Finds the first location holding a file matching `file_pattern` and/or a
    /// subfolder matching `folder_pattern`.
    pub fn find_artifact_location(
        &self,
        file_pattern: Option<&str>,
        folder_pattern: Option<&str>,
        want_instrument_data: bool,
    ) -> Result<Resolution, RetrievalError> {
        let spec = ProbeSpec::new(file_pattern, folder_pattern)?;
        let what = describe(&spec);
        let resolution = self.locate(&spec, want_instrument_data)?;

        if let Resolution::NotFound { default_path, .. } = &resolution {
            if self.request(want_instrument_data).skips_archive_tier() {
                warn!("{what} not found; archive tiers were not searched, defaulting to {default_path}");
            } else {
                error!("{what} not found in any storage tier; defaulting to {default_path}");
            }
        }
        Ok(resolution)
    }

    /// Resolves one named file. A cloud hit is appended to `queue` for
    /// download into `target_dir`.
    pub fn find_data_file(
        &self,
        file_name: &str,
        want_instrument_data: bool,
        queue: Option<&mut DownloadQueue>,
        target_dir: &Utf8Path,
        severity: MissSeverity,
    ) -> Result<Option<ResolvedFile>, RetrievalError> {
        let spec = ProbeSpec::file(file_name)?;
        let Some(resolved) = self.locate(&spec, want_instrument_data)?.found() else {
            severity.log(&format!("data file not found: {file_name}"));
            return Ok(None);
        };

        let file = match resolved.location {
            ResolvedLocation::Filesystem {
                folder,
                matched_files,
            } => {
                let path = pick_by_name(matched_files, file_name, |path| path.file_name())
                    .unwrap_or_else(|| folder.join(file_name));
                ResolvedFile::Local {
                    tier: resolved.tier,
                    path,
                }
            }
            ResolvedLocation::Cloud { folder, files } => {
                let Some(file) = pick_by_name(files, file_name, |file| Some(file.file_name()))
                else {
                    severity.log(&format!("cloud listing for {folder} lost {file_name}"));
                    return Ok(None);
                };
                if let Some(queue) = queue {
                    queue.enqueue(file.clone(), target_dir);
                }
                ResolvedFile::Cloud {
                    path: CloudPath::for_file(&file),
                    file,
                }
            }
        };
        debug!(tier = %file.tier(), "resolved {file_name} to {}", file.path_string());
        Ok(Some(file))
    }

    fn locate(&self, spec: &ProbeSpec, want_instrument_data: bool) -> Result<Resolution, RetrievalError> {
        let dataset = DatasetIdentity::from_params(self.params)?;
        let request = self.request(want_instrument_data);
        let candidates = candidates::build_candidates(&dataset, self.params, &request)?;

        match resolve_in_order(&candidates, self.probe, spec) {
            Some(resolved) => {
                info!(tier = %resolved.tier, "found {} at {}", describe(spec), resolved.location.path_string());
                Ok(Resolution::Found(resolved))
            }
            None => Ok(Resolution::NotFound {
                default_path: candidates::default_storage_path(&dataset, self.params),
                reason: format!(
                    "{} not found in {} candidate locations for {dataset}",
                    describe(spec),
                    candidates.len()
                ),
            }),
        }
    }
}

/// Exact (case-insensitive) name first, then the first wildcard match.
fn pick_by_name<T, F>(items: Vec<T>, name: &str, name_of: F) -> Option<T>
where
    F: Fn(&T) -> Option<&str>,
{
    let exact = items
        .iter()
        .position(|item| name_of(item).map(|n| n.eq_ignore_ascii_case(name)).unwrap_or(false));
    let index = exact.unwrap_or(0);
    items.into_iter().nth(index)
}

fn describe(spec: &ProbeSpec) -> String {
    match (&spec.file_pattern, &spec.folder_pattern) {
        (Some(file), Some(folder)) => format!("{file} (in {folder})"),
        (Some(file), None) => file.to_string(),
        (None, Some(folder)) => format!("folder {folder}"),
        (None, None) => "dataset folder".to_string(),
    }
}
