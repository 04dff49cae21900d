use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use super::Retriever;
use crate::cloud::{CloudIndex, CloudQuery, RemoteFile};
use crate::domain::{CloudPath, MissSeverity, Resolution, ResolvedFile, ResolvedLocation, Tier};
use crate::error::RetrievalError;
use crate::fs_util::{self, WildcardPattern};
use crate::params::ParamStore;

pub const SIC_FOLDER_PATTERN: &str = "SIC*";

/// Where the chosen MASIC results folder lives.
enum SicFolder {
    Local { tier: Tier, folder: Utf8PathBuf },
    Cloud { files: Vec<RemoteFile> },
}

impl<'c, P: ParamStore, C: CloudIndex + ?Sized> Retriever<'c, P, C> {
    /// Retrieves MASIC results from the newest `SIC*` folder, judged by the
    /// modification time of its `_ScanStats.txt`.
    pub fn retrieve_masic_results(&mut self) -> Result<bool, RetrievalError> {
        let dataset = self.dataset()?;
        let scan_stats = format!("{}_ScanStats.txt", dataset.name());

        let resolution =
            self.find_artifact_location(Some(scan_stats.as_str()), Some(SIC_FOLDER_PATTERN), false)?;
        let Resolution::Found(resolved) = resolution else {
            error!("no {SIC_FOLDER_PATTERN} folder with {scan_stats} found for {dataset}");
            return Ok(false);
        };

        let Some(folder) = self.newest_sic_folder(resolved.tier, &resolved.location, &scan_stats)?
        else {
            error!("{scan_stats} vanished from {}", resolved.location.path_string());
            return Ok(false);
        };

        let required = [
            scan_stats.clone(),
            format!("{}_SICStats.txt", dataset.name()),
        ];
        let optional = [
            format!("{}_ScanStatsEx.txt", dataset.name()),
            format!("{}_ReporterIons.txt", dataset.name()),
        ];

        let mut success = true;
        for name in &required {
            success &= self.fetch_from_sic(&folder, name, MissSeverity::Error)?;
        }
        for name in &optional {
            self.fetch_from_sic(&folder, name, MissSeverity::Debug)?;
        }
        Ok(success)
    }

    fn newest_sic_folder(
        &self,
        tier: Tier,
        location: &ResolvedLocation,
        scan_stats: &str,
    ) -> Result<Option<SicFolder>, RetrievalError> {
        let pattern = WildcardPattern::new(SIC_FOLDER_PATTERN)?;
        match location {
            ResolvedLocation::Filesystem { folder, .. } => {
                let root = sic_parent(folder.file_name(), &pattern)
                    .then(|| folder.parent().map(|parent| parent.to_path_buf()))
                    .flatten()
                    .unwrap_or_else(|| folder.clone());
                let dirs = fs_util::matching_dirs(&root, &pattern)
                    .map_err(|err| RetrievalError::Filesystem(format!("list {root}: {err}")))?;

                let mut newest: Option<(DateTime<Utc>, Utf8PathBuf)> = None;
                for dir in dirs {
                    let stats = dir.join(scan_stats);
                    if !stats.as_std_path().is_file() {
                        continue;
                    }
                    let modified = fs_util::modified_utc(&stats)?;
                    debug!("{stats} modified {modified}");
                    if newest.as_ref().map(|(best, _)| modified >= *best).unwrap_or(true) {
                        newest = Some((modified, dir));
                    }
                }
                Ok(newest.map(|(_, folder)| {
                    info!("using MASIC results in {folder}");
                    SicFolder::Local { tier, folder }
                }))
            }
            ResolvedLocation::Cloud { folder, .. } => {
                let Some(cloud) = self.cloud else {
                    return Err(RetrievalError::CloudNotConfigured);
                };
                let parent = if sic_parent(folder.file_name(), &pattern) {
                    cloud_parent(folder)
                } else {
                    folder.clone()
                };
                let subfolder = Some(parent.relative.as_str()).filter(|value| !value.is_empty());
                let listing = cloud.find_files(
                    &CloudQuery::dataset(&parent.dataset)
                        .in_subfolder(subfolder)
                        .recursive(),
                )?;

                let newest = listing
                    .iter()
                    .filter(|file| file.file_name().eq_ignore_ascii_case(scan_stats))
                    .filter(|file| {
                        let sub = file.subfolder().replace('\\', "/");
                        let name = sub.rsplit('/').next().unwrap_or(&sub).to_string();
                        pattern.is_match(&name)
                    })
                    .max_by_key(|file| file.modified_utc);
                let Some(newest) = newest else {
                    return Ok(None);
                };
                let chosen = newest.subfolder().to_string();
                info!("using MASIC results in {}", CloudPath::new(&parent.dataset, &chosen));
                let files = listing
                    .into_iter()
                    .filter(|file| file.subfolder() == chosen)
                    .collect();
                Ok(Some(SicFolder::Cloud { files }))
            }
        }
    }

    fn fetch_from_sic(
        &mut self,
        folder: &SicFolder,
        name: &str,
        severity: MissSeverity,
    ) -> Result<bool, RetrievalError> {
        let file = match folder {
            SicFolder::Local { tier, folder } => ResolvedFile::Local {
                tier: *tier,
                path: folder.join(name),
            },
            SicFolder::Cloud { files } => {
                let Some(file) = files
                    .iter()
                    .find(|file| file.file_name().eq_ignore_ascii_case(name))
                else {
                    severity.log(&format!("{name} not found in cloud MASIC folder"));
                    return Ok(false);
                };
                ResolvedFile::Cloud {
                    path: CloudPath::for_file(file),
                    file: file.clone(),
                }
            }
        };
        self.fetch(&file, name, severity)
    }
}

fn sic_parent(folder_name: Option<&str>, pattern: &WildcardPattern) -> bool {
    folder_name.map(|name| pattern.is_match(name)).unwrap_or(false)
}

fn cloud_parent(folder: &CloudPath) -> CloudPath {
    let parent = match folder.relative.rfind('/') {
        Some(idx) => &folder.relative[..idx],
        None => "",
    };
    CloudPath::new(folder.dataset.clone(), parent)
}
