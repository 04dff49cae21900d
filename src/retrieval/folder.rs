use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use tracing::{error, info, warn};

use super::Retriever;
use crate::cloud::{CloudIndex, RemoteFile};
use crate::domain::{Resolution, ResolvedLocation};
use crate::error::RetrievalError;
use crate::fs_util::{self, WildcardPattern};
use crate::params::ParamStore;
use crate::store;

impl<'c, P: ParamStore, C: CloudIndex + ?Sized> Retriever<'c, P, C> {
    /// Retrieves a whole results folder matching `folder_pattern` into
    /// `<work>/<folder name>`. When several folders match, the most recently
    /// modified one is used.
    pub fn retrieve_folder(&mut self, folder_pattern: &str) -> Result<bool, RetrievalError> {
        let pattern = WildcardPattern::new(folder_pattern)?;
        let Resolution::Found(resolved) =
            self.find_artifact_location(None, Some(folder_pattern), false)?
        else {
            return Ok(false);
        };

        match resolved.location {
            ResolvedLocation::Filesystem { folder, .. } => {
                let dirs = fs_util::matching_dirs(&folder, &pattern)
                    .map_err(|err| RetrievalError::Filesystem(format!("list {folder}: {err}")))?;
                let mut newest = None;
                for dir in dirs {
                    let modified = fs_util::modified_utc(&dir)?;
                    if newest.as_ref().map(|(best, _)| modified >= *best).unwrap_or(true) {
                        newest = Some((modified, dir));
                    }
                }
                let Some((_, source)) = newest else {
                    return Ok(false);
                };
                self.copy_folder(&source)
            }
            ResolvedLocation::Cloud { folder, files } => {
                let base = folder.relative.clone();
                let mut by_child: BTreeMap<String, Vec<RemoteFile>> = BTreeMap::new();
                for file in files {
                    let Some(relative) = relative_to(&base, file.subfolder()) else {
                        continue;
                    };
                    let child = relative.split('/').next().unwrap_or_default().to_string();
                    if pattern.is_match(&child) {
                        by_child.entry(child).or_default().push(file);
                    }
                }
                let Some((child, files)) = by_child
                    .into_iter()
                    .max_by_key(|(_, files)| files.iter().filter_map(|file| file.modified_utc).max())
                else {
                    return Ok(false);
                };

                if self.options.reference_only {
                    let remote = folder.join(&child).to_string();
                    self.work.write_reference(&child, &remote)?;
                    self.register(&child);
                    return Ok(true);
                }

                let cloud_base = if base.is_empty() {
                    child.clone()
                } else {
                    format!("{base}/{child}")
                };
                let mut queued = 0;
                for file in files {
                    let nested = relative_to(&cloud_base, file.subfolder()).unwrap_or_default();
                    let mut target = self.work.path_for(&child);
                    if !nested.is_empty() {
                        target.push(&nested);
                    }
                    let arrives_at = target.join(file.file_name());
                    if self.queue.enqueue(file, &target).is_queued() {
                        // Registered as an input once the download is confirmed.
                        self.pending_register.insert(arrives_at);
                        queued += 1;
                    }
                }
                info!("queued {queued} file(s) from {}", folder.join(&child));
                Ok(queued > 0)
            }
        }
    }

    fn copy_folder(&mut self, source: &camino::Utf8Path) -> Result<bool, RetrievalError> {
        let name = fs_util::file_name(source)?.to_string();
        self.work.ensure()?;
        if self.options.reference_only {
            self.work.write_reference(&name, source.as_str())?;
            self.register(&name);
            return Ok(true);
        }

        let target: Utf8PathBuf = self.work.path_for(&name);
        match store::copy_dir_recursive(source, &target, &self.options.retry) {
            Ok(copied) => {
                for path in &copied {
                    if let Some(file_name) = path.file_name() {
                        let file_name = file_name.to_string();
                        self.register(&file_name);
                    }
                }
                info!("copied {} file(s) from {source}", copied.len());
                if copied.is_empty() {
                    warn!("{source} is empty");
                }
                Ok(true)
            }
            Err(err) => {
                error!("cannot copy folder {source}: {err}");
                Ok(false)
            }
        }
    }
}

/// `path` below `base` (both `/`-separated, compared case-insensitively);
/// `Some("")` when they are equal.
fn relative_to(base: &str, path: &str) -> Option<String> {
    let path = path.replace('\\', "/");
    let path = path.trim_matches('/');
    let base = base.trim_matches('/');
    if base.is_empty() {
        return Some(path.to_string());
    }
    if path.eq_ignore_ascii_case(base) {
        return Some(String::new());
    }
    let head = path.get(..base.len())?;
    if !head.eq_ignore_ascii_case(base) {
        return None;
    }
    path[base.len()..].strip_prefix('/').map(str::to_string)
}
