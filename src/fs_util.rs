use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use filetime::FileTime;
use regex::Regex;
use tracing::debug;

use crate::config::RetryPolicy;
use crate::error::RetrievalError;

/// A Windows-style file name wildcard (`*` and `?`), matched case-insensitively
/// against a single path component.
#[derive(Debug, Clone)]
pub struct WildcardPattern {
    raw: String,
    regex: Regex,
}

impl WildcardPattern {
    pub fn new(pattern: &str) -> Result<Self, RetrievalError> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(RetrievalError::InvalidPattern(pattern.to_string()));
        }
        let mut expr = String::with_capacity(trimmed.len() + 8);
        expr.push_str("(?i)^");
        for ch in trimmed.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');
        let regex =
            Regex::new(&expr).map_err(|err| RetrievalError::InvalidPattern(err.to_string()))?;
        Ok(Self {
            raw: trimmed.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_wildcards(&self) -> bool {
        self.raw.contains(['*', '?'])
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

impl std::fmt::Display for WildcardPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

pub fn utf8_path(path: PathBuf) -> Result<Utf8PathBuf, RetrievalError> {
    Utf8PathBuf::from_path_buf(path)
        .map_err(|path| RetrievalError::InvalidPath(path.display().to_string()))
}

pub fn file_name(path: &Utf8Path) -> Result<&str, RetrievalError> {
    path.file_name()
        .ok_or_else(|| RetrievalError::InvalidPath(path.to_string()))
}

pub fn parent_dir(path: &Utf8Path) -> Result<&Utf8Path, RetrievalError> {
    path.parent()
        .filter(|parent| !parent.as_str().is_empty())
        .ok_or_else(|| RetrievalError::NoParentDirectory(path.to_string()))
}

/// Top-level files in `dir` whose names match `pattern`, sorted by name.
pub fn matching_files(dir: &Utf8Path, pattern: &WildcardPattern) -> io::Result<Vec<Utf8PathBuf>> {
    matching_entries(dir, pattern, false)
}

/// Top-level directories in `dir` whose names match `pattern`, sorted by name.
pub fn matching_dirs(dir: &Utf8Path, pattern: &WildcardPattern) -> io::Result<Vec<Utf8PathBuf>> {
    matching_entries(dir, pattern, true)
}

fn matching_entries(
    dir: &Utf8Path,
    pattern: &WildcardPattern,
    want_dirs: bool,
) -> io::Result<Vec<Utf8PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir.as_std_path())? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() != want_dirs {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if pattern.is_match(name) {
            found.push(dir.join(name));
        }
    }
    found.sort();
    Ok(found)
}

pub fn modified_utc(path: &Utf8Path) -> Result<DateTime<Utc>, RetrievalError> {
    let modified = fs::metadata(path.as_std_path())
        .and_then(|meta| meta.modified())
        .map_err(|err| RetrievalError::Filesystem(format!("stat {path}: {err}")))?;
    Ok(DateTime::<Utc>::from(modified))
}

pub fn set_modified_utc(path: &Utf8Path, when: DateTime<Utc>) -> Result<(), RetrievalError> {
    let time = FileTime::from_unix_time(when.timestamp(), when.timestamp_subsec_nanos());
    filetime::set_file_mtime(path.as_std_path(), time)
        .map_err(|err| RetrievalError::Filesystem(format!("set mtime {path}: {err}")))
}

pub fn remove_file_if_exists(path: &Utf8Path) -> Result<bool, RetrievalError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(RetrievalError::Filesystem(format!("remove {path}: {err}"))),
    }
}

/// Runs `op` until it succeeds or the policy's attempts are used up, sleeping
/// the hold-off between attempts.
pub fn with_retry<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && is_retryable_io(&err) => {
                debug!(attempt, attempts, error = %err, "{what} failed; retrying");
                thread::sleep(policy.hold_off());
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Existence check that tolerates transient share errors. "Not found" is a
/// definitive answer; any other I/O error is retried.
pub fn exists_with_retry(path: &Utf8Path, policy: &RetryPolicy) -> io::Result<bool> {
    with_retry(policy, &format!("stat {path}"), || {
        match fs::metadata(path.as_std_path()) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    })
}

fn is_retryable_io(err: &io::Error) -> bool {
    !matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput
    )
}

pub fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, RetrievalError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    items.sort();
    Ok(items)
}
