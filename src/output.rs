use std::io::{self, Write};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::archive::{ExtractListing, ZipVerification};
use crate::domain::{Resolution, ResolvedLocation, Tier};
use crate::retrieval::{DataPackageReport, QueueReport};
use crate::sidecar::SidecarValidation;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveResult {
    pub found: bool,
    pub tier: Option<Tier>,
    pub path: String,
    pub files: Vec<String>,
    pub reason: Option<String>,
}

impl From<&Resolution> for ResolveResult {
    fn from(resolution: &Resolution) -> Self {
        let (tier, files) = match resolution {
            Resolution::Found(resolved) => {
                let files = match &resolved.location {
                    ResolvedLocation::Filesystem { matched_files, .. } => {
                        matched_files.iter().map(ToString::to_string).collect()
                    }
                    ResolvedLocation::Cloud { files, .. } => {
                        files.iter().map(|file| file.relative_path.clone()).collect()
                    }
                };
                (Some(resolved.tier), files)
            }
            Resolution::NotFound { .. } => (None, Vec::new()),
        };
        Self {
            found: resolution.is_found(),
            tier,
            path: resolution.path(),
            files,
            reason: resolution.reason().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrieveResult {
    pub operation: String,
    pub success: bool,
    pub work_dir: Utf8PathBuf,
    pub skipped_as_results: Vec<String>,
    pub queue: QueueReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageResult {
    #[serde(flatten)]
    pub report: DataPackageReport,
    pub queue: QueueReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveResult {
    pub operation: String,
    pub archive: Utf8PathBuf,
    pub files: Vec<Utf8PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<ZipVerification>,
}

impl ArchiveResult {
    pub fn extracted(operation: &str, archive: Utf8PathBuf, listing: &ExtractListing) -> Self {
        Self {
            operation: operation.to_string(),
            archive,
            files: listing.paths().map(|path| path.to_path_buf()).collect(),
            verification: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SidecarResult {
    pub data_file: Utf8PathBuf,
    pub sidecar: Utf8PathBuf,
    pub valid: bool,
    pub message: Option<String>,
}

impl SidecarResult {
    pub fn new(data_file: Utf8PathBuf, sidecar: Utf8PathBuf, validation: &SidecarValidation) -> Self {
        Self {
            data_file,
            sidecar,
            valid: validation.is_valid(),
            message: validation.message().map(str::to_string),
        }
    }
}

/// Human-readable rendering used in interactive mode.
pub trait Summary {
    fn summary(&self) -> Vec<String>;
}

impl Summary for ResolveResult {
    fn summary(&self) -> Vec<String> {
        let mut lines = match (self.found, self.tier) {
            (true, Some(tier)) => vec![format!("found in {tier}: {}", self.path)],
            _ => vec![format!(
                "not found ({}); default {}",
                self.reason.as_deref().unwrap_or("no candidate matched"),
                self.path
            )],
        };
        lines.extend(self.files.iter().map(|file| format!("  {file}")));
        lines
    }
}

impl Summary for RetrieveResult {
    fn summary(&self) -> Vec<String> {
        let status = if self.success { "ok" } else { "FAILED" };
        let mut lines = vec![format!("{}: {status} ({})", self.operation, self.work_dir)];
        lines.extend(self.skipped_as_results.iter().map(|file| format!("  {file}")));
        lines.extend(queue_lines(&self.queue));
        lines
    }
}

impl Summary for PackageResult {
    fn summary(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for job in &self.report.jobs {
            let status = if job.success { "ok" } else { "FAILED" };
            lines.push(format!("job {} ({}): {status}", job.job, job.dataset));
            lines.extend(job.files.iter().map(|file| format!("  {file}")));
        }
        lines.extend(queue_lines(&self.queue));
        lines
    }
}

impl Summary for ArchiveResult {
    fn summary(&self) -> Vec<String> {
        let mut lines = vec![format!("{} {}", self.operation, self.archive)];
        if let Some(verification) = &self.verification {
            let depth = if verification.full_check {
                "full CRC check"
            } else {
                "structure only"
            };
            lines.push(format!("  {} entries, {depth}", verification.entries));
        }
        lines.extend(self.files.iter().map(|file| format!("  {file}")));
        lines
    }
}

impl Summary for SidecarResult {
    fn summary(&self) -> Vec<String> {
        match &self.message {
            None if self.valid => vec![format!("{} matches {}", self.data_file, self.sidecar)],
            message => vec![format!(
                "{} does not match {}: {}",
                self.data_file,
                self.sidecar,
                message.as_deref().unwrap_or("invalid")
            )],
        }
    }
}

fn queue_lines(queue: &QueueReport) -> Vec<String> {
    let mut lines = Vec::new();
    if !queue.drain.downloaded.is_empty() {
        lines.push(format!("downloaded {} file(s)", queue.drain.downloaded.len()));
    }
    lines.extend(
        queue
            .drain
            .failed
            .iter()
            .map(|failure| format!("download failed: {failure}")),
    );
    if !queue.extracted.is_empty() {
        lines.push(format!("extracted {} file(s)", queue.extracted.len()));
    }
    lines
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn emit<T: Serialize + Summary>(value: &T, mode: OutputMode) -> io::Result<()> {
        match mode {
            OutputMode::NonInteractive => Self::print_json(value),
            OutputMode::Interactive => {
                let mut stdout = io::stdout();
                for line in value.summary() {
                    writeln!(stdout, "{line}")?;
                }
                Ok(())
            }
        }
    }

    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Resolved;

    #[test]
    fn resolve_result_lists_matched_files() {
        let resolution = Resolution::Found(Resolved {
            tier: Tier::PrimaryStorage,
            location: ResolvedLocation::Filesystem {
                folder: Utf8PathBuf::from("/storage/QC_Shew_01"),
                matched_files: vec![Utf8PathBuf::from("/storage/QC_Shew_01/QC_Shew_01.raw")],
            },
        });
        let result = ResolveResult::from(&resolution);
        assert!(result.found);
        assert_eq!(result.files, vec!["/storage/QC_Shew_01/QC_Shew_01.raw"]);
        assert_eq!(result.summary()[0], "found in storage: /storage/QC_Shew_01");

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["tier"], "primary_storage");
    }

    #[test]
    fn not_found_keeps_default_path_and_reason() {
        let resolution = Resolution::NotFound {
            default_path: Utf8PathBuf::from("/storage/QC_Shew_01"),
            reason: "no tier holds QC_Shew_01.raw".to_string(),
        };
        let result = ResolveResult::from(&resolution);
        assert!(!result.found);
        assert_eq!(result.path, "/storage/QC_Shew_01");
        assert!(result.summary()[0].contains("no tier holds"));
    }
}
