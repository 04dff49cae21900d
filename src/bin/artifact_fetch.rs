use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use artifact_retrieval::archive::ArchiveCodec;
use artifact_retrieval::cloud::HttpCloudIndex;
use artifact_retrieval::config::{ConfigLoader, ResolvedConfig, RetrievalOptions};
use artifact_retrieval::domain::MissSeverity;
use artifact_retrieval::error::RetrievalError;
use artifact_retrieval::fs_util::WildcardPattern;
use artifact_retrieval::output::{
    ArchiveResult, JsonOutput, OutputMode, PackageResult, ResolveResult, RetrieveResult,
    SidecarResult,
};
use artifact_retrieval::params::{JOB_SECTION, JobParams, ParamStore};
use artifact_retrieval::retrieval::{PackageJob, PackageOptions, Retriever, SpectraFormat};
use artifact_retrieval::sidecar::{self, SidecarCheck};

#[derive(Parser)]
#[command(name = "artifact-fetch")]
#[command(about = "Locate and retrieve dataset artifacts across storage tiers")]
#[command(version, author)]
struct Cli {
    /// Print JSON instead of a short summary.
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Report which tier holds a file or folder")]
    Resolve(ResolveArgs),
    #[command(about = "Retrieve files into the working directory")]
    Fetch(FetchArgs),
    #[command(about = "Retrieve concatenated DTA spectra, or mzML/mzXML with --format")]
    Spectra(SpectraArgs),
    #[command(about = "Retrieve the dataset's mzML, preferring the converted-spectra cache")]
    Mzml(JobArgs),
    #[command(about = "Retrieve MASIC results from the newest SIC folder")]
    Masic(JobArgs),
    #[command(about = "Retrieve a whole results folder")]
    Folder(FolderArgs),
    #[command(about = "Retrieve result files for every job of a data package")]
    Package(PackageArgs),
    #[command(about = "Check a zip archive, including CRCs below the size threshold")]
    VerifyZip { path: Utf8PathBuf },
    #[command(about = "Extract a zip archive")]
    Unzip(ExtractArgs),
    #[command(about = "Decompress a .gz file")]
    Gunzip(ExtractArgs),
    #[command(about = "Zip a file or directory")]
    Zip(CompressArgs),
    #[command(about = "Gzip a file")]
    Gzip(CompressArgs),
    #[command(about = "Write or check size/date/hash sidecar files")]
    Sidecar(SidecarArgs),
}

#[derive(Args, Clone)]
struct JobArgs {
    /// JSON job parameter file: {"JobParameters": {"DatasetName": ...}, ...}
    #[arg(long)]
    params: Option<PathBuf>,

    /// Parameter override as `Key=Value` or `Section/Key=Value`.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    #[arg(long)]
    work_dir: Option<Utf8PathBuf>,

    /// Write `_StoragePathInfo.txt` references instead of copying.
    #[arg(long)]
    reference_only: bool,

    #[arg(long)]
    no_unzip: bool,

    #[arg(long)]
    no_cloud: bool,
}

#[derive(Args)]
struct ResolveArgs {
    #[command(flatten)]
    job: JobArgs,

    #[arg(long)]
    file: Option<String>,

    #[arg(long)]
    folder: Option<String>,

    #[arg(long)]
    instrument_data: bool,
}

#[derive(Args)]
struct FetchArgs {
    #[command(flatten)]
    job: JobArgs,

    files: Vec<String>,

    /// Retrieve `<dataset><ext>` as instrument data.
    #[arg(long)]
    instrument_ext: Option<String>,

    #[arg(long, value_enum, default_value = "error")]
    severity: MissSeverity,
}

#[derive(Args)]
struct SpectraArgs {
    #[command(flatten)]
    job: JobArgs,

    #[arg(long, value_enum)]
    format: Option<SpectraFormat>,
}

#[derive(Args)]
struct FolderArgs {
    #[command(flatten)]
    job: JobArgs,

    pattern: String,
}

#[derive(Args)]
struct PackageArgs {
    #[command(flatten)]
    job: JobArgs,

    /// JSON array of package jobs.
    jobs: PathBuf,

    #[arg(long)]
    no_spectra: bool,
}

#[derive(Args)]
struct ExtractArgs {
    path: Utf8PathBuf,

    #[arg(long)]
    target: Option<Utf8PathBuf>,

    /// Only extract entries whose file name matches this wildcard.
    #[arg(long)]
    filter: Option<String>,
}

#[derive(Args)]
struct CompressArgs {
    source: Utf8PathBuf,

    #[arg(long)]
    output: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct SidecarArgs {
    #[command(subcommand)]
    command: SidecarCommand,
}

#[derive(Subcommand)]
enum SidecarCommand {
    Write {
        file: Utf8PathBuf,
        #[arg(long)]
        hash: bool,
    },
    Validate {
        file: Utf8PathBuf,
        #[arg(long)]
        sidecar: Option<Utf8PathBuf>,
        #[arg(long)]
        hash: bool,
        #[arg(long)]
        no_date: bool,
    },
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<RetrievalError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &RetrievalError) -> u8 {
    match error {
        error if error.is_configuration() => 2,
        RetrievalError::CloudHttp(_) | RetrievalError::CloudStatus { .. } => 3,
        RetrievalError::CorruptArchive { .. } | RetrievalError::InvalidSidecar { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let codec = ArchiveCodec::new(config.crc_check_threshold_bytes);

    match cli.command {
        Commands::Resolve(args) => run_resolve(args, &config, mode),
        Commands::Fetch(args) => {
            let FetchArgs {
                job,
                files,
                instrument_ext,
                severity,
            } = args;
            run_retrieval("fetch", &job, &config, mode, |retriever| {
                let mut success = true;
                if let Some(ext) = &instrument_ext {
                    success &= retriever.retrieve_instrument_file(ext)?;
                }
                for file in &files {
                    success &= retriever.retrieve_file(file, severity)?;
                }
                Ok(success)
            })
        }
        Commands::Spectra(args) => {
            let format = args.format;
            run_retrieval("spectra", &args.job, &config, mode, |retriever| match format {
                Some(format) => retriever.retrieve_cached_spectra(format),
                None => retriever.retrieve_concatenated_spectra(),
            })
        }
        Commands::Mzml(job) => run_retrieval("mzml", &job, &config, mode, |retriever| {
            retriever.retrieve_cached_spectra(SpectraFormat::MzML)
        }),
        Commands::Masic(job) => run_retrieval("masic", &job, &config, mode, |retriever| {
            retriever.retrieve_masic_results()
        }),
        Commands::Folder(args) => {
            let pattern = args.pattern;
            run_retrieval("folder", &args.job, &config, mode, |retriever| {
                retriever.retrieve_folder(&pattern)
            })
        }
        Commands::Package(args) => run_package(args, &config, mode),
        Commands::VerifyZip { path } => {
            let verification = codec.verify_zip(&path)?;
            emit(
                &ArchiveResult {
                    operation: "verify-zip".to_string(),
                    archive: path,
                    files: Vec::new(),
                    verification: Some(verification),
                },
                mode,
            )
        }
        Commands::Unzip(args) => {
            let target = extract_target(&args);
            let filter = args
                .filter
                .as_deref()
                .map(WildcardPattern::new)
                .transpose()?;
            let listing = codec.unzip(&args.path, &target, filter.as_ref())?;
            emit(&ArchiveResult::extracted("unzip", args.path, &listing), mode)
        }
        Commands::Gunzip(args) => {
            let target = extract_target(&args);
            let listing = codec.gunzip(&args.path, &target)?;
            emit(&ArchiveResult::extracted("gunzip", args.path, &listing), mode)
        }
        Commands::Zip(args) => {
            let output = args
                .output
                .unwrap_or_else(|| Utf8PathBuf::from(format!("{}.zip", args.source)));
            if args.source.as_std_path().is_dir() {
                codec.zip_directory(&args.source, &output)?;
            } else {
                codec.zip_file(&args.source, &output)?;
            }
            emit(
                &ArchiveResult {
                    operation: "zip".to_string(),
                    archive: output,
                    files: vec![args.source],
                    verification: None,
                },
                mode,
            )
        }
        Commands::Gzip(args) => {
            let output = codec.gzip_file(&args.source, args.output.as_deref())?;
            emit(
                &ArchiveResult {
                    operation: "gzip".to_string(),
                    archive: output,
                    files: vec![args.source],
                    verification: None,
                },
                mode,
            )
        }
        Commands::Sidecar(args) => run_sidecar(args.command, mode),
    }
}

fn run_resolve(args: ResolveArgs, config: &ResolvedConfig, mode: OutputMode) -> miette::Result<()> {
    let params = load_params(&args.job)?;
    let options = retrieval_options(&args.job, config);
    let cloud = cloud_index(config, &options)?;
    let work_dir = work_dir(&args.job, config);
    let retriever = Retriever::new(params, cloud.as_ref(), options, work_dir);

    let resolution = retriever.find_artifact_location(
        args.file.as_deref(),
        args.folder.as_deref(),
        args.instrument_data,
    )?;
    emit(&ResolveResult::from(&resolution), mode)
}

fn run_retrieval<F>(
    operation: &str,
    job: &JobArgs,
    config: &ResolvedConfig,
    mode: OutputMode,
    retrieve: F,
) -> miette::Result<()>
where
    F: FnOnce(&mut Retriever<'_, JobParams, HttpCloudIndex>) -> Result<bool, RetrievalError>,
{
    let params = load_params(job)?;
    let options = retrieval_options(job, config);
    let cloud = cloud_index(config, &options)?;
    let mut retriever = Retriever::new(params, cloud.as_ref(), options, work_dir(job, config));

    let retrieved = retrieve(&mut retriever)?;
    let queue = retriever.process_download_queue()?;
    let success = retrieved && queue.drain.is_success();
    emit(
        &RetrieveResult {
            operation: operation.to_string(),
            success,
            work_dir: retriever.work_dir().to_path_buf(),
            skipped_as_results: retriever.skip_list().files().map(str::to_string).collect(),
            queue,
        },
        mode,
    )?;
    if !success {
        return Err(miette::Report::msg(format!("{operation} did not retrieve every required file")));
    }
    Ok(())
}

fn run_package(args: PackageArgs, config: &ResolvedConfig, mode: OutputMode) -> miette::Result<()> {
    let content = fs::read_to_string(&args.jobs).into_diagnostic()?;
    let jobs: Vec<PackageJob> = serde_json::from_str(&content)
        .map_err(|err| RetrievalError::ConfigParse(err.to_string()))?;
    let package = PackageOptions {
        retrieve_spectra: !args.no_spectra,
        ..PackageOptions::default()
    };

    let params = load_params(&args.job)?;
    let options = retrieval_options(&args.job, config);
    let cloud = cloud_index(config, &options)?;
    let mut retriever = Retriever::new(params, cloud.as_ref(), options, work_dir(&args.job, config));

    let report = retriever.retrieve_data_package(&jobs, &package)?;
    let queue = retriever.process_download_queue()?;
    let success = report.is_success() && queue.drain.is_success();
    emit(&PackageResult { report, queue }, mode)?;
    if !success {
        return Err(miette::Report::msg("one or more package jobs failed"));
    }
    Ok(())
}

fn run_sidecar(command: SidecarCommand, mode: OutputMode) -> miette::Result<()> {
    match command {
        SidecarCommand::Write { file, hash } => {
            let written = sidecar::write_sidecar(&file, hash)?;
            let validation = sidecar::validate(&file, Some(written.as_path()), SidecarCheck::default());
            emit(&SidecarResult::new(file, written, &validation), mode)
        }
        SidecarCommand::Validate {
            file,
            sidecar: sidecar_file,
            hash,
            no_date,
        } => {
            let sidecar_file = sidecar_file.unwrap_or_else(|| sidecar::sidecar_path(&file));
            let check = SidecarCheck {
                check_date: !no_date,
                compute_hash: hash,
            };
            let validation = sidecar::validate(&file, Some(sidecar_file.as_path()), check);
            let valid = validation.is_valid();
            emit(&SidecarResult::new(file, sidecar_file, &validation), mode)?;
            if !valid {
                return Err(miette::Report::msg("sidecar does not match data file"));
            }
            Ok(())
        }
    }
}

fn emit<T: serde::Serialize + artifact_retrieval::output::Summary>(
    value: &T,
    mode: OutputMode,
) -> miette::Result<()> {
    JsonOutput::emit(value, mode).into_diagnostic()
}

fn load_params(job: &JobArgs) -> Result<JobParams, RetrievalError> {
    let mut params = match &job.params {
        Some(path) => JobParams::load(path)?,
        None => JobParams::new(),
    };
    for entry in &job.overrides {
        let (target, value) = entry.split_once('=').ok_or_else(|| RetrievalError::InvalidParameter {
            key: entry.clone(),
            message: "expected KEY=VALUE".to_string(),
        })?;
        let (section, key) = target.split_once('/').unwrap_or((JOB_SECTION, target));
        params.set_param(section.trim(), key.trim(), value.trim());
    }
    Ok(params)
}

fn retrieval_options(job: &JobArgs, config: &ResolvedConfig) -> RetrievalOptions {
    let mut options = RetrievalOptions::from(config);
    options.reference_only = job.reference_only;
    options.unzip_on_retrieve = !job.no_unzip;
    if job.no_cloud {
        options.search_cloud_archive = false;
    }
    options
}

fn cloud_index(
    config: &ResolvedConfig,
    options: &RetrievalOptions,
) -> Result<Option<HttpCloudIndex>, RetrievalError> {
    match &config.cloud_index {
        Some(cloud) if options.search_cloud_archive => HttpCloudIndex::new(cloud).map(Some),
        _ => Ok(None),
    }
}

fn work_dir(job: &JobArgs, config: &ResolvedConfig) -> Utf8PathBuf {
    job.work_dir
        .clone()
        .unwrap_or_else(|| config.work_dir.clone())
}

/// Next to the archive unless `--target` is given.
fn extract_target(args: &ExtractArgs) -> Utf8PathBuf {
    match &args.target {
        Some(target) => target.clone(),
        None => args
            .path
            .parent()
            .map(|parent| parent.to_path_buf())
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8PathBuf::from(".")),
    }
}
