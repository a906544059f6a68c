use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_sc_prep::acquire::repair_options;
use kira_sc_prep::app::{self, App};
use kira_sc_prep::config::{Config, ConfigLoader, PipelineConfig};
use kira_sc_prep::domain::{RunId, Stage};
use kira_sc_prep::error::KiraError;
use kira_sc_prep::output::{self, ConsoleProgress, JsonOutput, OutputMode};
use kira_sc_prep::tools::{
    AcquisitionClient, QuantClient, QuantRequest, SystemAcquisitionClient, SystemQuantClient,
};

/// Exit code for a pass that finished but left runs failed or samples blocked.
const EXIT_INCOMPLETE: u8 = 4;

#[derive(Parser)]
#[command(name = "kira-scprep")]
#[command(about = "Resumable single-cell FASTQ preparation: acquire runs, organize per sample, quantify, clean up")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the full pipeline over the manifest")]
    Run(RunArgs),
    #[command(about = "Show ledger progress without doing any work")]
    Status(CommonArgs),
    #[command(about = "Remove completion markers so a stage runs again")]
    Reset(ResetArgs),
    #[command(about = "Check (and optionally repair) one FASTQ file")]
    Validate(ValidateArgs),
}

#[derive(Args, Clone, Default)]
struct CommonArgs {
    #[arg(long)]
    manifest: Option<PathBuf>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    base_dir: Option<PathBuf>,

    #[arg(long)]
    reference: Option<PathBuf>,

    #[arg(long)]
    jobs: Option<usize>,

    #[arg(long)]
    threads: Option<usize>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long)]
    keep_inputs: bool,

    #[arg(long)]
    recover_technical_reads: bool,

    #[arg(long)]
    no_repair: bool,

    /// Per-run download limit in seconds.
    #[arg(long)]
    download_timeout: Option<u64>,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct ResetArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long, value_enum)]
    stage: Stage,

    /// Run accession or sample key; all entities when omitted.
    #[arg(long)]
    entity: Option<String>,
}

#[derive(Args)]
struct ValidateArgs {
    file: PathBuf,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    records: Option<usize>,

    #[arg(long)]
    repair: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(kira) = report.downcast_ref::<KiraError>() {
                return ExitCode::from(map_exit_code(kira));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::MissingManifest(_)
        | KiraError::ManifestRead { .. }
        | KiraError::MissingReference(_) => 2,
        KiraError::ConfigRead(_) | KiraError::ConfigParse(_) | KiraError::InvalidConfig(_) => 2,
        KiraError::MissingTool(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Run(args) => run_pipeline(args, output_mode),
        Commands::Status(args) => run_status(args, output_mode),
        Commands::Reset(args) => run_reset(args, output_mode),
        Commands::Validate(args) => run_validate(args, output_mode),
    }
}

fn overrides(common: &CommonArgs) -> Config {
    Config {
        manifest: common.manifest.clone(),
        base_dir: common.base_dir.clone(),
        reference: common.reference.clone(),
        parallel_jobs: common.jobs,
        threads_per_job: common.threads,
        ..Config::default()
    }
}

fn resolve(common: &CommonArgs, extra: Config) -> miette::Result<PipelineConfig> {
    let layered = overrides(common).merge(extra);
    Ok(ConfigLoader::resolve(common.config.as_deref(), layered)?)
}

fn run_pipeline(args: RunArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let config = resolve(
        &args.common,
        Config {
            keep_inputs: args.keep_inputs.then_some(true),
            recover_technical_reads: args.recover_technical_reads.then_some(true),
            repair: args.no_repair.then_some(false),
            download_timeout_secs: args.download_timeout,
            ..Config::default()
        },
    )?;

    if args.dry_run {
        let app = App::new(config, NopAcquisition, NopQuant)?;
        let manifest = app.load_manifest()?;
        let plan = app.dry_run(&manifest);
        match output_mode {
            OutputMode::NonInteractive => JsonOutput::print_plan(&plan).into_diagnostic()?,
            OutputMode::Interactive => output::print_plan(&plan),
        }
        return Ok(ExitCode::SUCCESS);
    }

    config.require_reference()?;
    let acquisition = SystemAcquisitionClient::from_config(&config)?;
    let quant = SystemQuantClient::from_config(&config)?;
    let app = App::new(config, acquisition, quant)?;
    let manifest = app.load_manifest()?;

    let summary = match output_mode {
        OutputMode::NonInteractive => {
            let summary = app.run(&manifest, &JsonOutput)?;
            JsonOutput::print_summary(&summary).into_diagnostic()?;
            summary
        }
        OutputMode::Interactive => {
            let summary = app.run(&manifest, &ConsoleProgress)?;
            output::print_run_summary(&summary);
            summary
        }
    };

    if summary.has_failures() {
        Ok(ExitCode::from(EXIT_INCOMPLETE))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn run_status(args: CommonArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let config = resolve(&args, Config::default())?;
    let app = App::new(config, NopAcquisition, NopQuant)?;
    let manifest = app.load_manifest()?;
    let report = app.status(&manifest);
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_status(&report).into_diagnostic()?,
        OutputMode::Interactive => output::print_status(&report),
    }
    Ok(ExitCode::SUCCESS)
}

fn run_reset(args: ResetArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let config = resolve(&args.common, Config::default())?;
    let app = App::new(config, NopAcquisition, NopQuant)?;
    let result = app.reset(args.stage, args.entity.as_deref())?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_reset(&result).into_diagnostic()?,
        OutputMode::Interactive => output::print_reset(&result),
    }
    Ok(ExitCode::SUCCESS)
}

fn run_validate(args: ValidateArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let config = ConfigLoader::resolve(args.config.as_deref(), Config::default())?;
    let records = args.records.unwrap_or(config.validation_records);
    let repair = args.repair.then(|| repair_options(&config));
    let report = app::validate_file(&args.file, records, repair)?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_validation(&report).into_diagnostic()?,
        OutputMode::Interactive => output::print_validation(&report),
    }
    if report.check.is_valid() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_INCOMPLETE))
    }
}

struct NopAcquisition;

impl AcquisitionClient for NopAcquisition {
    fn fetch_run(
        &self,
        _run: &RunId,
        _methods: &[String],
        _threads: usize,
        _format: &str,
        _out_dir: &Path,
        _timeout: Duration,
    ) -> Result<(), KiraError> {
        Err(KiraError::MissingTool("acquisition".to_string()))
    }

    fn recover_technical_reads(
        &self,
        _run: &RunId,
        _out_dir: &Path,
        _threads: usize,
        _timeout: Duration,
    ) -> Result<(), KiraError> {
        Err(KiraError::MissingTool("recovery".to_string()))
    }
}

struct NopQuant;

impl QuantClient for NopQuant {
    fn quantify(&self, _request: &QuantRequest<'_>) -> Result<(), KiraError> {
        Err(KiraError::MissingTool("quantification".to_string()))
    }
}
